use std::{future::ready, sync::Arc};

use axum::{Router, http::StatusCode, routing::get};
use clap::Parser;
use deckhouse_config::{
    admission::{
        self, AdmissionRules, validate_config_map, validate_module, validate_module_config,
    },
    bootstrap::{self, BootstrapController, Phase},
    cli::{Cli, Command, ModuleSourceOptions, RunArguments},
    constants::CONFIG_MAP_ENV,
    conversion::Registry,
    crd::{Module, ModuleConfig},
    initial_config::{self, InitialConfigLoader},
    logging::{LOG_ENV, initialize_logging},
    modules::{self, LocalModuleManager, ModuleDirectory, ModuleManager},
    names::PossibleNames,
    service::{AlreadyInitializedError, ConfigService},
    status::{self, ObsoleteVersionMetric, StatusReporter},
    store::{ClusterStore, KubeStore},
    transformer::Transformer,
    utils::signal::{ShutdownSignal, SignalError},
    validator::ConfigValidator,
};
use deckhouse_webhook::{ValidatingWebhook, Webhook, WebhookOptions, WebhookServer};
use futures::{StreamExt, channel::mpsc, future};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    Api, Client, CustomResourceExt,
    core::admission::AdmissionRequest,
    runtime::{WatchStreamExt, watcher},
};
use snafu::{ResultExt, Snafu};
use tokio::sync::oneshot;

const APP_NAME: &str = "deckhouse-controller";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to serialize the ModuleConfig CRD"))]
    SerializeCrd { source: serde_yaml::Error },

    #[snafu(display("failed to serialize the initial config"))]
    SerializeInitialConfig { source: serde_json::Error },

    #[snafu(display("failed to load modules"))]
    LoadModules { source: modules::discovery::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to load the initial config from ConfigMap/{name}"))]
    LoadInitialConfig {
        source: initial_config::Error,
        name: String,
    },

    #[snafu(display("failed to run the startup phase"))]
    Startup { source: bootstrap::Error },

    #[snafu(display("failed to register Module resources"))]
    RegisterModules { source: status::Error },

    #[snafu(display("failed to register the obsolete version metric"))]
    RegisterMetric { source: prometheus::Error },

    #[snafu(display("failed to initialize the config service"))]
    InitService { source: AlreadyInitializedError },

    #[snafu(display("failed to watch for shutdown signals"))]
    WatchSignals { source: SignalError },

    #[snafu(display("failed to create the webhook server"))]
    CreateWebhookServer {
        source: deckhouse_webhook::WebhookError,
    },

    #[snafu(display("failed to run the webhook server"))]
    RunWebhookServer {
        source: deckhouse_webhook::WebhookError,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    initialize_logging(LOG_ENV, APP_NAME, cli.log_format);

    match cli.command {
        Command::Crd => {
            let crd = serde_yaml::to_string(&ModuleConfig::crd()).context(SerializeCrdSnafu)?;
            print!("{crd}");
        }
        Command::InitialConfig(source) => print_initial_config(source).await?,
        Command::Run(run) => run_controller(run).await?,
    }

    Ok(())
}

/// Modules, conversions and schemas found in the module directories.
struct Loaded {
    registry: Arc<Registry>,
    manager: Arc<LocalModuleManager>,
    validator: Arc<ConfigValidator>,
}

fn load_modules(source: &ModuleSourceOptions) -> Result<Loaded, Error> {
    let registry = Registry::new();
    let directory = ModuleDirectory::load(
        &source.modules_dir,
        source.global_schema.as_deref(),
        &source.bundle,
        &registry,
    )
    .context(LoadModulesSnafu)?;
    tracing::info!(modules = directory.modules.len(), "loaded module definitions");

    let registry = Arc::new(registry);
    let manager = Arc::new(LocalModuleManager::new(directory));
    let validator = Arc::new(ConfigValidator::new(
        registry.clone(),
        manager.values_validator(),
    ));

    Ok(Loaded {
        registry,
        manager,
        validator,
    })
}

async fn print_initial_config(source: ModuleSourceOptions) -> Result<(), Error> {
    let Loaded { validator, .. } = load_modules(&source)?;
    let client = Client::try_default().await.context(CreateClientSnafu)?;
    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client, &source.namespace));

    let config = InitialConfigLoader::new(store, validator)
        .load(&source.config_map)
        .await
        .context(LoadInitialConfigSnafu {
            name: &source.config_map,
        })?;
    let json = serde_json::to_string_pretty(&config).context(SerializeInitialConfigSnafu)?;
    println!("{json}");

    Ok(())
}

async fn run_controller(run: RunArguments) -> Result<(), Error> {
    let Loaded {
        registry,
        manager,
        validator,
    } = load_modules(&run.source)?;
    let possible_names = PossibleNames::new(manager.module_names());

    let client = Client::try_default().await.context(CreateClientSnafu)?;
    let store: Arc<dyn ClusterStore> =
        Arc::new(KubeStore::new(client.clone(), &run.source.namespace));

    let bootstrap = BootstrapController::new(
        store.clone(),
        Transformer::new(possible_names.clone(), registry),
        validator.clone(),
    );
    let phase = bootstrap
        .run_startup(&run.source.config_map)
        .await
        .context(StartupSnafu)?;
    if phase == Phase::MigrateDeployment {
        tracing::info!(
            env = CONFIG_MAP_ENV,
            "deployment now reads the generated ConfigMap, waiting for the rollout to restart the controller"
        );
        return Ok(());
    }

    let metrics = prometheus::Registry::new();
    let metric = ObsoleteVersionMetric::new().context(RegisterMetricSnafu)?;
    metric.register(&metrics).context(RegisterMetricSnafu)?;

    let module_manager: Arc<dyn ModuleManager> = manager.clone();
    let service = ConfigService {
        module_manager: module_manager.clone(),
        possible_names: possible_names.clone(),
        validator: validator.clone(),
        status_reporter: Arc::new(StatusReporter::new(
            store,
            validator,
            module_manager,
            possible_names,
            metric,
        )),
    }
    .init()
    .context(InitServiceSnafu)?;

    service
        .status_reporter
        .register_modules()
        .await
        .context(RegisterModulesSnafu)?;

    let shutdown = ShutdownSignal::terminate_or_interrupt().context(WatchSignalsSnafu)?;

    // Shutdown order: ModuleConfig watcher and sync loop, status reporter,
    // webhook server. Each stage starts stopping once the previous finished.
    let (status_tx, status_rx) = mpsc::channel::<()>(1);
    let (sync_stopped_tx, sync_stopped_rx) = oneshot::channel::<()>();
    let (status_stopped_tx, status_stopped_rx) = oneshot::channel::<()>();

    let module_configs = watcher(Api::<ModuleConfig>::all(client), watcher::Config::default())
        .default_backoff()
        .filter_map(|event| {
            ready(match event {
                Ok(
                    watcher::Event::Apply(_)
                    | watcher::Event::Delete(_)
                    | watcher::Event::InitDone,
                ) => Some(()),
                Ok(_) => None,
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "ModuleConfig watch failed"
                    );
                    None
                }
            })
        })
        .take_until(shutdown.handle());

    let sync = async move {
        let mut status_tx = status_tx;
        bootstrap
            .run_sync_loop(module_configs, |report| {
                manager.sync_module_configs(&report.configs);
                // A full channel already has a refresh queued.
                status_tx.try_send(()).ok();
            })
            .await;
        sync_stopped_tx.send(()).ok();
        Ok::<_, Error>(())
    };

    let refresh_interval = run.status_refresh_interval;
    let reporter = async move {
        service
            .status_reporter
            .run(refresh_interval, status_rx, async {
                sync_stopped_rx.await.ok();
            })
            .await;
        status_stopped_tx.send(()).ok();
        Ok::<_, Error>(())
    };

    let webhook_options = WebhookOptions::builder()
        .bind_address(run.webhook_bind_address, run.webhook_port)
        .tls_paths(run.tls_cert_path, run.tls_key_path)
        .build();
    let rules = Arc::new(
        AdmissionRules::new(
            service.validator.clone(),
            service.possible_names.clone(),
            run.source.config_map,
        )
        .with_platform_service_account(run.platform_service_account),
    );
    let server = WebhookServer::new(metrics_router(metrics), webhooks(&rules), &webhook_options)
        .context(CreateWebhookServerSnafu)?;
    let webhook = async move {
        server
            .run(async {
                status_stopped_rx.await.ok();
            })
            .await
            .context(RunWebhookServerSnafu)
    };

    future::try_join3(sync, reporter, webhook).await?;
    tracing::info!("controller stopped");

    Ok(())
}

fn webhooks(rules: &Arc<AdmissionRules>) -> Vec<Box<dyn Webhook + Send>> {
    vec![
        Box::new(ValidatingWebhook::new(
            admission::MODULE_CONFIG_PATH,
            |rules: Arc<AdmissionRules>, request: AdmissionRequest<ModuleConfig>| {
                ready(validate_module_config(&rules, &request))
            },
            rules.clone(),
        )),
        Box::new(ValidatingWebhook::new(
            admission::MODULE_PATH,
            |rules: Arc<AdmissionRules>, request: AdmissionRequest<Module>| {
                ready(validate_module(&rules, &request))
            },
            rules.clone(),
        )),
        Box::new(ValidatingWebhook::new(
            admission::CONFIG_MAP_PATH,
            |rules: Arc<AdmissionRules>, request: AdmissionRequest<ConfigMap>| {
                ready(validate_config_map(&rules, &request))
            },
            rules.clone(),
        )),
    ]
}

fn metrics_router(registry: prometheus::Registry) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            ready(match status::encode(&registry) {
                Ok(text) => (StatusCode::OK, text),
                Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
            })
        }),
    )
}
