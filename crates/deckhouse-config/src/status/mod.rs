//! Keeps the `status` of ModuleConfig and Module resources up to date.
//!
//! Statuses are recomputed on a fixed interval and whenever a ModuleConfig
//! changes. A status is only written when it differs from the stored one, and
//! writes racing with other writers are retried with exponential backoff.

use std::{future::Future, sync::Arc, time::Duration};

use backoff::{ExponentialBackoff, backoff::Backoff};
use futures::{Stream, StreamExt};
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::{
    crd::{Module, ModuleProperties, module::tag_label},
    modules::ModuleManager,
    names::PossibleNames,
    store::{self, ClusterStore},
    validator::ConfigValidator,
};

mod config;
mod metrics;
mod module;

pub use config::{UNKNOWN_MODULE_MESSAGE, config_state, config_status};
pub use metrics::{OBSOLETE_VERSION_METRIC, ObsoleteVersionMetric, encode};
pub use module::refresh_module_status;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to refresh the status of ModuleConfig/{name}"))]
    RefreshModuleConfig { source: store::Error, name: String },

    #[snafu(display("failed to refresh the status of Module/{name}"))]
    RefreshModule { source: store::Error, name: String },

    #[snafu(display("failed to list ModuleConfig resources"))]
    ListModuleConfigs { source: store::Error },

    #[snafu(display("failed to list Module resources"))]
    ListModules { source: store::Error },

    #[snafu(display("failed to register Module/{name}"))]
    RegisterModule { source: store::Error, name: String },
}

/// Upper bound for retrying one status write on conflicts.
const CONFLICT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct StatusReporter {
    store: Arc<dyn ClusterStore>,
    validator: Arc<ConfigValidator>,
    manager: Arc<dyn ModuleManager>,
    possible_names: PossibleNames,
    metric: ObsoleteVersionMetric,
}

impl StatusReporter {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        validator: Arc<ConfigValidator>,
        manager: Arc<dyn ModuleManager>,
        possible_names: PossibleNames,
        metric: ObsoleteVersionMetric,
    ) -> Self {
        Self {
            store,
            validator,
            manager,
            possible_names,
            metric,
        }
    }

    pub fn metric(&self) -> &ObsoleteVersionMetric {
        &self.metric
    }

    /// Creates or updates one Module resource per known module, carrying its
    /// properties and tag labels.
    #[instrument(skip(self))]
    pub async fn register_modules(&self) -> Result<()> {
        for name in self.manager.module_names() {
            let Some(definition) = self.manager.module_definition(&name) else {
                continue;
            };

            let mut module = Module::new(&name, ModuleProperties {
                weight: definition.weight,
                state: module_state(self.manager.as_ref(), &name).to_owned(),
                source: definition.source.clone(),
                description: definition.description.clone(),
            });
            module.metadata.labels = Some(
                definition
                    .tags
                    .iter()
                    .map(|tag| (tag_label(tag), "true".to_owned()))
                    .collect(),
            );

            self.store
                .apply_module(&module)
                .await
                .context(RegisterModuleSnafu { name: &name })?;
        }

        Ok(())
    }

    /// Refreshes every ModuleConfig and Module. Failures of single objects are
    /// logged, the refresh goes on with the next one.
    #[instrument(skip(self))]
    pub async fn refresh_all(&self) -> Result<()> {
        self.metric.reset();

        let configs = self
            .store
            .list_module_configs()
            .await
            .context(ListModuleConfigsSnafu)?;
        for config in &configs {
            let name = config.name_any();
            if let Err(error) = self.refresh_module_config(&name).await {
                warn!(error = &error as &dyn std::error::Error, "status refresh failed");
            }
        }

        let modules = self.store.list_modules().await.context(ListModulesSnafu)?;
        for module in &modules {
            let name = module.name_any();
            if let Err(error) = self.refresh_module(&name).await {
                warn!(error = &error as &dyn std::error::Error, "status refresh failed");
            }
        }

        Ok(())
    }

    /// Recomputes the status of one ModuleConfig. A deleted resource is not an
    /// error.
    pub async fn refresh_module_config(&self, name: &str) -> Result<()> {
        let result = retry_on_conflict(|| self.try_refresh_module_config(name)).await;
        ignore_not_found(result, "ModuleConfig", name).context(RefreshModuleConfigSnafu { name })
    }

    pub async fn refresh_module(&self, name: &str) -> Result<()> {
        let result = retry_on_conflict(|| self.try_refresh_module(name)).await;
        ignore_not_found(result, "Module", name).context(RefreshModuleSnafu { name })
    }

    /// Refreshes all statuses every `interval` and once per item of
    /// `triggers`, until `shutdown` completes.
    pub async fn run<S, F>(&self, interval: Duration, triggers: S, shutdown: F)
    where
        S: Stream<Item = ()>,
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut triggers = std::pin::pin!(triggers.fuse());
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {}
                Some(()) = triggers.next() => {}
            }

            if let Err(error) = self.refresh_all().await {
                warn!(error = &error as &dyn std::error::Error, "failed to refresh statuses");
            }
        }

        info!("status reporter stopped");
    }

    async fn try_refresh_module_config(&self, name: &str) -> Result<(), store::Error> {
        let Some(mut config) = self.store.get_module_config(name).await? else {
            return store::NotFoundSnafu {
                kind: "ModuleConfig",
                name,
            }
            .fail();
        };

        let status = config_status(
            &config,
            &self.possible_names,
            &self.validator,
            self.manager.as_ref(),
        );

        if self.possible_names.contains(name) {
            let latest = self.validator.registry().chain(name).latest_version();
            self.metric.observe(name, config.spec.version, latest);
        }

        if config.current_status() == status {
            debug!(module.name = name, "ModuleConfig status is up to date");
            return Ok(());
        }

        config.status = Some(status);
        self.store.write_module_config_status(&config).await
    }

    async fn try_refresh_module(&self, name: &str) -> Result<(), store::Error> {
        let mut stored = self.get_module(name).await?;

        if self.manager.module_definition(name).is_some() {
            let state = module_state(self.manager.as_ref(), name);
            if stored.properties.state != state {
                info!(module.name = name, state, "Module state changed");
                let mut updated = stored.clone();
                updated.properties.state = state.to_owned();
                self.store.apply_module(&updated).await?;

                // The apply moved the resource version.
                stored = self.get_module(name).await?;
            }
        }

        let mut module = stored.clone();
        refresh_module_status(&mut module, self.manager.as_ref());
        if !module.status_differs(&stored) {
            debug!(module.name = name, "Module status is up to date");
            return Ok(());
        }

        self.store.write_module_status(&module).await
    }

    async fn get_module(&self, name: &str) -> Result<Module, store::Error> {
        match self.store.get_module(name).await? {
            Some(module) => Ok(module),
            None => store::NotFoundSnafu {
                kind: "Module",
                name,
            }
            .fail(),
        }
    }
}

/// `properties.state` of a Module: whether the module manager enables it.
fn module_state(manager: &dyn ModuleManager, name: &str) -> &'static str {
    if manager.is_module_enabled(name) {
        "Enabled"
    } else {
        "Disabled"
    }
}

/// Retries `operation` while it fails with a conflict, backing off
/// exponentially for at most [`CONFLICT_RETRY_TIMEOUT`].
async fn retry_on_conflict<F, Fut>(mut operation: F) -> Result<(), store::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), store::Error>>,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(20),
        max_interval: Duration::from_secs(1),
        max_elapsed_time: Some(CONFLICT_RETRY_TIMEOUT),
        ..ExponentialBackoff::default()
    };

    loop {
        match operation().await {
            Err(error) if error.is_conflict() => match backoff.next_backoff() {
                Some(delay) => {
                    debug!(?delay, "status write conflicted, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error),
            },
            result => return result,
        }
    }
}

fn ignore_not_found(
    result: Result<(), store::Error>,
    kind: &str,
    name: &str,
) -> Result<(), store::Error> {
    match result {
        Err(error) if error.is_not_found() => {
            debug!(kind, name, "object is gone, nothing to refresh");
            Ok(())
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use prometheus::Registry as MetricRegistry;
    use serde_json::json;

    use super::*;
    use crate::{
        conversion::Registry,
        crd::{
            ModuleConfig, ModuleConfigState,
            module::{CONDITION_ENABLED_BY_MODULE_MANAGER, CONDITION_IS_READY},
        },
        modules::{LocalModuleManager, ModuleDefinition, ModuleDirectory},
        openapi::SchemaValidator,
        store::MemoryStore,
    };

    fn manager() -> LocalModuleManager {
        LocalModuleManager::new(ModuleDirectory {
            modules: vec![ModuleDefinition {
                name: "module-one".to_owned(),
                weight: 100,
                tags: vec!["observability".to_owned()],
                ..ModuleDefinition::default()
            }],
            validator: SchemaValidator::new(),
            bundle_defaults: BTreeMap::from([("module-one".to_owned(), false)]),
        })
    }

    fn reporter(store: Arc<MemoryStore>) -> StatusReporter {
        reporter_with_manager(store, Arc::new(manager()))
    }

    fn reporter_with_manager(
        store: Arc<MemoryStore>,
        manager: Arc<LocalModuleManager>,
    ) -> StatusReporter {
        let registry = Registry::new();
        registry
            .register("module-one", 1, 2, |settings| {
                settings.delete_and_clean("paramGroup.obsoleteParam")?;
                Ok(())
            })
            .expect("valid conversion");

        StatusReporter::new(
            store,
            Arc::new(ConfigValidator::new(
                Arc::new(registry),
                Arc::new(SchemaValidator::new()),
            )),
            manager,
            PossibleNames::new(["module-one"]),
            ObsoleteVersionMetric::new().expect("valid metric"),
        )
    }

    fn obsolete_config() -> ModuleConfig {
        ModuleConfig::with_settings(
            "module-one",
            1,
            json!({"a": 1}).as_object().cloned().expect("object"),
        )
    }

    async fn stored_config(store: &MemoryStore, name: &str) -> ModuleConfig {
        store
            .get_module_config(name)
            .await
            .expect("store never fails reads")
            .expect("ModuleConfig exists")
    }

    #[tokio::test]
    async fn writes_status_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert_module_config(obsolete_config());
        let reporter = reporter(store.clone());

        reporter
            .refresh_module_config("module-one")
            .await
            .expect("refresh succeeds");
        let status = stored_config(&store, "module-one").await.current_status();
        assert_eq!(status.version, "1");
        assert!(status.message.starts_with("Update available"));
        assert_eq!(status.state, Some(ModuleConfigState::Disabled));

        reporter
            .refresh_module_config("module-one")
            .await
            .expect("refresh succeeds");
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        let store = Arc::new(MemoryStore::new());
        store.insert_module_config(obsolete_config());
        store.inject_status_conflicts(2);

        reporter(store.clone())
            .refresh_module_config("module-one")
            .await
            .expect("refresh succeeds after conflicts");

        assert_eq!(store.status_writes(), 1);
        assert_eq!(stored_config(&store, "module-one").await.current_status().version, "1");
    }

    #[tokio::test]
    async fn deleted_objects_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let reporter = reporter(store.clone());

        reporter
            .refresh_module_config("module-one")
            .await
            .expect("missing ModuleConfig is not an error");
        reporter
            .refresh_module("module-one")
            .await
            .expect("missing Module is not an error");
        assert_eq!(store.status_writes(), 0);
    }

    #[tokio::test]
    async fn unknown_modules_are_marked_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.insert_module_config(ModuleConfig::with_enabled("module-xyz", true));

        reporter(store.clone()).refresh_all().await.expect("refresh succeeds");

        let status = stored_config(&store, "module-xyz").await.current_status();
        assert_eq!(status.message, UNKNOWN_MODULE_MESSAGE);
        assert_eq!(status.version, "");
    }

    #[tokio::test]
    async fn refresh_all_updates_metric_and_modules() {
        let store = Arc::new(MemoryStore::new());
        store.insert_module_config(obsolete_config());
        let reporter = reporter(store.clone());
        let metrics = MetricRegistry::new();
        reporter.metric().register(&metrics).expect("metric registers");

        reporter.register_modules().await.expect("modules register");
        reporter.refresh_all().await.expect("refresh succeeds");

        let rendered = encode(&metrics).expect("metrics encode");
        assert!(rendered.contains(r#"name="module-one""#), "{rendered}");

        let module = store
            .get_module("module-one")
            .await
            .expect("store never fails reads")
            .expect("Module was registered");
        assert_eq!(module.properties.weight, 100);
        assert_eq!(module.properties.state, "Disabled");
        assert_eq!(
            module.metadata.labels,
            Some(BTreeMap::from([(
                "module.deckhouse.io/observability".to_owned(),
                "true".to_owned()
            )]))
        );
        let ready = module.condition(CONDITION_IS_READY).expect("condition is set");
        assert_eq!(ready.reason, "Disabled");
        assert_eq!(ready.message, "disabled");
    }

    #[tokio::test]
    async fn module_state_follows_enabled_flag() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(manager());
        let reporter = reporter_with_manager(store.clone(), manager.clone());
        reporter.register_modules().await.expect("modules register");
        reporter.refresh_module("module-one").await.expect("refresh succeeds");

        manager.sync_module_configs(&[ModuleConfig::with_enabled("module-one", true)]);
        reporter.refresh_module("module-one").await.expect("refresh succeeds");

        let module = store
            .get_module("module-one")
            .await
            .expect("store never fails reads")
            .expect("Module was registered");
        assert_eq!(module.properties.state, "Enabled");
        assert_eq!(module.properties.weight, 100);
        let enabled = module
            .condition(CONDITION_ENABLED_BY_MODULE_MANAGER)
            .expect("condition is set");
        assert_eq!(enabled.status, "True");
        assert_eq!(store.status_writes(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        store.insert_module_config(obsolete_config());
        let reporter = reporter(store.clone());

        reporter
            .run(
                Duration::from_millis(10),
                futures::stream::pending::<()>(),
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await;

        assert_eq!(store.status_writes(), 1);
    }
}
