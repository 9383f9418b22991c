//! Startup migration from the legacy ConfigMap to ModuleConfig resources, and
//! the steady-state sync of ModuleConfig resources into the generated
//! ConfigMap.
//!
//! The phase is derived from cluster state alone, so a crash at any point
//! resumes where it stopped:
//!
//! 1. The deployment still reads the legacy ConfigMap: copy it into the
//!    generated ConfigMap, mark that one with the migration annotation and
//!    point the deployment at it. The deployment restarts the process.
//! 2. The generated ConfigMap carries the annotation: create ModuleConfig
//!    resources from its content, then rewrite it from those resources and
//!    drop the annotation in the same write.
//! 3. Otherwise every change of ModuleConfig resources re-emits the generated
//!    ConfigMap.

use std::{collections::BTreeMap, sync::Arc};

use futures::{Stream, StreamExt};
use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use snafu::{ResultExt, Snafu};
use strum::Display;
use tracing::{debug, info, instrument, warn};

use crate::{
    aggregated::AggregatedData,
    constants::{
        CONFIG_MAP_ENV, CONTAINER_NAME, DEPLOYMENT_NAME, GENERATED_CONFIG_MAP_NAME,
        LEGACY_CONFIG_MAP_NAME, MIGRATION_IN_PROGRESS_ANNOTATION,
    },
    crd::ModuleConfig,
    store::{self, ClusterStore},
    transformer::{self, Transformer},
    validator::ConfigValidator,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get ConfigMap/{name}"))]
    GetConfigMap { source: store::Error, name: String },

    #[snafu(display("failed to write ConfigMap/{name}"))]
    WriteConfigMap { source: store::Error, name: String },

    #[snafu(display("failed to point Deployment/{name} at ConfigMap/{config_map}"))]
    PatchDeployment {
        source: store::Error,
        name: String,
        config_map: String,
    },

    #[snafu(display("failed to create ModuleConfig/{name}"))]
    ApplyModuleConfig { source: store::Error, name: String },

    #[snafu(display("failed to list ModuleConfig resources"))]
    ListModuleConfigs { source: store::Error },

    #[snafu(display("failed to build ConfigMap/{name} from ModuleConfig resources"))]
    BuildConfigMap {
        source: transformer::Error,
        name: String,
    },
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Phase {
    /// The deployment reads the legacy ConfigMap.
    MigrateDeployment,

    /// The generated ConfigMap still has to be turned into ModuleConfig
    /// resources.
    MigrateModuleConfigs,

    Sync,
}

/// Picks the startup phase from the ConfigMap the deployment reads and the
/// current generated ConfigMap.
pub fn detect_phase(config_map_env: &str, generated: Option<&ConfigMap>) -> Phase {
    if config_map_env == LEGACY_CONFIG_MAP_NAME {
        return Phase::MigrateDeployment;
    }

    let migrating = generated
        .and_then(|config_map| config_map.metadata.annotations.as_ref())
        .is_some_and(|annotations| annotations.contains_key(MIGRATION_IN_PROGRESS_ANNOTATION));
    if migrating {
        Phase::MigrateModuleConfigs
    } else {
        Phase::Sync
    }
}

/// Result of one steady-state sync.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// ModuleConfig resources that passed validation, settings converted to
    /// the latest version.
    pub configs: Vec<ModuleConfig>,

    pub data: AggregatedData,

    /// Keys of the previous generated ConfigMap missing from the new one.
    pub dropped_keys: Vec<String>,

    /// The generated ConfigMap was rewritten.
    pub updated: bool,
}

#[derive(Debug)]
pub struct BootstrapController {
    store: Arc<dyn ClusterStore>,
    transformer: Transformer,
    validator: Arc<ConfigValidator>,
}

impl BootstrapController {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        transformer: Transformer,
        validator: Arc<ConfigValidator>,
    ) -> Self {
        Self {
            store,
            transformer,
            validator,
        }
    }

    /// Runs the startup phase. After [`Phase::MigrateDeployment`] the process
    /// is expected to be restarted by the deployment rollout.
    #[instrument(skip(self))]
    pub async fn run_startup(&self, config_map_env: &str) -> Result<Phase> {
        let generated = self.get_config_map(GENERATED_CONFIG_MAP_NAME).await?;
        let phase = detect_phase(config_map_env, generated.as_ref());
        info!(%phase, "running startup phase");

        match phase {
            Phase::MigrateDeployment => self.migrate_deployment().await?,
            Phase::MigrateModuleConfigs => {
                let data = generated.and_then(|config_map| config_map.data).unwrap_or_default();
                self.migrate_module_configs(&data).await?;
            }
            Phase::Sync => {
                self.sync().await?;
            }
        }

        Ok(phase)
    }

    /// Copies the legacy ConfigMap into the annotated generated ConfigMap and
    /// points the deployment at it.
    async fn migrate_deployment(&self) -> Result<()> {
        let data = self
            .get_config_map(LEGACY_CONFIG_MAP_NAME)
            .await?
            .and_then(|config_map| config_map.data)
            .unwrap_or_default();

        info!(
            keys = data.len(),
            from = LEGACY_CONFIG_MAP_NAME,
            to = GENERATED_CONFIG_MAP_NAME,
            "copying legacy ConfigMap"
        );
        self.write_generated(data, true).await?;

        self.store
            .set_deployment_env(
                DEPLOYMENT_NAME,
                CONTAINER_NAME,
                CONFIG_MAP_ENV,
                GENERATED_CONFIG_MAP_NAME,
            )
            .await
            .context(PatchDeploymentSnafu {
                name: DEPLOYMENT_NAME,
                config_map: GENERATED_CONFIG_MAP_NAME,
            })?;

        info!(
            k8s.deployment.name = DEPLOYMENT_NAME,
            "deployment now reads the generated ConfigMap, waiting for restart"
        );
        Ok(())
    }

    /// Creates ModuleConfig resources from the generated ConfigMap, then
    /// rewrites it from them without the migration annotation.
    async fn migrate_module_configs(&self, data: &AggregatedData) -> Result<()> {
        let result = self.transformer.aggregated_to_module_configs(data);
        for message in &result.messages {
            warn!(message, "ConfigMap section skipped");
        }

        let mut created = Vec::with_capacity(result.configs.len());
        for mut config in result.configs {
            let name = config.module_name();
            let validation = self.validator.convert_to_latest(&config);
            if validation.has_error() {
                warn!(
                    module.name = name,
                    error = validation.error(),
                    "ModuleConfig is invalid, not creating it"
                );
                continue;
            }
            config.set_settings(validation.version, validation.settings);

            // The annotation has to outlive a failed write, the next boot
            // repeats this phase.
            self.store
                .apply_module_config(&config)
                .await
                .context(ApplyModuleConfigSnafu { name: &name })?;

            info!(module.name = name, "created ModuleConfig");
            created.push(config);
        }

        let data = self
            .transformer
            .module_configs_to_aggregated(&created)
            .context(BuildConfigMapSnafu {
                name: GENERATED_CONFIG_MAP_NAME,
            })?;
        self.write_generated(data, false).await?;

        info!(
            module_configs = created.len(),
            "migration to ModuleConfig resources finished"
        );
        Ok(())
    }

    /// Re-emits the generated ConfigMap from all valid ModuleConfig
    /// resources. Only writes when the content changed.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<SyncReport> {
        let configs = self
            .store
            .list_module_configs()
            .await
            .context(ListModuleConfigsSnafu)?;

        let mut valid = Vec::with_capacity(configs.len());
        for mut config in configs {
            let name = config.module_name();
            if !self.transformer.possible_names().contains(&name) {
                debug!(module.name = name, "ignoring ModuleConfig of unknown module");
                continue;
            }

            let validation = self.validator.validate(&config);
            if validation.has_error() {
                warn!(
                    module.name = name,
                    error = validation.error(),
                    "ModuleConfig is invalid, leaving it out of the generated ConfigMap"
                );
                continue;
            }
            config.set_settings(validation.version, validation.settings);
            valid.push(config);
        }

        let data = self
            .transformer
            .module_configs_to_aggregated(&valid)
            .context(BuildConfigMapSnafu {
                name: GENERATED_CONFIG_MAP_NAME,
            })?;

        let previous = self
            .get_config_map(GENERATED_CONFIG_MAP_NAME)
            .await?
            .and_then(|config_map| config_map.data)
            .unwrap_or_default();

        let dropped_keys: Vec<String> = previous
            .keys()
            .filter(|key| !data.contains_key(*key))
            .cloned()
            .collect();
        if !dropped_keys.is_empty() {
            info!(?dropped_keys, "keys dropped from the generated ConfigMap");
        }

        let updated = previous != data;
        if updated {
            self.write_generated(data.clone(), false).await?;
        }

        Ok(SyncReport {
            configs: valid,
            data,
            dropped_keys,
            updated,
        })
    }

    /// Runs [`Self::sync`] for every item of `triggers` until the stream ends.
    /// Failed syncs are logged and retried on the next trigger.
    pub async fn run_sync_loop<S, F>(&self, triggers: S, mut on_sync: F)
    where
        S: Stream<Item = ()> + Send,
        F: FnMut(&SyncReport) + Send,
    {
        let mut triggers = std::pin::pin!(triggers);
        while triggers.next().await.is_some() {
            match self.sync().await {
                Ok(report) => on_sync(&report),
                Err(error) => warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to sync the generated ConfigMap"
                ),
            }
        }
        debug!("sync loop stopped");
    }

    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>> {
        self.store
            .get_config_map(name)
            .await
            .context(GetConfigMapSnafu { name })
    }

    async fn write_generated(&self, data: AggregatedData, migrating: bool) -> Result<()> {
        let annotations = migrating.then(|| {
            BTreeMap::from([(MIGRATION_IN_PROGRESS_ANNOTATION.to_owned(), "true".to_owned())])
        });

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(GENERATED_CONFIG_MAP_NAME.to_owned()),
                annotations,
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..ConfigMap::default()
        };

        self.store
            .apply_config_map(&config_map)
            .await
            .context(WriteConfigMapSnafu {
                name: GENERATED_CONFIG_MAP_NAME,
            })
    }
}
