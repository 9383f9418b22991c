//! The first configuration handed to the hook runtime at startup.
//!
//! The runtime expects a valid `{global, modules}` structure before it starts
//! any hook. It is assembled from the ConfigMap the deployment points at:
//! either straight from its content while a migration is in progress, or from
//! the current ModuleConfig resources otherwise.

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tracing::{info, warn};

use crate::{
    aggregated::{self, AggregatedData, parse_sections},
    constants::{ENABLED_KEY_SUFFIX, MIGRATION_IN_PROGRESS_ANNOTATION},
    names::{PossibleNames, is_global, module_name_from_values_key},
    settings::SettingsValues,
    store::{self, ClusterStore},
    transformer::{self, Transformer},
    validator::ConfigValidator,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get ConfigMap/{name}"))]
    GetConfigMap { source: store::Error, name: String },

    #[snafu(display("failed to list ModuleConfig resources"))]
    ListModuleConfigs { source: store::Error },

    #[snafu(display("failed to parse ConfigMap/{name}"))]
    ParseConfigMap {
        source: aggregated::Error,
        name: String,
    },

    #[snafu(display("failed to convert section {values_key:?} of ConfigMap/{name}"))]
    ConvertSection {
        source: aggregated::Error,
        name: String,
        values_key: String,
    },

    #[snafu(display("failed to build the aggregated document from ModuleConfig resources"))]
    BuildAggregated { source: transformer::Error },

    #[snafu(display("failed to parse the aggregated document built from ModuleConfig resources"))]
    ParseGenerated { source: aggregated::Error },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalKubeConfig {
    pub values: SettingsValues,
    pub checksum: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleKubeConfig {
    pub module_name: String,
    pub values: SettingsValues,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_enabled: Option<bool>,
    pub checksum: String,
}

/// Configuration of the hook runtime, with a checksum per section so the
/// runtime can tell which modules changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalKubeConfig>,
    pub modules: BTreeMap<String, ModuleKubeConfig>,
}

impl KubeConfig {
    /// Parses an aggregated document as is, without conversions.
    pub fn from_aggregated(
        data: &AggregatedData,
        possible_names: &PossibleNames,
    ) -> Result<Self, aggregated::Error> {
        let mut config = Self::default();

        for section in parse_sections(data, possible_names).into_sections()? {
            let values = section.values_map()?.unwrap_or_default();
            let checksum = checksum(&values, section.enabled);

            if is_global(&section.name) {
                config.global = Some(GlobalKubeConfig { values, checksum });
                continue;
            }

            config.modules.insert(section.name.clone(), ModuleKubeConfig {
                module_name: section.name,
                values,
                is_enabled: section.enabled,
                checksum,
            });
        }

        Ok(config)
    }
}

/// Names of the modules mentioned by the keys of an aggregated document.
pub fn possible_names_from_keys(data: &AggregatedData) -> PossibleNames {
    PossibleNames::new(data.keys().map(|key| {
        let values_key = key.strip_suffix(ENABLED_KEY_SUFFIX).unwrap_or(key);
        module_name_from_values_key(values_key)
    }))
}

#[derive(Debug)]
pub struct InitialConfigLoader {
    store: Arc<dyn ClusterStore>,
    validator: Arc<ConfigValidator>,
}

impl InitialConfigLoader {
    pub fn new(store: Arc<dyn ClusterStore>, validator: Arc<ConfigValidator>) -> Self {
        Self { store, validator }
    }

    /// Loads the initial configuration from ConfigMap `name`. Returns
    /// [`None`] when the ConfigMap does not exist.
    pub async fn load(&self, name: &str) -> Result<Option<KubeConfig>> {
        let Some(config_map) = self
            .store
            .get_config_map(name)
            .await
            .context(GetConfigMapSnafu { name })?
        else {
            info!(k8s.configmap.name = name, "ConfigMap not found, no initial config");
            return Ok(None);
        };

        let data = config_map.data.unwrap_or_default();
        let migrating = config_map
            .metadata
            .annotations
            .is_some_and(|annotations| annotations.contains_key(MIGRATION_IN_PROGRESS_ANNOTATION));

        let config = if migrating {
            info!(k8s.configmap.name = name, "migration in progress, using ConfigMap content");
            self.from_legacy(name, &data)?
        } else {
            self.from_module_configs(&data).await?
        };

        Ok(Some(config))
    }

    /// Treats every section as version 1 and converts it to the latest
    /// version.
    fn from_legacy(&self, name: &str, data: &AggregatedData) -> Result<KubeConfig> {
        let possible_names = possible_names_from_keys(data);
        let parsed = parse_sections(data, &possible_names);
        for invalid in &parsed.invalid {
            warn!(
                k8s.configmap.name = name,
                values_key = invalid.values_key,
                error = &invalid.error as &dyn std::error::Error,
                "skipping section that failed to parse"
            );
        }

        let mut converted = AggregatedData::new();
        for mut section in parsed.sections {
            let (_, values) = section.convert(self.validator.registry()).context(ConvertSectionSnafu {
                name,
                values_key: &section.values_key,
            })?;

            section.values = SettingsValues::new();
            if let Some(values) = values {
                section
                    .values
                    .insert(section.values_key.clone(), Value::Object(values));
            }

            let section_data = section.to_aggregated().context(ConvertSectionSnafu {
                name,
                values_key: &section.values_key,
            })?;
            converted.extend(section_data);
        }

        KubeConfig::from_aggregated(&converted, &possible_names).context(ParseConfigMapSnafu { name })
    }

    /// Builds the configuration from ModuleConfig resources of the modules
    /// the ConfigMap knows about. Resources failing conversion are skipped,
    /// schema validation is left to the runtime.
    async fn from_module_configs(&self, data: &AggregatedData) -> Result<KubeConfig> {
        let possible_names = possible_names_from_keys(data);
        let configs = self
            .store
            .list_module_configs()
            .await
            .context(ListModuleConfigsSnafu)?;

        let mut converted = Vec::with_capacity(configs.len());
        for mut config in configs {
            let name = config.module_name();
            if !possible_names.contains(&name) {
                continue;
            }

            let result = self.validator.convert_to_latest(&config);
            if result.has_error() {
                warn!(module.name = name, error = result.error(), "skipping ModuleConfig");
                continue;
            }
            config.set_settings(result.version, result.settings);
            converted.push(config);
        }

        let transformer =
            Transformer::new(possible_names.clone(), self.validator.registry().clone());
        let aggregated = transformer
            .module_configs_to_aggregated(&converted)
            .context(BuildAggregatedSnafu)?;

        KubeConfig::from_aggregated(&aggregated, &possible_names).context(ParseGeneratedSnafu)
    }
}

fn checksum(values: &SettingsValues, enabled: Option<bool>) -> String {
    let mut hasher = Sha256::new();
    // Keys are sorted, equal values hash equally.
    hasher.update(serde_json::to_vec(values).unwrap_or_default());
    if let Some(enabled) = enabled {
        hasher.update(if enabled { b"true" as &[u8] } else { b"false" });
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};
    use serde_json::json;

    use super::*;
    use crate::{
        conversion::Registry,
        crd::ModuleConfig,
        openapi::SchemaValidator,
        store::MemoryStore,
    };

    const NAME: &str = "deckhouse-generated-config-do-not-edit";

    fn values(value: Value) -> SettingsValues {
        value.as_object().cloned().expect("object")
    }

    fn config_map(data: &[(&str, &str)], migrating: bool) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(NAME.to_owned()),
                annotations: migrating.then(|| {
                    BTreeMap::from([(MIGRATION_IN_PROGRESS_ANNOTATION.to_owned(), "true".to_owned())])
                }),
                ..ObjectMeta::default()
            },
            data: Some(
                data.iter()
                    .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                    .collect(),
            ),
            ..ConfigMap::default()
        }
    }

    fn loader(store: Arc<MemoryStore>) -> InitialConfigLoader {
        let registry = Registry::new();
        registry
            .register("module-one", 1, 2, |settings| {
                settings.delete_and_clean("paramGroup.obsoleteParam")?;
                Ok(())
            })
            .expect("valid conversion");
        let validator = ConfigValidator::new(Arc::new(registry), Arc::new(SchemaValidator::new()));

        InitialConfigLoader::new(store, Arc::new(validator))
    }

    #[tokio::test]
    async fn missing_config_map_means_no_initial_config() {
        let store = Arc::new(MemoryStore::new());
        let config = loader(store).load(NAME).await.expect("load succeeds");

        assert_eq!(config, None);
    }

    #[tokio::test]
    async fn migrating_config_map_is_converted_as_version_one() {
        let store = Arc::new(MemoryStore::new());
        store.insert_config_map(config_map(
            &[
                ("global", "param: v\n"),
                ("moduleOne", "paramGroup:\n  param1: v1\n  obsoleteParam: v2\n"),
                ("moduleOneEnabled", "true"),
            ],
            true,
        ));

        let config = loader(store)
            .load(NAME)
            .await
            .expect("load succeeds")
            .expect("ConfigMap exists");

        let global = config.global.expect("global section is present");
        assert_eq!(global.values, values(json!({"param": "v"})));
        assert!(!global.checksum.is_empty());

        let module = &config.modules["module-one"];
        assert_eq!(module.values, values(json!({"paramGroup": {"param1": "v1"}})));
        assert_eq!(module.is_enabled, Some(true));
    }

    #[tokio::test]
    async fn migrating_config_map_skips_sections_failing_to_parse() {
        let store = Arc::new(MemoryStore::new());
        store.insert_config_map(config_map(
            &[("moduleOne", "a: 1\n"), ("moduleTwoEnabled", "yes")],
            true,
        ));

        let config = loader(store)
            .load(NAME)
            .await
            .expect("load succeeds")
            .expect("ConfigMap exists");

        assert_eq!(
            config.modules.keys().map(String::as_str).collect::<Vec<_>>(),
            ["module-one"]
        );
        assert_eq!(config.modules["module-one"].values, values(json!({"a": 1})));
    }

    #[tokio::test]
    async fn module_configs_are_used_outside_of_migration() {
        let store = Arc::new(MemoryStore::new());
        store.insert_config_map(config_map(
            &[
                ("moduleOne", "stale: true\n"),
                ("moduleTwoEnabled", "false"),
                ("moduleThreeEnabled", "true"),
            ],
            false,
        ));

        let mut one = ModuleConfig::with_settings(
            "module-one",
            1,
            values(json!({"paramGroup": {"param1": "v1", "obsoleteParam": "v2"}})),
        );
        one.spec.enabled = Some(true);
        store.insert_module_config(one);
        store.insert_module_config(ModuleConfig::with_enabled("module-two", true));
        store.insert_module_config(ModuleConfig::with_enabled("module-unlisted", true));
        store.insert_module_config(ModuleConfig::with_settings(
            "module-three",
            7,
            values(json!({"a": 1})),
        ));

        let config = loader(store)
            .load(NAME)
            .await
            .expect("load succeeds")
            .expect("ConfigMap exists");

        assert_eq!(config.global, None);
        assert_eq!(
            config.modules.keys().map(String::as_str).collect::<Vec<_>>(),
            ["module-one", "module-two"]
        );
        assert_eq!(
            config.modules["module-one"].values,
            values(json!({"paramGroup": {"param1": "v1"}}))
        );
        assert_eq!(config.modules["module-two"].is_enabled, Some(true));
    }

    #[test]
    fn checksum_depends_on_values_and_flag() {
        let values = values(json!({"a": 1}));

        assert_eq!(checksum(&values, None), checksum(&values.clone(), None));
        assert_ne!(checksum(&values, None), checksum(&values, Some(true)));
        assert_ne!(checksum(&values, Some(true)), checksum(&values, Some(false)));
    }
}
