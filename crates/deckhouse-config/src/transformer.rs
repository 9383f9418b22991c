//! Conversion between the aggregated ConfigMap and ModuleConfig resources.

use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::{
    aggregated::{self, AggregatedData, AggregatedSection, parse_sections},
    conversion::Registry,
    crd::ModuleConfig,
    names::{PossibleNames, values_key},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize ModuleConfig/{name} into the aggregated document"))]
    SerializeModuleConfig {
        source: aggregated::Error,
        name: String,
    },
}

/// ModuleConfig resources built from an aggregated document, plus one message
/// per section that was skipped.
#[derive(Debug, Default)]
pub struct TransformResult {
    pub configs: Vec<ModuleConfig>,
    pub messages: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Transformer {
    possible_names: PossibleNames,
    registry: Arc<Registry>,
}

impl Transformer {
    pub fn new(possible_names: PossibleNames, registry: Arc<Registry>) -> Self {
        Self {
            possible_names,
            registry,
        }
    }

    pub fn possible_names(&self) -> &PossibleNames {
        &self.possible_names
    }

    /// Builds ModuleConfig resources from the sections of `data`, converted to
    /// their latest version.
    ///
    /// Unknown modules and sections failing to parse or convert are skipped
    /// with a message instead of failing the whole document.
    pub fn aggregated_to_module_configs(&self, data: &AggregatedData) -> TransformResult {
        let mut result = TransformResult::default();

        let parsed = parse_sections(data, &self.possible_names);
        for values_key in parsed.unknown {
            result
                .messages
                .push(format!("{values_key}: unknown module name, section is ignored"));
        }
        for invalid in parsed.invalid {
            result
                .messages
                .push(format!("{}: {}", invalid.values_key, invalid.error));
        }

        for section in parsed.sections {
            match section.to_module_config(&self.registry) {
                Ok(Some(config)) => result.configs.push(config),
                Ok(None) => debug!(module.name = section.name, "section has no content"),
                Err(error) => result
                    .messages
                    .push(format!("{}: {error}", section.values_key)),
            }
        }

        result
    }

    /// Serializes ModuleConfig resources of known modules into an aggregated
    /// document. Settings are written as they are, without conversion.
    pub fn module_configs_to_aggregated(&self, configs: &[ModuleConfig]) -> Result<AggregatedData> {
        let mut data = AggregatedData::new();

        for config in configs {
            let name = config.module_name();
            if !self.possible_names.contains(&name) {
                continue;
            }

            let section = section_of(&name, config);
            let section_data = section
                .to_aggregated()
                .context(SerializeModuleConfigSnafu { name })?;
            data.extend(section_data);
        }

        Ok(data)
    }
}

fn section_of(name: &str, config: &ModuleConfig) -> AggregatedSection {
    let mut section = AggregatedSection::new(name);
    if let Some(settings) = config.spec.settings.clone().filter(|s| !s.is_empty()) {
        section
            .values
            .insert(values_key(name), serde_json::Value::Object(settings));
    }
    section.enabled = config.spec.enabled;
    section
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::settings::SettingsValues;

    fn values(value: serde_json::Value) -> SettingsValues {
        value.as_object().cloned().expect("object")
    }

    fn data(entries: &[(&str, &str)]) -> AggregatedData {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn transformer() -> Transformer {
        let registry = Registry::new();
        for module in ["global", "module-one"] {
            registry
                .register(module, 1, 2, |settings| {
                    settings.delete_and_clean("paramGroup.obsoleteParam")?;
                    Ok(())
                })
                .expect("valid conversion");
        }

        Transformer::new(
            PossibleNames::new(["module-one", "module-two"]),
            Arc::new(registry),
        )
    }

    #[test]
    fn empty_document_yields_nothing() {
        let result = transformer().aggregated_to_module_configs(&AggregatedData::new());

        assert!(result.configs.is_empty());
        assert!(result.messages.is_empty());
    }

    #[test]
    fn converts_sections_and_skips_unknown_modules() {
        let result = transformer().aggregated_to_module_configs(&data(&[
            ("global", "paramGroup:\n  param1: v1\n  obsoleteParam: v2\n"),
            ("moduleOne", "paramGroup:\n  param1: v1\n  obsoleteParam: v2\n"),
            ("moduleTwoEnabled", "true"),
            ("moduleXyz", "param: 1\n"),
        ]));

        let configs: BTreeMap<_, _> = result
            .configs
            .iter()
            .map(|config| (config.module_name(), config.spec.clone()))
            .collect();

        assert_eq!(configs.len(), 3);
        assert_eq!(configs["global"].version, 2);
        assert_eq!(
            configs["module-one"].settings,
            Some(values(json!({"paramGroup": {"param1": "v1"}})))
        );
        assert_eq!(configs["module-two"].enabled, Some(true));
        assert_eq!(configs["module-two"].version, 0);
        assert_eq!(result.messages.len(), 1);
        assert!(result.messages[0].starts_with("moduleXyz"));
    }

    #[test]
    fn invalid_sections_produce_messages() {
        let result = transformer()
            .aggregated_to_module_configs(&data(&[("moduleOne", "42"), ("moduleTwoEnabled", "true")]));

        assert_eq!(result.configs.len(), 1);
        assert_eq!(result.messages.len(), 1);
        assert!(result.messages[0].contains("must be an object"));
    }

    #[test]
    fn malformed_key_keeps_other_sections() {
        let result = transformer().aggregated_to_module_configs(&data(&[
            ("moduleOne", "a: 1\n"),
            ("moduleTwoEnabled", "yes"),
        ]));

        assert_eq!(result.configs.len(), 1);
        assert_eq!(result.configs[0].module_name(), "module-one");
        assert_eq!(
            result.configs[0].spec.settings,
            Some(values(json!({"a": 1})))
        );
        assert_eq!(
            result.messages,
            [r#"moduleTwo: key "moduleTwoEnabled" must be a boolean, got "yes""#]
        );
    }

    #[test]
    fn module_configs_to_aggregated() {
        let mut one = ModuleConfig::with_settings("module-one", 2, values(json!({"a": 1})));
        one.spec.enabled = Some(false);
        let mut global = ModuleConfig::with_settings("global", 1, values(json!({"b": "x"})));
        global.spec.enabled = Some(true);

        let data = transformer()
            .module_configs_to_aggregated(&[
                one,
                global,
                ModuleConfig::with_enabled("module-two", true),
                ModuleConfig::with_enabled("module-xyz", true),
            ])
            .expect("serializable");

        assert_eq!(
            data,
            BTreeMap::from([
                ("global".to_owned(), "b: x\n".to_owned()),
                ("moduleOne".to_owned(), "a: 1\n".to_owned()),
                ("moduleOneEnabled".to_owned(), "false".to_owned()),
                ("moduleTwoEnabled".to_owned(), "true".to_owned()),
            ])
        );
    }

    #[test]
    fn round_trip_keeps_module_configs() {
        let transformer = transformer();
        let mut one = ModuleConfig::with_settings(
            "module-one",
            2,
            values(json!({"paramGroup": {"param1": "v1", "list": [1, 2]}})),
        );
        one.spec.enabled = Some(true);
        let two = ModuleConfig::with_enabled("module-two", false);

        let data = transformer
            .module_configs_to_aggregated(&[one.clone(), two.clone()])
            .expect("serializable");
        let result = transformer.aggregated_to_module_configs(&data);

        assert!(result.messages.is_empty());
        let specs: Vec<_> = result.configs.into_iter().map(|config| config.spec).collect();
        assert_eq!(specs, [one.spec, two.spec]);
    }
}
