//! Sections of the aggregated ConfigMap.
//!
//! The ConfigMap holds one YAML document per module under the module's values
//! key, and an optional `<valuesKey>Enabled: "true"|"false"` mirror of the
//! enabled flag (never for `global`).

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use snafu::{ResultExt, Snafu};

use crate::{
    constants::ENABLED_KEY_SUFFIX,
    conversion::{self, Registry},
    crd::{ModuleConfig, ModuleConfigSpec},
    names::{PossibleNames, enabled_key, is_global, values_key},
    settings::{Settings, SettingsValues},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The aggregated document: ConfigMap data.
pub type AggregatedData = BTreeMap<String, String>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("values of module {name:?} must be an object, got {kind}"))]
    InvalidSectionType { name: String, kind: &'static str },

    #[snafu(display("failed to parse YAML of key {key:?}"))]
    ParseSectionYaml {
        source: serde_yaml::Error,
        key: String,
    },

    #[snafu(display("failed to serialize values of module {name:?} as YAML"))]
    SerializeSectionYaml {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("key {key:?} must be a boolean, got {value:?}"))]
    InvalidEnabledFlag { key: String, value: String },

    #[snafu(display("failed to convert values of module {name:?}"))]
    ConvertSection {
        source: conversion::Error,
        name: String,
    },
}

/// One module's slice of the aggregated document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregatedSection {
    /// Module name, kebab-cased.
    pub name: String,

    /// camelCased module name.
    pub values_key: String,

    /// Raw values as `{valuesKey: <parsed YAML>}`.
    pub values: SettingsValues,

    pub enabled: Option<bool>,
}

impl AggregatedSection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            values_key: values_key(name),
            ..Self::default()
        }
    }

    /// Returns the module's own values, [`None`] for an empty string, an
    /// empty sequence or a missing key.
    pub fn values_map(&self) -> Result<Option<SettingsValues>> {
        match self.values.get(&self.values_key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::Array(items)) if items.is_empty() => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map.clone())),
            Some(other) => InvalidSectionTypeSnafu {
                name: &self.name,
                kind: value_kind(other),
            }
            .fail(),
        }
    }

    /// Converts the values from version 1 to the latest version of the
    /// module's chain. Values in the aggregated document carry no version,
    /// so they are assumed to be the first one.
    pub fn convert(&self, registry: &Registry) -> Result<(u32, Option<SettingsValues>)> {
        let chain = registry.chain(&self.name);
        let latest_version = chain.latest_version();

        let Some(values) = self.values_map()? else {
            return Ok((latest_version, None));
        };

        let converted = chain
            .convert_to_latest(1, &Settings::new(values))
            .context(ConvertSectionSnafu { name: &self.name })?;

        let converted = converted.map();
        Ok((latest_version, (!converted.is_empty()).then_some(converted)))
    }

    /// Builds the ModuleConfig for this section, [`None`] when neither
    /// settings nor an enabled flag are left.
    pub fn to_module_config(&self, registry: &Registry) -> Result<Option<ModuleConfig>> {
        let (version, settings) = self.convert(registry)?;
        let enabled = if is_global(&self.name) {
            None
        } else {
            self.enabled
        };

        if settings.is_none() && enabled.is_none() {
            return Ok(None);
        }

        let version = if settings.is_some() { version } else { 0 };
        Ok(Some(ModuleConfig::new(&self.name, ModuleConfigSpec {
            version,
            settings,
            enabled,
        })))
    }

    /// Serializes the section back into aggregated document keys.
    pub fn to_aggregated(&self) -> Result<AggregatedData> {
        let mut data = AggregatedData::new();

        if let Some(values) = self.values_map()?.filter(|values| !values.is_empty()) {
            let yaml =
                serde_yaml::to_string(&values).context(SerializeSectionYamlSnafu { name: &self.name })?;
            data.insert(self.values_key.clone(), yaml);
        }

        if let Some(enabled) = self.enabled.filter(|_| !is_global(&self.name)) {
            data.insert(enabled_key(&self.name), enabled.to_string());
        }

        Ok(data)
    }
}

/// Sections of an aggregated document. A key failing to parse only drops the
/// section it belongs to.
#[derive(Debug, Default)]
pub struct ParsedSections {
    /// Sections of known modules, ordered by module name.
    pub sections: Vec<AggregatedSection>,

    /// Values keys of modules missing from the possible names. Their keys are
    /// never parsed.
    pub unknown: Vec<String>,

    pub invalid: Vec<InvalidSection>,
}

/// A section dropped because one of its keys failed to parse.
#[derive(Debug)]
pub struct InvalidSection {
    pub name: String,
    pub values_key: String,

    /// Error of the first key that failed.
    pub error: Error,
}

impl ParsedSections {
    /// Fails with the first invalid section, for documents that were written
    /// by this crate and have to parse completely.
    pub fn into_sections(self) -> Result<Vec<AggregatedSection>> {
        match self.invalid.into_iter().next() {
            Some(invalid) => Err(invalid.error),
            None => Ok(self.sections),
        }
    }
}

/// Splits aggregated data into per-module sections.
///
/// A key ending in `Enabled` is an enabled flag unless it is itself the values
/// key of a known module.
pub fn parse_sections(data: &AggregatedData, possible_names: &PossibleNames) -> ParsedSections {
    let mut sections: BTreeMap<String, AggregatedSection> = BTreeMap::new();
    let mut unknown = BTreeSet::new();
    let mut invalid: BTreeMap<String, Error> = BTreeMap::new();

    for (key, raw) in data {
        let flag_values_key = key
            .strip_suffix(ENABLED_KEY_SUFFIX)
            .filter(|prefix| !prefix.is_empty() && !possible_names.contains_values_key(key));

        let values_key = flag_values_key.unwrap_or(key.as_str());
        let name = possible_names.module_name(values_key);
        if !possible_names.contains(&name) {
            unknown.insert(values_key.to_owned());
            continue;
        }
        if invalid.contains_key(&name) {
            continue;
        }

        let section = sections
            .entry(name.clone())
            .or_insert_with(|| AggregatedSection::new(&name));
        let parsed = match flag_values_key {
            Some(_) => parse_enabled_flag(key, raw).map(|enabled| section.enabled = Some(enabled)),
            None => parse_section_yaml(key, raw).map(|value| {
                section.values.insert(key.clone(), value);
            }),
        };

        if let Err(error) = parsed {
            sections.remove(&name);
            invalid.insert(name, error);
        }
    }

    ParsedSections {
        sections: sections.into_values().collect(),
        unknown: unknown.into_iter().collect(),
        invalid: invalid
            .into_iter()
            .map(|(name, error)| InvalidSection {
                values_key: values_key(&name),
                name,
                error,
            })
            .collect(),
    }
}

fn parse_section_yaml(key: &str, raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::String(String::new()));
    }
    serde_yaml::from_str(raw).context(ParseSectionYamlSnafu { key })
}

/// Accepts the spellings of the platform's boolean parser.
fn parse_enabled_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        other => InvalidEnabledFlagSnafu { key, value: other }.fail(),
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn data(entries: &[(&str, &str)]) -> AggregatedData {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        registry
            .register("module-one", 1, 2, |settings| {
                settings.delete_and_clean("paramGroup.obsoleteParam")?;
                Ok(())
            })
            .expect("valid conversion");
        registry
    }

    #[test]
    fn parses_values_and_enabled_flags() {
        let names = PossibleNames::new(["module-one", "module-two"]);
        let sections = parse_sections(
            &data(&[
                ("global", "param: v\n"),
                ("moduleOne", "paramGroup:\n  param1: v1\n"),
                ("moduleOneEnabled", "true"),
                ("moduleTwoEnabled", "false"),
            ]),
            &names,
        )
        .into_sections()
        .expect("valid data");

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].name, "global");
        assert_eq!(sections[1].name, "module-one");
        assert_eq!(sections[1].enabled, Some(true));
        assert_eq!(
            sections[1].values_map().expect("valid"),
            Some(
                json!({"paramGroup": {"param1": "v1"}})
                    .as_object()
                    .cloned()
                    .expect("object")
            )
        );
        assert_eq!(sections[2].name, "module-two");
        assert_eq!(sections[2].enabled, Some(false));
        assert_eq!(sections[2].values_map().expect("valid"), None);
    }

    #[rstest]
    #[case::empty_string("")]
    #[case::empty_sequence("[]")]
    #[case::null("null")]
    fn empty_values_yield_no_settings(#[case] raw: &str) {
        let names = PossibleNames::new(["module-one"]);
        let sections = parse_sections(&data(&[("moduleOne", raw)]), &names)
            .into_sections()
            .expect("valid data");

        assert_eq!(sections[0].values_map().expect("empty values are fine"), None);
        assert_eq!(
            sections[0].to_module_config(&registry()).expect("valid"),
            None
        );
    }

    #[rstest]
    #[case::string("some string")]
    #[case::number("42")]
    #[case::list("[1, 2]")]
    fn scalar_values_are_rejected(#[case] raw: &str) {
        let names = PossibleNames::new(["module-one"]);
        let sections = parse_sections(&data(&[("moduleOne", raw)]), &names)
            .into_sections()
            .expect("valid data");

        assert!(matches!(
            sections[0].values_map(),
            Err(Error::InvalidSectionType { .. })
        ));
    }

    #[rstest]
    #[case::one("1", true)]
    #[case::t("t", true)]
    #[case::upper_t("T", true)]
    #[case::upper_true("TRUE", true)]
    #[case::title_true("True", true)]
    #[case::zero("0", false)]
    #[case::upper_f("F", false)]
    #[case::upper_false("FALSE", false)]
    #[case::title_false("False", false)]
    fn boolean_spellings_of_enabled_flags(#[case] raw: &str, #[case] expected: bool) {
        let names = PossibleNames::new(["module-one"]);
        let sections = parse_sections(&data(&[("moduleOneEnabled", raw)]), &names)
            .into_sections()
            .expect("valid flag");

        assert_eq!(sections[0].enabled, Some(expected));
    }

    #[test]
    fn invalid_key_drops_only_its_section() {
        let names = PossibleNames::new(["module-one", "module-two"]);
        let parsed = parse_sections(
            &data(&[
                ("moduleOne", "a: 1\n"),
                ("moduleTwo", "replicas: 2\n"),
                ("moduleTwoEnabled", "yes please"),
            ]),
            &names,
        );

        assert_eq!(parsed.sections.len(), 1);
        assert_eq!(parsed.sections[0].name, "module-one");
        assert_eq!(parsed.invalid.len(), 1);
        assert_eq!(parsed.invalid[0].values_key, "moduleTwo");
        assert!(matches!(
            parsed.invalid[0].error,
            Error::InvalidEnabledFlag { .. }
        ));
        assert!(matches!(
            parsed.into_sections(),
            Err(Error::InvalidEnabledFlag { .. })
        ));
    }

    #[test]
    fn unknown_modules_are_not_parsed() {
        let names = PossibleNames::new(["module-one"]);
        let parsed = parse_sections(
            &data(&[
                ("moduleOne", "a: 1\n"),
                ("moduleXyz", "{not yaml"),
                ("moduleXyzEnabled", "maybe"),
            ]),
            &names,
        );

        assert_eq!(parsed.sections.len(), 1);
        assert!(parsed.invalid.is_empty());
        assert_eq!(parsed.unknown, ["moduleXyz"]);
    }

    #[test]
    fn converts_to_module_config_at_latest_version() {
        let names = PossibleNames::new(["module-one"]);
        let sections = parse_sections(
            &data(&[
                ("moduleOne", "paramGroup:\n  param1: v1\n  obsoleteParam: v2\n"),
                ("moduleOneEnabled", "false"),
            ]),
            &names,
        )
        .into_sections()
        .expect("valid data");

        let config = sections[0]
            .to_module_config(&registry())
            .expect("conversion succeeds")
            .expect("section has content");

        assert_eq!(config.spec.version, 2);
        assert_eq!(config.spec.enabled, Some(false));
        assert_eq!(
            serde_json::to_value(&config.spec.settings).expect("serializable"),
            json!({"paramGroup": {"param1": "v1"}})
        );
    }

    #[test]
    fn collapsed_settings_keep_only_enabled_flag() {
        let names = PossibleNames::new(["module-one"]);
        let sections = parse_sections(
            &data(&[
                ("moduleOne", "paramGroup:\n  obsoleteParam: v2\n"),
                ("moduleOneEnabled", "true"),
            ]),
            &names,
        )
        .into_sections()
        .expect("valid data");

        let config = sections[0]
            .to_module_config(&registry())
            .expect("conversion succeeds")
            .expect("enabled flag is left");

        assert_eq!(config.spec.version, 0);
        assert_eq!(config.spec.settings, None);
        assert_eq!(config.spec.enabled, Some(true));
    }

    #[test]
    fn global_never_gets_an_enabled_key() {
        let mut section = AggregatedSection::new("global");
        section.enabled = Some(true);
        section
            .values
            .insert("global".to_owned(), json!({"modules": {"https": {"mode": "Disabled"}}}));

        let data = section.to_aggregated().expect("serializable");
        assert_eq!(
            data,
            BTreeMap::from([(
                "global".to_owned(),
                indoc! {"
                    modules:
                      https:
                        mode: Disabled
                "}
                .to_owned()
            )])
        );
    }
}
