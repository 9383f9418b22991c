//! Validation of ModuleConfig resources.
//!
//! Runs in three stages, each one only when the previous one passed: the
//! shape of the spec, the conversion of settings to the latest version and
//! the validation of the converted settings against the module's values
//! schema.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    conversion::{ConversionChain, Registry},
    crd::ModuleConfig,
    names::{is_global, values_key},
    openapi::ValuesValidator,
    settings::{Settings, SettingsValues},
};

/// Outcome of validating one ModuleConfig.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// Settings went through at least one conversion.
    pub is_converted: bool,

    /// Settings at `version`, [`None`] when absent or collapsed to nothing.
    pub settings: Option<SettingsValues>,
    pub version: u32,

    /// Both `spec.version` and `spec.settings` are present.
    pub has_versioned_settings: bool,

    pub validate_cr_warning: String,
    pub validate_cr_error: String,
    pub conversion_error: String,
    pub validation_error: String,
}

impl ValidationResult {
    pub fn has_error(&self) -> bool {
        !self.validate_cr_error.is_empty()
            || !self.conversion_error.is_empty()
            || !self.validation_error.is_empty()
    }

    /// All errors, comma separated.
    pub fn error(&self) -> String {
        [
            &self.validate_cr_error,
            &self.conversion_error,
            &self.validation_error,
        ]
        .into_iter()
        .filter(|error| !error.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
    }
}

#[derive(Clone, Debug)]
pub struct ConfigValidator {
    registry: Arc<Registry>,
    values_validator: Arc<dyn ValuesValidator>,
}

impl ConfigValidator {
    pub fn new(registry: Arc<Registry>, values_validator: Arc<dyn ValuesValidator>) -> Self {
        Self {
            registry,
            values_validator,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Checks the spec shape and the declared version.
    pub fn validate_cr(&self, config: &ModuleConfig) -> ValidationResult {
        let mut result = ValidationResult {
            settings: config.spec.settings.clone(),
            version: config.spec.version,
            ..ValidationResult::default()
        };

        let has_version = config.has_version();
        let has_settings = config.has_settings();

        if is_global(&config.module_name()) && config.spec.enabled.is_some() {
            result.validate_cr_error = "spec.enabled is not allowed for module 'global'".to_owned();
            return result;
        }

        if has_settings && !has_version {
            result.validate_cr_error =
                "spec.version is required when spec.settings are specified".to_owned();
            return result;
        }

        if has_version && !has_settings {
            result.validate_cr_warning = "spec.version is redundant without spec.settings".to_owned();
        }
        result.has_versioned_settings = has_version && has_settings;

        if !has_version {
            return result;
        }

        let chain = self.registry.chain(&config.module_name());
        let version = config.spec.version;
        let latest_version = chain.latest_version();

        if !chain.is_known_version(version) {
            let message = unsupported_version_message(version, chain.as_ref());
            if result.has_versioned_settings {
                result.validate_cr_error = message;
            } else {
                result.validate_cr_warning = message;
            }
        } else if result.has_versioned_settings && version != latest_version {
            result.validate_cr_warning = format!(
                "spec.version={version} is obsolete. Please migrate spec.settings to the latest version {latest_version}"
            );
        }

        result
    }

    /// Runs [`Self::validate_cr`], then converts versioned settings to the
    /// latest version.
    pub fn convert_to_latest(&self, config: &ModuleConfig) -> ValidationResult {
        let mut result = self.validate_cr(config);
        if result.has_error() || !result.has_versioned_settings {
            return result;
        }

        let chain = self.registry.chain(&config.module_name());
        let latest_version = chain.latest_version();
        if result.version == latest_version {
            return result;
        }

        let settings = Settings::new(result.settings.clone().unwrap_or_default());
        match chain.convert_to_latest(result.version, &settings) {
            Ok(converted) => {
                result.is_converted = true;
                if converted.is_empty() {
                    result.settings = None;
                    result.version = 0;
                } else {
                    result.settings = Some(converted.map());
                    result.version = latest_version;
                }
            }
            Err(error) => result.conversion_error = error.to_string(),
        }

        result
    }

    /// Runs [`Self::convert_to_latest`], then validates the converted
    /// settings against the module's values schema.
    pub fn validate(&self, config: &ModuleConfig) -> ValidationResult {
        let mut result = self.convert_to_latest(config);
        if result.has_error() {
            return result;
        }

        let Some(settings) = &result.settings else {
            return result;
        };

        let name = config.module_name();
        let values_key = values_key(&name);
        let values = wrap_settings(&values_key, settings);
        let validated = if is_global(&name) {
            self.values_validator.validate_global_values(&values)
        } else {
            self.values_validator
                .validate_module_values(&values_key, &values)
        };

        if let Err(error) = validated {
            result.validation_error = error.to_string().replace('\n', " ");
        }

        result
    }
}

/// Builds the `{valuesKey: settings}` document values schemas are written for.
fn wrap_settings(values_key: &str, settings: &SettingsValues) -> Value {
    let mut values = SettingsValues::new();
    values.insert(values_key.to_owned(), Value::Object(settings.clone()));
    Value::Object(values)
}

fn unsupported_version_message(version: u32, chain: &dyn ConversionChain) -> String {
    let mut message = format!(
        "spec.version={version} is unsupported. Use latest version {}",
        chain.latest_version()
    );

    let previous_versions = chain.previous_versions();
    if !previous_versions.is_empty() {
        let previous_versions: Vec<_> = previous_versions.iter().map(u32::to_string).collect();
        message.push_str(" or one of previous versions: ");
        message.push_str(&previous_versions.join(", "));
    }

    message
}
