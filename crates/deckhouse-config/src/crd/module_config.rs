use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::settings::SettingsValues;

/// Configuration of a single module. The resource name is the module name.
///
/// Valid spec shapes are `{}`, `{enabled}` and `{version, settings}` with an
/// optional `enabled`.
#[derive(
    Clone, CustomResource, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "ModuleConfig",
    plural = "moduleconfigs",
    shortname = "mc",
    status = "ModuleConfigStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Enabled","type":"boolean","jsonPath":".spec.enabled"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigSpec {
    /// Schema version of `settings`. Zero means unspecified.
    #[serde(default, skip_serializing_if = "is_unspecified")]
    pub version: u32,

    /// Module settings, validated against the module's OpenAPI values schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::crd::raw_object_schema")]
    pub settings: Option<SettingsValues>,

    /// Enables or disables the module. Not allowed for `global`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

fn is_unspecified(version: &u32) -> bool {
    *version == 0
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigStatus {
    /// The last accepted settings schema version.
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ModuleConfigState>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ModuleConfigState {
    Enabled,
    Disabled,
    Pending,
    Ready,
    Error,
    Enqueued,
    WaitSync,
    NotInstalled,
}

impl ModuleConfig {
    /// Builds a resource carrying versioned settings.
    pub fn with_settings(name: &str, version: u32, settings: SettingsValues) -> Self {
        Self::new(name, ModuleConfigSpec {
            version,
            settings: Some(settings),
            enabled: None,
        })
    }

    /// Builds a resource only toggling the module.
    pub fn with_enabled(name: &str, enabled: bool) -> Self {
        Self::new(name, ModuleConfigSpec {
            enabled: Some(enabled),
            ..ModuleConfigSpec::default()
        })
    }

    pub fn module_name(&self) -> String {
        self.name_any()
    }

    /// True when `spec.settings` is present and not empty.
    pub fn has_settings(&self) -> bool {
        self.spec
            .settings
            .as_ref()
            .is_some_and(|settings| !settings.is_empty())
    }

    pub fn has_version(&self) -> bool {
        self.spec.version > 0
    }

    /// Replaces settings and version, dropping both when `settings` is empty.
    pub fn set_settings(&mut self, version: u32, settings: Option<SettingsValues>) {
        match settings {
            Some(settings) if !settings.is_empty() => {
                self.spec.version = version;
                self.spec.settings = Some(settings);
            }
            _ => {
                self.spec.version = 0;
                self.spec.settings = None;
            }
        }
    }

    pub fn current_status(&self) -> ModuleConfigStatus {
        self.status.clone().unwrap_or_default()
    }
}
