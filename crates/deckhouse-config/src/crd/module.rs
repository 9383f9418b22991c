//! The `Module` resource: one per known module, describing it and reporting
//! whether it runs.
//!
//! Unlike most custom resources it keeps its data under `properties` instead
//! of `spec`, so the type implements the Kubernetes resource traits by hand.

use k8s_openapi::{
    ClusterResourceScope,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    jiff::Timestamp,
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::constants::{API_GROUP, API_VERSION, MODULE_TAG_LABEL_DOMAIN};

pub const CONDITION_ENABLED_BY_MODULE_MANAGER: &str = "EnabledByModuleManager";
pub const CONDITION_IS_READY: &str = "IsReady";

/// Source of the modules compiled into the platform image.
pub const EMBEDDED_SOURCE: &str = "Embedded";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    #[serde(default = "Module::api_version_default")]
    pub api_version: String,

    #[serde(default = "Module::kind_default")]
    pub kind: String,

    pub metadata: ObjectMeta,

    #[serde(default)]
    pub properties: ModuleProperties,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ModuleStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleProperties {
    #[serde(default)]
    pub weight: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hooks_state: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ModuleCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// `True` or `False`.
    pub status: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
pub enum ModulePhase {
    Downloading,
    Downloaded,
    Available,
    Unavailable,
    Reconciling,
    Installing,
    Ready,
    Enqueued,
    WaitSync,
    Pending,
    Error,
    NotInstalled,
}

impl Module {
    fn api_version_default() -> String {
        <Self as k8s_openapi::Resource>::API_VERSION.to_owned()
    }

    fn kind_default() -> String {
        <Self as k8s_openapi::Resource>::KIND.to_owned()
    }

    pub fn new(name: &str, properties: ModuleProperties) -> Self {
        Self {
            api_version: Self::api_version_default(),
            kind: Self::kind_default(),
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..ObjectMeta::default()
            },
            properties,
            status: None,
        }
    }

    pub fn is_embedded(&self) -> bool {
        self.properties.source == EMBEDDED_SOURCE
    }

    pub fn phase(&self) -> Option<ModulePhase> {
        self.status.as_ref()?.phase.parse().ok()
    }

    pub fn status_mut(&mut self) -> &mut ModuleStatus {
        self.status.get_or_insert_with(ModuleStatus::default)
    }

    pub fn condition(&self, type_: &str) -> Option<&ModuleCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|condition| condition.type_ == type_)
    }

    pub fn set_condition_true(&mut self, type_: &str) {
        self.set_condition(type_, "True", "", "");
    }

    pub fn set_condition_false(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_condition(type_, "False", reason, message);
    }

    /// Upserts a condition. The probe time always moves, the transition time
    /// only when the status flips.
    fn set_condition(&mut self, type_: &str, status: &str, reason: &str, message: &str) {
        let now = Time(Timestamp::now());
        let conditions = &mut self.status_mut().conditions;

        match conditions.iter_mut().find(|condition| condition.type_ == type_) {
            Some(condition) => {
                if condition.status != status {
                    condition.last_transition_time = Some(now.clone());
                }
                condition.status = status.to_owned();
                condition.reason = reason.to_owned();
                condition.message = message.to_owned();
                condition.last_probe_time = Some(now);
            }
            None => conditions.push(ModuleCondition {
                type_: type_.to_owned(),
                status: status.to_owned(),
                reason: reason.to_owned(),
                message: message.to_owned(),
                last_probe_time: Some(now.clone()),
                last_transition_time: Some(now),
            }),
        }
    }

    /// Compares everything a status write would change, ignoring timestamps.
    pub fn status_differs(&self, other: &Self) -> bool {
        fn strip(module: &Module) -> Option<ModuleStatus> {
            let mut status = module.status.clone()?;
            for condition in &mut status.conditions {
                condition.last_probe_time = None;
                condition.last_transition_time = None;
            }
            Some(status)
        }

        strip(self) != strip(other)
    }
}

impl k8s_openapi::Resource for Module {
    type Scope = ClusterResourceScope;

    const API_VERSION: &'static str = "deckhouse.io/v1alpha1";
    const GROUP: &'static str = API_GROUP;
    const KIND: &'static str = "Module";
    const URL_PATH_SEGMENT: &'static str = "modules";
    const VERSION: &'static str = API_VERSION;
}

impl k8s_openapi::Metadata for Module {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Label key for a module tag, e.g. `module.deckhouse.io/observability`.
pub fn tag_label(tag: &str) -> String {
    format!("{MODULE_TAG_LABEL_DOMAIN}/{tag}")
}
