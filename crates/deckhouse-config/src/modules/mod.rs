//! What the core needs to know about modules: which ones exist, whether they
//! are enabled and why, and how far the hook runtime got with them.

use std::{fmt::Debug, sync::Arc};

use snafu::Snafu;
use strum::{Display, EnumString};

use crate::openapi::ValuesValidator;

pub mod discovery;
mod local;

pub use discovery::{ModuleDefinition, ModuleDirectory, discover_modules};
pub use local::LocalModuleManager;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("module {name:?} is unknown"))]
    UnknownModule { name: String },
}

/// The part of the platform that decides which modules run.
pub trait ModuleManager: Debug + Send + Sync {
    /// Names of all known modules, without `global`.
    fn module_names(&self) -> Vec<String>;

    fn module_definition(&self, name: &str) -> Option<ModuleDefinition>;

    fn is_module_enabled(&self, name: &str) -> bool;

    /// The extender that decided the module's enabled state.
    fn updated_by(&self, name: &str) -> Result<Extender, Error>;

    /// The hook runtime's view of an enabled module, if it reported one.
    fn runtime_state(&self, name: &str) -> Option<ModuleRuntimeState>;

    fn values_validator(&self) -> Arc<dyn ValuesValidator>;
}

/// A source of enabled/disabled decisions, in evaluation order.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum Extender {
    /// Defaults of the installed bundle.
    #[strum(serialize = "Static")]
    Bundle,
    ModuleConfig,
    DynamicallyEnabled,
    /// The module's `enabled` script, with the reason it printed.
    #[strum(serialize = "ScriptEnabled")]
    EnabledScript { reason: Option<String> },
    DeckhouseVersion,
    KubernetesVersion,
    Bootstrapped,
    ModuleDependency,
}

impl Extender {
    /// Condition reason and message reported when this extender turned the
    /// module off.
    pub fn disabled_reason(&self, embedded: bool) -> (&'static str, String) {
        match self {
            Self::Bundle if embedded => ("Bundle", "turned off by bundle".to_owned()),
            Self::Bundle => ("Disabled", "disabled".to_owned()),
            Self::ModuleConfig => ("ModuleConfig", "turned off by module config".to_owned()),
            Self::DynamicallyEnabled => (
                "DynamicGlobalHookExtender",
                "turned off by global hook".to_owned(),
            ),
            Self::EnabledScript { reason } => {
                let mut message = "turned off by enabled script".to_owned();
                if let Some(reason) = reason.as_deref().filter(|reason| !reason.is_empty()) {
                    message.push_str(": ");
                    message.push_str(reason);
                }
                ("EnabledScriptExtender", message)
            }
            Self::DeckhouseVersion => (
                "DeckhouseVersionExtender",
                "turned off by deckhouse version".to_owned(),
            ),
            Self::KubernetesVersion => (
                "KubernetesVersionExtender",
                "turned off by kubernetes version".to_owned(),
            ),
            Self::Bootstrapped => (
                "BootstrappedExtender",
                "turned off because the cluster not bootstrapped yet".to_owned(),
            ),
            Self::ModuleDependency => (
                "ModuleDependencyExtender",
                "turned off because of unmet module dependencies".to_owned(),
            ),
        }
    }
}

/// Lifecycle phases of an enabled module inside the hook runtime.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
pub enum RuntimePhase {
    Startup,
    OnStartupDone,
    QueueSynchronizationTasks,
    WaitForSynchronization,
    CanRunHelm,
    Ready,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ModuleRuntimeState {
    pub phase: Option<RuntimePhase>,
    pub hooks_state: String,
    pub last_hook_error: Option<String>,
    pub last_module_error: Option<String>,
}
