use crate::{
    crd::{ModuleConfig, ModuleConfigState, ModuleConfigStatus},
    modules::{ModuleManager, RuntimePhase},
    names::{PossibleNames, is_global},
    validator::ConfigValidator,
};

pub const UNKNOWN_MODULE_MESSAGE: &str = "Ignored: unknown module name";

/// Computes the status of `config` from validation and the declared version.
pub fn config_status(
    config: &ModuleConfig,
    possible_names: &PossibleNames,
    validator: &ConfigValidator,
    manager: &dyn ModuleManager,
) -> ModuleConfigStatus {
    let name = config.module_name();
    if !possible_names.contains(&name) {
        return ModuleConfigStatus {
            message: UNKNOWN_MODULE_MESSAGE.to_owned(),
            ..ModuleConfigStatus::default()
        };
    }

    let state = config_state(&name, manager);
    let validation = validator.validate(config);
    if validation.has_error() {
        return ModuleConfigStatus {
            version: String::new(),
            message: format!("Error: {}", validation.error()),
            state,
        };
    }

    let chain = validator.registry().chain(&name);
    let latest = chain.latest_version();
    let (version, message) = match config.spec.version {
        0 => (latest, String::new()),
        version if !chain.is_known_version(version) => (
            version,
            format!("Error: invalid spec.version, use version {latest}"),
        ),
        version if version < latest => (
            version,
            format!("Update available, latest spec.settings schema version is {latest}"),
        ),
        version => (version, String::new()),
    };

    ModuleConfigStatus {
        version: version.to_string(),
        message,
        state,
    }
}

/// State of the module behind a ModuleConfig. `global` has none.
pub fn config_state(name: &str, manager: &dyn ModuleManager) -> Option<ModuleConfigState> {
    if is_global(name) {
        return None;
    }
    if !manager.is_module_enabled(name) {
        return Some(ModuleConfigState::Disabled);
    }

    let Some(runtime) = manager.runtime_state(name) else {
        return Some(ModuleConfigState::Enabled);
    };
    if runtime.last_hook_error.is_some() || runtime.last_module_error.is_some() {
        return Some(ModuleConfigState::Error);
    }

    let state = match runtime.phase {
        None => ModuleConfigState::Enabled,
        Some(RuntimePhase::Ready) => ModuleConfigState::Ready,
        Some(RuntimePhase::QueueSynchronizationTasks) => ModuleConfigState::Enqueued,
        Some(RuntimePhase::WaitForSynchronization) => ModuleConfigState::WaitSync,
        Some(RuntimePhase::Startup | RuntimePhase::OnStartupDone | RuntimePhase::CanRunHelm) => {
            ModuleConfigState::Pending
        }
    };
    Some(state)
}
