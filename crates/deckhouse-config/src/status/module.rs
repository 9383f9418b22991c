use crate::{
    crd::{
        Module,
        module::{CONDITION_ENABLED_BY_MODULE_MANAGER, CONDITION_IS_READY, ModulePhase},
    },
    modules::{ModuleManager, RuntimePhase},
};

/// Brings the status of `module` in line with the module manager's decision
/// and the hook runtime's progress. Modules the manager does not know are
/// left untouched.
pub fn refresh_module_status(module: &mut Module, manager: &dyn ModuleManager) {
    let name = module.metadata.name.clone().unwrap_or_default();
    if manager.module_definition(&name).is_none() {
        return;
    }

    if manager.is_module_enabled(&name) {
        refresh_enabled(module, &name, manager);
    } else {
        refresh_disabled(module, &name, manager);
    }
}

fn refresh_enabled(module: &mut Module, name: &str, manager: &dyn ModuleManager) {
    module.set_condition_true(CONDITION_ENABLED_BY_MODULE_MANAGER);

    let Some(runtime) = manager.runtime_state(name) else {
        set_phase(module, ModulePhase::Pending);
        module.set_condition_false(CONDITION_IS_READY, "Pending", "waiting for the hook runtime");
        return;
    };
    module.status_mut().hooks_state = runtime.hooks_state.clone();

    if let Some(error) = &runtime.last_hook_error {
        set_phase(module, ModulePhase::Error);
        module.set_condition_false(CONDITION_IS_READY, "HookError", error);
        return;
    }
    if let Some(error) = &runtime.last_module_error {
        set_phase(module, ModulePhase::Error);
        module.set_condition_false(CONDITION_IS_READY, "ModuleError", error);
        return;
    }

    match runtime.phase {
        Some(RuntimePhase::Ready) => {
            set_phase(module, ModulePhase::Ready);
            module.set_condition_true(CONDITION_IS_READY);
        }
        Some(RuntimePhase::Startup) => {
            if module.phase() == Some(ModulePhase::Downloading) {
                set_phase(module, ModulePhase::Installing);
                module.set_condition_false(CONDITION_IS_READY, "Installing", "installing");
            } else {
                set_phase(module, ModulePhase::Reconciling);
                module.set_condition_false(CONDITION_IS_READY, "Reconciling", "reconciling");
            }
        }
        Some(RuntimePhase::OnStartupDone) => {
            let reason = if module.phase() == Some(ModulePhase::Installing) {
                "Installing"
            } else {
                "Reconciling"
            };
            module.set_condition_false(CONDITION_IS_READY, reason, "onStartup hooks done");
        }
        Some(RuntimePhase::QueueSynchronizationTasks) => {
            set_phase(module, ModulePhase::Enqueued);
            module.set_condition_false(CONDITION_IS_READY, "Enqueued", "synchronization tasks queued");
        }
        Some(RuntimePhase::WaitForSynchronization) => {
            set_phase(module, ModulePhase::WaitSync);
            module.set_condition_false(CONDITION_IS_READY, "WaitSync", "waiting for synchronization");
        }
        Some(RuntimePhase::CanRunHelm) => {
            set_phase(module, ModulePhase::Pending);
            module.set_condition_false(CONDITION_IS_READY, "Pending", "waiting for the helm release");
        }
        None => {}
    }
}

fn refresh_disabled(module: &mut Module, name: &str, manager: &dyn ModuleManager) {
    module.status_mut().hooks_state.clear();

    let extender = match manager.updated_by(name) {
        Ok(extender) => extender,
        Err(error) => {
            let message = error.to_string();
            set_phase(module, ModulePhase::Error);
            module.set_condition_false(CONDITION_ENABLED_BY_MODULE_MANAGER, "Error", &message);
            module.set_condition_false(CONDITION_IS_READY, "Error", &message);
            return;
        }
    };

    let (reason, message) = extender.disabled_reason(module.is_embedded());

    // Availability is decided by the module source, keep it.
    if !matches!(
        module.phase(),
        Some(ModulePhase::Available | ModulePhase::Unavailable)
    ) {
        set_phase(module, ModulePhase::NotInstalled);
    }

    module.set_condition_false(CONDITION_ENABLED_BY_MODULE_MANAGER, reason, &message);
    module.set_condition_false(CONDITION_IS_READY, reason, &message);
}

fn set_phase(module: &mut Module, phase: ModulePhase) {
    module.status_mut().phase = phase.to_string();
}
