use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::debug;

use super::{Error, Extender, ModuleDefinition, ModuleDirectory, ModuleManager, ModuleRuntimeState};
use crate::{
    crd::ModuleConfig,
    openapi::{SchemaValidator, ValuesValidator},
};

/// Decides module enablement from the bundle defaults and the `enabled` flags
/// of ModuleConfig resources.
///
/// Runtime phases are pushed in by the hook runtime through
/// [`LocalModuleManager::set_runtime_state`].
#[derive(Debug)]
pub struct LocalModuleManager {
    definitions: BTreeMap<String, ModuleDefinition>,
    bundle_defaults: BTreeMap<String, bool>,
    validator: Arc<SchemaValidator>,

    config_enabled: RwLock<BTreeMap<String, bool>>,
    runtime_states: RwLock<BTreeMap<String, ModuleRuntimeState>>,
}

impl LocalModuleManager {
    pub fn new(directory: ModuleDirectory) -> Self {
        let definitions = directory
            .modules
            .into_iter()
            .map(|module| (module.name.clone(), module))
            .collect();

        Self {
            definitions,
            bundle_defaults: directory.bundle_defaults,
            validator: Arc::new(directory.validator),
            config_enabled: RwLock::default(),
            runtime_states: RwLock::default(),
        }
    }

    /// Replaces the `enabled` flags with the ones of `configs`. Configs of
    /// unknown modules are skipped.
    pub fn sync_module_configs(&self, configs: &[ModuleConfig]) {
        let enabled: BTreeMap<_, _> = configs
            .iter()
            .filter_map(|config| Some((config.module_name(), config.spec.enabled?)))
            .filter(|(name, _)| self.definitions.contains_key(name))
            .collect();

        debug!(flags = enabled.len(), "synced enabled flags from module configs");
        *self
            .config_enabled
            .write()
            .unwrap_or_else(PoisonError::into_inner) = enabled;
    }

    pub fn set_runtime_state(&self, name: &str, state: ModuleRuntimeState) {
        self.runtime_states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), state);
    }

    fn config_enabled(&self, name: &str) -> Option<bool> {
        self.config_enabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }
}

impl ModuleManager for LocalModuleManager {
    fn module_names(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    fn module_definition(&self, name: &str) -> Option<ModuleDefinition> {
        self.definitions.get(name).cloned()
    }

    fn is_module_enabled(&self, name: &str) -> bool {
        if !self.definitions.contains_key(name) {
            return false;
        }

        self.config_enabled(name)
            .or_else(|| self.bundle_defaults.get(name).copied())
            .unwrap_or(false)
    }

    fn updated_by(&self, name: &str) -> Result<Extender, Error> {
        if !self.definitions.contains_key(name) {
            return Err(Error::UnknownModule {
                name: name.to_owned(),
            });
        }

        Ok(match self.config_enabled(name) {
            Some(_) => Extender::ModuleConfig,
            None => Extender::Bundle,
        })
    }

    fn runtime_state(&self, name: &str) -> Option<ModuleRuntimeState> {
        if !self.is_module_enabled(name) {
            return None;
        }

        self.runtime_states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn values_validator(&self) -> Arc<dyn ValuesValidator> {
        self.validator.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::RuntimePhase;

    fn manager() -> LocalModuleManager {
        let modules = ["module-one", "module-two", "module-three"]
            .into_iter()
            .map(|name| ModuleDefinition {
                name: name.to_owned(),
                ..ModuleDefinition::default()
            })
            .collect();

        LocalModuleManager::new(ModuleDirectory {
            modules,
            validator: SchemaValidator::new(),
            bundle_defaults: BTreeMap::from([
                ("module-one".to_owned(), true),
                ("module-two".to_owned(), true),
            ]),
        })
    }

    #[test]
    fn bundle_decides_without_module_config() {
        let manager = manager();

        assert!(manager.is_module_enabled("module-one"));
        assert!(!manager.is_module_enabled("module-three"));
        assert!(!manager.is_module_enabled("module-unknown"));
        assert_eq!(manager.updated_by("module-three").ok(), Some(Extender::Bundle));
        assert!(matches!(
            manager.updated_by("module-unknown"),
            Err(Error::UnknownModule { .. })
        ));
    }

    #[test]
    fn module_config_overrides_bundle() {
        let manager = manager();
        manager.sync_module_configs(&[
            ModuleConfig::with_enabled("module-one", false),
            ModuleConfig::with_enabled("module-three", true),
            ModuleConfig::with_enabled("module-unknown", true),
        ]);

        assert!(!manager.is_module_enabled("module-one"));
        assert!(manager.is_module_enabled("module-two"));
        assert!(manager.is_module_enabled("module-three"));
        assert_eq!(manager.updated_by("module-one").ok(), Some(Extender::ModuleConfig));
        assert_eq!(manager.updated_by("module-two").ok(), Some(Extender::Bundle));

        manager.sync_module_configs(&[]);
        assert!(manager.is_module_enabled("module-one"));
    }

    #[test]
    fn runtime_state_only_for_enabled_modules() {
        let manager = manager();
        let state = ModuleRuntimeState {
            phase: Some(RuntimePhase::Ready),
            ..ModuleRuntimeState::default()
        };
        manager.set_runtime_state("module-one", state.clone());
        manager.set_runtime_state("module-three", state.clone());

        assert_eq!(manager.runtime_state("module-one"), Some(state));
        assert_eq!(manager.runtime_state("module-three"), None);
    }
}
