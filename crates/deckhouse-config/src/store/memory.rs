use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use kube::ResourceExt;

use super::{ClusterStore, Error, Result};
use crate::crd::{Module, ModuleConfig};

#[derive(Debug, Default)]
struct State {
    config_maps: BTreeMap<String, ConfigMap>,
    deployment_env: BTreeMap<(String, String, String), String>,
    module_configs: BTreeMap<String, ModuleConfig>,
    modules: BTreeMap<String, Module>,

    resource_version: u64,
    status_writes: usize,
    injected_conflicts: usize,
    rejected_module_configs: BTreeSet<String>,
}

impl State {
    fn next_resource_version(&mut self) -> Option<String> {
        self.resource_version += 1;
        Some(self.resource_version.to_string())
    }

    fn take_injected_conflict(&mut self) -> bool {
        if self.injected_conflicts == 0 {
            return false;
        }
        self.injected_conflicts -= 1;
        true
    }
}

/// In-process [`ClusterStore`]. Every write bumps a store-wide resource
/// version, status writes carrying a stale one fail with a conflict.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a ConfigMap without going through [`ClusterStore`].
    pub fn insert_config_map(&self, config_map: ConfigMap) {
        let mut state = self.lock();
        let mut config_map = config_map;
        config_map.metadata.resource_version = state.next_resource_version();
        state.config_maps.insert(config_map.name_any(), config_map);
    }

    pub fn insert_module_config(&self, config: ModuleConfig) {
        let mut state = self.lock();
        let mut config = config;
        config.metadata.resource_version = state.next_resource_version();
        state.module_configs.insert(config.name_any(), config);
    }

    pub fn remove_module_config(&self, name: &str) -> Option<ModuleConfig> {
        self.lock().module_configs.remove(name)
    }

    /// Current value of a deployment container's env variable.
    pub fn deployment_env(&self, deployment: &str, container: &str, env: &str) -> Option<String> {
        self.lock()
            .deployment_env
            .get(&(deployment.to_owned(), container.to_owned(), env.to_owned()))
            .cloned()
    }

    /// Number of successful status writes so far.
    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    /// Makes the next `count` status writes fail with a conflict.
    pub fn inject_status_conflicts(&self, count: usize) {
        self.lock().injected_conflicts = count;
    }

    /// Makes every apply of the ModuleConfig `name` fail with a conflict.
    pub fn reject_module_config_applies(&self, name: &str) {
        self.lock().rejected_module_configs.insert(name.to_owned());
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_resource_version(
    stored: &ObjectMeta,
    written: &ObjectMeta,
    kind: &str,
    name: &str,
) -> Result<()> {
    match &written.resource_version {
        Some(version) if stored.resource_version.as_ref() != Some(version) => Err(Error::Conflict {
            kind: kind.to_owned(),
            name: name.to_owned(),
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.lock().config_maps.get(name).cloned())
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        self.insert_config_map(config_map.clone());
        Ok(())
    }

    async fn set_deployment_env(
        &self,
        deployment: &str,
        container: &str,
        env: &str,
        value: &str,
    ) -> Result<()> {
        self.lock().deployment_env.insert(
            (deployment.to_owned(), container.to_owned(), env.to_owned()),
            value.to_owned(),
        );
        Ok(())
    }

    async fn list_module_configs(&self) -> Result<Vec<ModuleConfig>> {
        Ok(self.lock().module_configs.values().cloned().collect())
    }

    async fn get_module_config(&self, name: &str) -> Result<Option<ModuleConfig>> {
        Ok(self.lock().module_configs.get(name).cloned())
    }

    async fn apply_module_config(&self, config: &ModuleConfig) -> Result<()> {
        let mut state = self.lock();
        let name = config.name_any();
        if state.rejected_module_configs.contains(&name) {
            return Err(Error::Conflict {
                kind: "ModuleConfig".to_owned(),
                name,
            });
        }
        let resource_version = state.next_resource_version();

        let mut applied = config.clone();
        applied.status = state
            .module_configs
            .get(&name)
            .and_then(|existing| existing.status.clone());
        applied.metadata.resource_version = resource_version;
        state.module_configs.insert(name, applied);
        Ok(())
    }

    async fn write_module_config_status(&self, config: &ModuleConfig) -> Result<()> {
        let mut state = self.lock();
        let name = config.name_any();
        let conflict = state.take_injected_conflict();
        let resource_version = state.next_resource_version();

        let stored = state
            .module_configs
            .get_mut(&name)
            .ok_or_else(|| Error::NotFound {
                kind: "ModuleConfig".to_owned(),
                name: name.clone(),
            })?;
        if conflict {
            return Err(Error::Conflict {
                kind: "ModuleConfig".to_owned(),
                name,
            });
        }
        check_resource_version(&stored.metadata, &config.metadata, "ModuleConfig", &name)?;

        stored.status = config.status.clone();
        stored.metadata.resource_version = resource_version;
        state.status_writes += 1;
        Ok(())
    }

    async fn list_modules(&self) -> Result<Vec<Module>> {
        Ok(self.lock().modules.values().cloned().collect())
    }

    async fn get_module(&self, name: &str) -> Result<Option<Module>> {
        Ok(self.lock().modules.get(name).cloned())
    }

    async fn apply_module(&self, module: &Module) -> Result<()> {
        let mut state = self.lock();
        let resource_version = state.next_resource_version();
        let name = module.name_any();

        let mut applied = module.clone();
        applied.status = state
            .modules
            .get(&name)
            .and_then(|existing| existing.status.clone());
        applied.metadata.resource_version = resource_version;
        state.modules.insert(name, applied);
        Ok(())
    }

    async fn write_module_status(&self, module: &Module) -> Result<()> {
        let mut state = self.lock();
        let name = module.name_any();
        let conflict = state.take_injected_conflict();
        let resource_version = state.next_resource_version();

        let stored = state.modules.get_mut(&name).ok_or_else(|| Error::NotFound {
            kind: "Module".to_owned(),
            name: name.clone(),
        })?;
        if conflict {
            return Err(Error::Conflict {
                kind: "Module".to_owned(),
                name,
            });
        }
        check_resource_version(&stored.metadata, &module.metadata, "Module", &name)?;

        stored.status = module.status.clone();
        stored.metadata.resource_version = resource_version;
        state.status_writes += 1;
        Ok(())
    }
}
