//! Cluster I/O of the bootstrap controller and the status reporter.
//!
//! [`KubeStore`] talks to the API server. [`MemoryStore`] keeps everything in
//! process and backs the tests.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use snafu::Snafu;

use crate::crd::{Module, ModuleConfig};

mod cluster;
mod memory;

pub use cluster::KubeStore;
pub use memory::MemoryStore;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to {action} {kind}/{name}"))]
    Request {
        source: kube::Error,
        action: &'static str,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to list {kind} objects"))]
    List {
        source: kube::Error,
        kind: String,
    },

    #[snafu(display("{kind}/{name} was modified concurrently"))]
    Conflict { kind: String, name: String },

    #[snafu(display("{kind}/{name} not found"))]
    NotFound { kind: String, name: String },

    #[snafu(display("failed to serialize {kind}/{name}"))]
    Serialize {
        source: serde_json::Error,
        kind: String,
        name: String,
    },
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Everything the controller reads from and writes to the cluster.
///
/// ConfigMaps live in the platform namespace, ModuleConfig and Module
/// resources are cluster-scoped.
#[async_trait]
pub trait ClusterStore: Debug + Send + Sync {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>>;

    /// Creates the ConfigMap or makes the stored one equal to `config_map`,
    /// including its annotations.
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Points the `env` variable of a deployment's container at `value`.
    async fn set_deployment_env(
        &self,
        deployment: &str,
        container: &str,
        env: &str,
        value: &str,
    ) -> Result<()>;

    async fn list_module_configs(&self) -> Result<Vec<ModuleConfig>>;

    async fn get_module_config(&self, name: &str) -> Result<Option<ModuleConfig>>;

    /// Creates the ModuleConfig or updates the spec of the existing one.
    async fn apply_module_config(&self, config: &ModuleConfig) -> Result<()>;

    /// Writes `config.status`. Fails with [`Error::Conflict`] when the stored
    /// resource version differs from the one in `config`.
    async fn write_module_config_status(&self, config: &ModuleConfig) -> Result<()>;

    async fn list_modules(&self) -> Result<Vec<Module>>;

    async fn get_module(&self, name: &str) -> Result<Option<Module>>;

    /// Creates the Module or updates its labels and properties.
    async fn apply_module(&self, module: &Module) -> Result<()>;

    /// Writes `module.status`, with the same conflict semantics as
    /// [`ClusterStore::write_module_config_status`].
    async fn write_module_status(&self, module: &Module) -> Result<()>;
}
