use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::ConfigMap};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{ListParams, Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use snafu::ResultExt;
use tracing::{debug, instrument};

use super::{ClusterStore, Error, ListSnafu, Result, SerializeSnafu};
use crate::{
    constants::FIELD_MANAGER,
    crd::{Module, ModuleConfig},
};

/// [`ClusterStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn module_configs(&self) -> Api<ModuleConfig> {
        Api::all(self.client.clone())
    }

    fn modules(&self) -> Api<Module> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>> {
        get_opt(&self.config_maps(), name).await
    }

    #[instrument(skip_all, fields(k8s.configmap.name = config_map.name_any()))]
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let mut config_map = config_map.clone();
        config_map.metadata.namespace = Some(self.namespace.clone());
        apply(&self.config_maps(), &config_map).await
    }

    #[instrument(skip(self))]
    async fn set_deployment_env(
        &self,
        deployment: &str,
        container: &str,
        env: &str,
        value: &str,
    ) -> Result<()> {
        let patch = json!({
            "spec": {
                "template": {
                    "spec": {
                        "containers": [{
                            "name": container,
                            "env": [{"name": env, "value": value}],
                        }],
                    },
                },
            },
        });

        self.deployments()
            .patch(deployment, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(|error| request_error(error, "patch", "Deployment".to_owned(), deployment))?;
        Ok(())
    }

    async fn list_module_configs(&self) -> Result<Vec<ModuleConfig>> {
        list(&self.module_configs()).await
    }

    async fn get_module_config(&self, name: &str) -> Result<Option<ModuleConfig>> {
        get_opt(&self.module_configs(), name).await
    }

    #[instrument(skip_all, fields(module.name = config.name_any()))]
    async fn apply_module_config(&self, config: &ModuleConfig) -> Result<()> {
        let mut config = config.clone();
        config.status = None;
        apply(&self.module_configs(), &config).await
    }

    async fn write_module_config_status(&self, config: &ModuleConfig) -> Result<()> {
        write_status(&self.module_configs(), config, &config.status).await
    }

    async fn list_modules(&self) -> Result<Vec<Module>> {
        list(&self.modules()).await
    }

    async fn get_module(&self, name: &str) -> Result<Option<Module>> {
        get_opt(&self.modules(), name).await
    }

    #[instrument(skip_all, fields(module.name = module.name_any()))]
    async fn apply_module(&self, module: &Module) -> Result<()> {
        let mut module = module.clone();
        module.status = None;
        apply(&self.modules(), &module).await
    }

    async fn write_module_status(&self, module: &Module) -> Result<()> {
        write_status(&self.modules(), module, &module.status).await
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(status)) if status.code == 404 => Ok(None),
        Err(error) => Err(request_error(error, "get", kind::<K>(), name)),
    }
}

async fn list<K>(api: &Api<K>) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    let objects = api
        .list(&ListParams::default())
        .await
        .context(ListSnafu { kind: kind::<K>() })?;
    Ok(objects.items)
}

/// Server-side apply with our field manager. Fields we stop sending are
/// removed by the API server.
async fn apply<K>(api: &Api<K>, object: &K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    let name = object.name_any();
    let mut object = object.clone();
    object.meta_mut().managed_fields = None;
    object.meta_mut().resource_version = None;

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&object),
    )
    .await
    .map_err(|error| request_error(error, "apply", kind::<K>(), &name))?;

    debug!(kind = %kind::<K>(), name, "applied object");
    Ok(())
}

/// Merge-patches the status subresource. The resource version travels in the
/// patch, so a stale object is rejected with a conflict.
async fn write_status<K, S>(api: &Api<K>, object: &K, status: &Option<S>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    S: Serialize,
{
    let name = object.name_any();
    let status = serde_json::to_value(status).context(SerializeSnafu {
        kind: kind::<K>(),
        name: &name,
    })?;
    let patch = json!({
        "metadata": {"resourceVersion": object.meta().resource_version},
        "status": status,
    });

    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(patch))
        .await
        .map_err(|error| request_error(error, "update status of", kind::<K>(), &name))?;
    Ok(())
}

fn kind<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).into_owned()
}

fn request_error(error: kube::Error, action: &'static str, kind: String, name: &str) -> Error {
    match error {
        kube::Error::Api(status) if status.code == 409 => Error::Conflict {
            kind,
            name: name.to_owned(),
        },
        kube::Error::Api(status) if status.code == 404 => Error::NotFound {
            kind,
            name: name.to_owned(),
        },
        source => Error::Request {
            source,
            action,
            kind,
            name: name.to_owned(),
        },
    }
}
