//! Admission rules guarding ModuleConfig resources, Module resources and the
//! ConfigMap the platform reads its configuration from.
//!
//! The handlers take the request and return the response without any I/O, so
//! they are safe to call concurrently and from any HTTP framework.

use std::sync::Arc;

use kube::core::admission::{AdmissionRequest, AdmissionResponse};

use crate::{
    constants::{GARBAGE_COLLECTOR_SERVICE_ACCOUNT, PLATFORM_SERVICE_ACCOUNT},
    names::PossibleNames,
    validator::ConfigValidator,
};

mod config_map;
mod module;
mod module_config;

pub use config_map::validate_config_map;
pub use module::validate_module;
pub use module_config::validate_module_config;

pub const MODULE_CONFIG_PATH: &str = "/validate/v1alpha1/module-configs";
pub const MODULE_PATH: &str = "/validate/v1alpha1/modules";
pub const CONFIG_MAP_PATH: &str = "/validate/core/v1/configmap";

/// Everything the admission rules consult.
#[derive(Clone, Debug)]
pub struct AdmissionRules {
    pub validator: Arc<ConfigValidator>,
    pub possible_names: PossibleNames,

    /// The ConfigMap the deployment reads its configuration from.
    pub config_map_name: String,

    pub platform_service_account: String,
    pub garbage_collector_service_account: String,
}

impl AdmissionRules {
    pub fn new(
        validator: Arc<ConfigValidator>,
        possible_names: PossibleNames,
        config_map_name: impl Into<String>,
    ) -> Self {
        Self {
            validator,
            possible_names,
            config_map_name: config_map_name.into(),
            platform_service_account: PLATFORM_SERVICE_ACCOUNT.to_owned(),
            garbage_collector_service_account: GARBAGE_COLLECTOR_SERVICE_ACCOUNT.to_owned(),
        }
    }

    pub fn with_platform_service_account(mut self, service_account: impl Into<String>) -> Self {
        self.platform_service_account = service_account.into();
        self
    }

    fn is_platform<R: kube::Resource>(&self, request: &AdmissionRequest<R>) -> bool {
        username(request) == self.platform_service_account
    }
}

fn username<R: kube::Resource>(request: &AdmissionRequest<R>) -> &str {
    request.user_info.username.as_deref().unwrap_or_default()
}

fn allow_with_warning<R>(
    request: &AdmissionRequest<R>,
    warning: impl Into<String>,
) -> AdmissionResponse
where
    R: kube::Resource,
{
    let mut response = AdmissionResponse::from(request);
    response.warnings = Some(vec![warning.into()]);
    response
}

#[cfg(test)]
pub(crate) mod test_utils {
    use kube::{
        Resource,
        core::admission::{AdmissionRequest, AdmissionReview},
    };
    use serde::de::DeserializeOwned;
    use serde_json::{Value, json};

    /// Builds a request the way the API server sends it.
    pub fn request<R>(
        operation: &str,
        name: &str,
        username: &str,
        object: Option<Value>,
    ) -> AdmissionRequest<R>
    where
        R: Resource + DeserializeOwned,
    {
        let (old_object, object) = match operation {
            "DELETE" => (object, None),
            _ => (None, object),
        };

        let review: AdmissionReview<R> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "3b1c0ad6-0c53-4c1f-9a0a-0b2b5a8e51f2",
                "kind": {"group": "", "version": "v1", "kind": "Unused"},
                "resource": {"group": "", "version": "v1", "resource": "unused"},
                "name": name,
                "operation": operation,
                "userInfo": {"username": username},
                "object": object,
                "oldObject": old_object,
                "dryRun": false,
            },
        }))
        .expect("valid AdmissionReview");

        review.try_into().expect("review carries a request")
    }
}
