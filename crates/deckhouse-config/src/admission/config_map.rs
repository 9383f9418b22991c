use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use tracing::info;

use super::{AdmissionRules, username};

/// Protects the ConfigMap the deployment reads its configuration from.
/// Only the platform and the garbage collector may change or delete it,
/// every other ConfigMap passes.
pub fn validate_config_map(
    rules: &AdmissionRules,
    request: &AdmissionRequest<ConfigMap>,
) -> AdmissionResponse {
    if request.name != rules.config_map_name {
        return AdmissionResponse::from(request);
    }

    let user = username(request);
    if rules.is_platform(request) || user == rules.garbage_collector_service_account {
        return AdmissionResponse::from(request);
    }

    let action = match request.operation {
        Operation::Delete => "deleting",
        _ => "changing",
    };
    info!(
        k8s.configmap.name = request.name,
        user, action, "rejecting change of the configuration ConfigMap"
    );

    AdmissionResponse::from(request).deny(format!(
        "{action} ConfigMap/{name} is not allowed for {user}. Use ModuleConfig resources to configure Deckhouse.",
        name = request.name
    ))
}
