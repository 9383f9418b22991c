use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use tracing::debug;

use super::{AdmissionRules, username};
use crate::crd::Module;

pub const MANUAL_CHANGE_MESSAGE: &str = "manual Module change is forbidden";

/// Only the platform itself changes Module resources.
pub fn validate_module(
    rules: &AdmissionRules,
    request: &AdmissionRequest<Module>,
) -> AdmissionResponse {
    if rules.is_platform(request) {
        return AdmissionResponse::from(request);
    }

    debug!(
        module.name = request.name,
        user = username(request),
        "rejecting manual Module change"
    );
    AdmissionResponse::from(request).deny(MANUAL_CHANGE_MESSAGE)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        admission::test_utils::request, constants::PLATFORM_SERVICE_ACCOUNT, conversion::Registry,
        names::PossibleNames, openapi::SchemaValidator, validator::ConfigValidator,
    };

    #[rstest]
    #[case::platform_update(PLATFORM_SERVICE_ACCOUNT, "UPDATE", true)]
    #[case::platform_delete(PLATFORM_SERVICE_ACCOUNT, "DELETE", true)]
    #[case::user_update("alice", "UPDATE", false)]
    #[case::user_delete("alice", "DELETE", false)]
    fn only_platform_changes_modules(
        #[case] username: &str,
        #[case] operation: &str,
        #[case] allowed: bool,
    ) {
        let rules = AdmissionRules::new(
            Arc::new(ConfigValidator::new(
                Arc::new(Registry::new()),
                Arc::new(SchemaValidator::new()),
            )),
            PossibleNames::new(["module-one"]),
            "deckhouse",
        );
        let module = json!({
            "apiVersion": "deckhouse.io/v1alpha1",
            "kind": "Module",
            "metadata": {"name": "module-one"},
            "properties": {"weight": 100},
        });

        let response = validate_module(
            &rules,
            &request::<Module>(operation, "module-one", username, Some(module)),
        );

        assert_eq!(response.allowed, allowed);
        if !allowed {
            assert_eq!(response.result.message, MANUAL_CHANGE_MESSAGE);
        }
    }
}
