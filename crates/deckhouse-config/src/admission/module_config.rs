use kube::{
    ResourceExt,
    core::admission::{AdmissionRequest, AdmissionResponse, Operation},
};
use tracing::debug;

use super::{AdmissionRules, allow_with_warning};
use crate::crd::ModuleConfig;

/// Rejects ModuleConfig resources that fail validation. Deletions always
/// pass, resources of unknown modules pass with a warning.
pub fn validate_module_config(
    rules: &AdmissionRules,
    request: &AdmissionRequest<ModuleConfig>,
) -> AdmissionResponse {
    match &request.operation {
        Operation::Delete => return AdmissionResponse::from(request),
        Operation::Create | Operation::Update => {}
        operation => {
            return AdmissionResponse::from(request)
                .deny(format!("operation {operation:?} is not supported"));
        }
    }

    let Some(config) = &request.object else {
        return AdmissionResponse::from(request).deny("request carries no ModuleConfig");
    };

    let name = config.name_any();
    if !rules.possible_names.contains(&name) {
        return allow_with_warning(request, format!("module name '{name}' is unknown for deckhouse"));
    }

    let result = rules.validator.validate(config);
    if result.has_error() {
        debug!(module.name = name, error = result.error(), "rejecting ModuleConfig");
        return AdmissionResponse::from(request).deny(result.error());
    }

    if result.validate_cr_warning.is_empty() {
        AdmissionResponse::from(request)
    } else {
        allow_with_warning(request, result.validate_cr_warning)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use super::*;
    use crate::{
        admission::test_utils::request, conversion::Registry, names::PossibleNames,
        openapi::SchemaValidator, validator::ConfigValidator,
    };

    fn rules() -> AdmissionRules {
        let registry = Registry::new();
        registry
            .register("module-one", 1, 2, |settings| {
                settings.delete_and_clean("paramGroup.obsoleteParam")?;
                Ok(())
            })
            .expect("valid conversion");

        let mut schemas = SchemaValidator::new();
        schemas.add_module_schema(
            "moduleOne",
            json!({
                "type": "object",
                "properties": {"replicas": {"type": "integer"}},
            }),
        );
        let validator = ConfigValidator::new(Arc::new(registry), Arc::new(schemas));

        AdmissionRules::new(
            Arc::new(validator),
            PossibleNames::new(["module-one"]),
            "deckhouse",
        )
    }

    fn module_config(name: &str, spec: Value) -> Value {
        json!({
            "apiVersion": "deckhouse.io/v1alpha1",
            "kind": "ModuleConfig",
            "metadata": {"name": name},
            "spec": spec,
        })
    }

    fn review(operation: &str, name: &str, spec: Value) -> AdmissionResponse {
        let request = request(operation, name, "alice", Some(module_config(name, spec)));
        validate_module_config(&rules(), &request)
    }

    #[test]
    fn valid_config_is_allowed() {
        let response = review("CREATE", "module-one", json!({"version": 2, "settings": {"replicas": 1}}));

        assert!(response.allowed);
        assert_eq!(response.warnings, None);
    }

    #[test]
    fn unknown_module_is_allowed_with_warning() {
        let response = review("CREATE", "module-xyz", json!({"enabled": true}));

        assert!(response.allowed);
        assert_eq!(
            response.warnings,
            Some(vec!["module name 'module-xyz' is unknown for deckhouse".to_owned()])
        );
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let response = review("UPDATE", "module-one", json!({"version": 99, "settings": {"x": 1}}));

        assert!(!response.allowed);
        assert!(
            response
                .result
                .message
                .contains("spec.version=99 is unsupported. Use latest version 2 or one of previous versions: 1"),
            "{}",
            response.result.message
        );
    }

    #[test]
    fn obsolete_version_is_allowed_with_warning() {
        let response = review("CREATE", "module-one", json!({"version": 1, "settings": {"replicas": 1}}));

        assert!(response.allowed);
        let warnings = response.warnings.expect("warning is set");
        assert!(warnings[0].contains("spec.version=1 is obsolete"), "{warnings:?}");
    }

    #[test]
    fn schema_violation_is_rejected() {
        let response = review("CREATE", "module-one", json!({"version": 2, "settings": {"replicas": "two"}}));

        assert!(!response.allowed);
        assert!(response.result.message.contains("moduleOne"), "{}", response.result.message);
    }

    #[test]
    fn delete_is_always_allowed() {
        let response = review("DELETE", "module-one", json!({"version": 99, "settings": {"x": 1}}));

        assert!(response.allowed);
    }
}
