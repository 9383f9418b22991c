//! Names shared by the controller, the webhooks and the status reporter.

/// Namespace the platform runs in.
pub const DECKHOUSE_NAMESPACE: &str = "d8-system";

/// The user-facing ConfigMap of older installations.
pub const LEGACY_CONFIG_MAP_NAME: &str = "deckhouse";

/// The ConfigMap generated from ModuleConfig resources.
pub const GENERATED_CONFIG_MAP_NAME: &str = "deckhouse-generated-config-do-not-edit";

/// Marks a generated ConfigMap whose content still has to be turned into
/// ModuleConfig resources.
pub const MIGRATION_IN_PROGRESS_ANNOTATION: &str = "deckhouse.io/migration-in-progress";

/// Environment variable naming the ConfigMap the hook runtime reads.
pub const CONFIG_MAP_ENV: &str = "ADDON_OPERATOR_CONFIG_MAP";

/// Environment variable with colon-separated module directories.
pub const MODULES_DIR_ENV: &str = "MODULES_DIR";

pub const DEPLOYMENT_NAME: &str = "deckhouse";
pub const CONTAINER_NAME: &str = "deckhouse";

pub const PLATFORM_SERVICE_ACCOUNT: &str = "system:serviceaccount:d8-system:deckhouse";
pub const GARBAGE_COLLECTOR_SERVICE_ACCOUNT: &str =
    "system:serviceaccount:kube-system:generic-garbage-collector";

/// Reserved module name for cluster-wide settings.
pub const GLOBAL_MODULE_NAME: &str = "global";

/// Suffix of the ConfigMap keys mirroring `spec.enabled`.
pub const ENABLED_KEY_SUFFIX: &str = "Enabled";

/// Prefix of the labels derived from module tags.
pub const MODULE_TAG_LABEL_DOMAIN: &str = "module.deckhouse.io";

pub const FIELD_MANAGER: &str = "deckhouse-controller";

pub const API_GROUP: &str = "deckhouse.io";
pub const API_VERSION: &str = "v1alpha1";
