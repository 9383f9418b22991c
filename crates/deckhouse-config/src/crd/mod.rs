//! Custom resources owned by the module configuration core.

use schemars::{Schema, SchemaGenerator, json_schema};

pub mod module;
pub mod module_config;

pub use module::{Module, ModuleCondition, ModulePhase, ModuleProperties, ModuleStatus};
pub use module_config::{ModuleConfig, ModuleConfigSpec, ModuleConfigState, ModuleConfigStatus};

/// Schema of a free-form object, kept as is by the API server.
pub fn raw_object_schema(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    })
}
