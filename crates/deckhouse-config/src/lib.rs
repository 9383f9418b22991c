//! Module configuration core of the Deckhouse controller.
//!
//! Users configure modules through `ModuleConfig` resources. This crate
//! converts their versioned settings, validates them against the module
//! schemas, mirrors them into the ConfigMap the hook runtime reads, reports
//! statuses back and guards writes through admission rules.

pub mod admission;
pub mod aggregated;
pub mod bootstrap;
pub mod cli;
pub mod constants;
pub mod conversion;
pub mod crd;
pub mod initial_config;
pub mod logging;
pub mod modules;
pub mod names;
pub mod openapi;
pub mod service;
pub mod settings;
pub mod status;
pub mod store;
pub mod transformer;
pub mod utils;
pub mod validator;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use prometheus;
