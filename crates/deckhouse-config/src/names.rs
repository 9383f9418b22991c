//! Module names and their values keys.
//!
//! Module names are kebab-cased (`module-one`), values keys are the camelCased
//! form used in the aggregated ConfigMap and in OpenAPI schemas (`moduleOne`).

use std::collections::{BTreeMap, BTreeSet};

use convert_case::{Case, Casing};

use crate::constants::{ENABLED_KEY_SUFFIX, GLOBAL_MODULE_NAME};

pub fn values_key(module_name: &str) -> String {
    module_name.to_case(Case::Camel)
}

pub fn enabled_key(module_name: &str) -> String {
    format!("{}{ENABLED_KEY_SUFFIX}", values_key(module_name))
}

pub fn is_global(module_name: &str) -> bool {
    module_name == GLOBAL_MODULE_NAME
}

/// Best-effort inverse of [`values_key`] for keys of unknown modules.
pub fn module_name_from_values_key(values_key: &str) -> String {
    let mut name = String::with_capacity(values_key.len() + 4);
    for c in values_key.chars() {
        if c.is_ascii_uppercase() {
            name.push('-');
            name.push(c.to_ascii_lowercase());
        } else {
            name.push(c);
        }
    }
    name
}

/// Module names the platform knows about, always including `global`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PossibleNames {
    names: BTreeSet<String>,
    by_values_key: BTreeMap<String, String>,
}

impl Default for PossibleNames {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl PossibleNames {
    pub fn new<I, S>(module_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: BTreeSet<String> = module_names.into_iter().map(Into::into).collect();
        names.insert(GLOBAL_MODULE_NAME.to_owned());

        let by_values_key = names
            .iter()
            .map(|name| (values_key(name), name.clone()))
            .collect();

        Self {
            names,
            by_values_key,
        }
    }

    pub fn contains(&self, module_name: &str) -> bool {
        self.names.contains(module_name)
    }

    pub fn contains_values_key(&self, values_key: &str) -> bool {
        self.by_values_key.contains_key(values_key)
    }

    /// Resolves a values key to a module name. Keys of unknown modules are
    /// converted back to kebab case.
    pub fn module_name(&self, values_key: &str) -> String {
        self.by_values_key
            .get(values_key)
            .cloned()
            .unwrap_or_else(|| module_name_from_values_key(values_key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
