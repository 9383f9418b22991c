use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::{
    constants::ENABLED_KEY_SUFFIX,
    conversion::{self, Registry},
    crd::module::EMBEDDED_SOURCE,
    names::{PossibleNames, values_key},
    openapi::SchemaValidator,
};

static MODULE_DIR_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)-([a-z0-9]+(?:-[a-z0-9]+)*)$")
        .expect("failed to compile module directory regex")
});

const CONFIG_VALUES_SCHEMA: &str = "openapi/config-values.yaml";
const CONVERSIONS_DIR: &str = "openapi/conversions";
const MODULE_FILE: &str = "module.yaml";
const GLOBAL_HOOKS_DIR: &str = "global-hooks";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read modules directory {}", path.display()))]
    ReadModulesDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse {}", path.display()))]
    ParseYaml {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("module {name:?} is defined in both {} and {}", first.display(), second.display()))]
    DuplicateModule {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[snafu(display("failed to load conversions"))]
    LoadConversions { source: conversion::LoadError },
}

/// A module found on disk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleDefinition {
    pub name: String,
    pub weight: u32,
    pub path: PathBuf,
    pub source: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl ModuleDefinition {
    pub fn config_values_schema_path(&self) -> PathBuf {
        self.path.join(CONFIG_VALUES_SCHEMA)
    }

    pub fn conversions_dir(&self) -> PathBuf {
        self.path.join(CONVERSIONS_DIR)
    }
}

/// Optional `module.yaml` next to the module's hooks and templates.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModuleFile {
    weight: Option<u32>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    description: String,
}

/// Scans `dirs` for `NNN-module-name` directories. Modules are ordered by
/// weight, then name.
pub fn discover_modules(dirs: &[PathBuf]) -> Result<Vec<ModuleDefinition>> {
    let mut modules: BTreeMap<String, ModuleDefinition> = BTreeMap::new();

    for dir in dirs {
        let entries = fs::read_dir(dir).context(ReadModulesDirSnafu { path: dir })?;
        for entry in entries {
            let path = entry.context(ReadModulesDirSnafu { path: dir })?.path();
            if !path.is_dir() {
                continue;
            }

            let Some(dir_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(captures) = MODULE_DIR_NAME.captures(dir_name) else {
                continue;
            };

            let name = captures[2].to_owned();
            let mut weight = captures[1].parse().unwrap_or_default();

            let module_file: ModuleFile =
                read_optional_yaml(&path.join(MODULE_FILE))?.unwrap_or_default();
            if let Some(module_weight) = module_file.weight {
                weight = module_weight;
            }

            if let Some(existing) = modules.get(&name) {
                return DuplicateModuleSnafu {
                    name,
                    first: existing.path.clone(),
                    second: path,
                }
                .fail();
            }

            debug!(module.name = name, weight, path = %path.display(), "discovered module");
            modules.insert(name.clone(), ModuleDefinition {
                name,
                weight,
                path,
                source: EMBEDDED_SOURCE.to_owned(),
                description: module_file.description,
                tags: module_file.tags,
            });
        }
    }

    let mut modules: Vec<_> = modules.into_values().collect();
    modules.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.name.cmp(&b.name)));
    Ok(modules)
}

/// Everything loaded from the module directories at startup.
#[derive(Debug)]
pub struct ModuleDirectory {
    pub modules: Vec<ModuleDefinition>,
    pub validator: SchemaValidator,

    /// Module name to the enabled default of the bundle.
    pub bundle_defaults: BTreeMap<String, bool>,
}

impl ModuleDirectory {
    /// Discovers modules, loads their values schemas and bundle defaults, and
    /// registers their file-based conversions in `registry`.
    pub fn load(
        dirs: &[PathBuf],
        global_schema: Option<&Path>,
        bundle: &str,
        registry: &Registry,
    ) -> Result<Self> {
        let modules = discover_modules(dirs)?;
        let mut validator = SchemaValidator::new();

        let global_schema = global_schema.map(Path::to_path_buf).or_else(|| {
            dirs.iter()
                .filter_map(|dir| dir.parent())
                .map(|parent| parent.join(GLOBAL_HOOKS_DIR).join(CONFIG_VALUES_SCHEMA))
                .find(|path| path.is_file())
        });
        if let Some(path) = global_schema
            && let Some(schema) = read_optional_yaml::<Value>(&path)?
        {
            validator.set_global_schema(schema);
        }

        for module in &modules {
            if let Some(schema) = read_optional_yaml::<Value>(&module.config_values_schema_path())? {
                validator.add_module_schema(values_key(&module.name), schema);
            }

            let conversions_dir = module.conversions_dir();
            if conversions_dir.is_dir() {
                registry
                    .load_conversions_dir(&module.name, &conversions_dir)
                    .context(LoadConversionsSnafu)?;
            }
        }

        let possible_names = PossibleNames::new(modules.iter().map(|module| module.name.clone()));
        let mut bundle_defaults = BTreeMap::new();
        let bundle_file = format!("values-{}.yaml", bundle.to_lowercase());
        for dir in dirs {
            let Some(values) = read_optional_yaml::<BTreeMap<String, Value>>(&dir.join(&bundle_file))?
            else {
                continue;
            };
            bundle_defaults.extend(parse_bundle_defaults(&values, &possible_names));
        }

        info!(
            modules = modules.len(),
            bundle,
            enabled_by_bundle = bundle_defaults.values().filter(|enabled| **enabled).count(),
            "loaded module directories"
        );

        Ok(Self {
            modules,
            validator,
            bundle_defaults,
        })
    }
}

fn parse_bundle_defaults(
    values: &BTreeMap<String, Value>,
    possible_names: &PossibleNames,
) -> BTreeMap<String, bool> {
    values
        .iter()
        .filter_map(|(key, value)| {
            let values_key = key
                .strip_suffix(ENABLED_KEY_SUFFIX)
                .filter(|values_key| possible_names.contains_values_key(values_key))?;
            Some((possible_names.module_name(values_key), value.as_bool()?))
        })
        .collect()
}

fn read_optional_yaml<T>(path: &Path) -> Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
{
    if !path.is_file() {
        return Ok(None);
    }

    let content = fs::read_to_string(path).context(ReadFileSnafu { path })?;
    serde_yaml::from_str(&content)
        .map(Some)
        .context(ParseYamlSnafu { path })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;
    use crate::openapi::ValuesValidator;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("path has a parent")).expect("dir must be created");
        fs::write(path, content).expect("file must be written");
    }

    #[test]
    fn discovers_modules_by_directory_name() {
        let root = tempfile::tempdir().expect("temporary directory must be created");
        let modules_dir = root.path().join("modules");
        fs::create_dir_all(modules_dir.join("040-node-manager")).expect("dir must be created");
        fs::create_dir_all(modules_dir.join("010-cert-manager")).expect("dir must be created");
        fs::create_dir_all(modules_dir.join("images")).expect("dir must be created");
        write(
            &modules_dir.join("020-user-authn/module.yaml"),
            indoc! {"
                weight: 5
                tags: [auth]
                description: Authentication
            "},
        );

        let modules = discover_modules(&[modules_dir]).expect("modules must be discovered");
        let names: Vec<_> = modules.iter().map(|module| module.name.as_str()).collect();

        assert_eq!(names, ["user-authn", "cert-manager", "node-manager"]);
        assert_eq!(modules[0].weight, 5);
        assert_eq!(modules[0].tags, ["auth"]);
        assert_eq!(modules[0].source, EMBEDDED_SOURCE);
    }

    #[test]
    fn duplicate_modules_are_rejected() {
        let first = tempfile::tempdir().expect("temporary directory must be created");
        let second = tempfile::tempdir().expect("temporary directory must be created");
        fs::create_dir_all(first.path().join("010-cert-manager")).expect("dir must be created");
        fs::create_dir_all(second.path().join("100-cert-manager")).expect("dir must be created");

        let result = discover_modules(&[first.path().to_path_buf(), second.path().to_path_buf()]);
        assert!(matches!(result, Err(Error::DuplicateModule { .. })));
    }

    #[test]
    fn loads_schemas_conversions_and_bundle() {
        let root = tempfile::tempdir().expect("temporary directory must be created");
        let modules_dir = root.path().join("modules");
        let module_dir = modules_dir.join("100-module-one");

        write(
            &module_dir.join(CONFIG_VALUES_SCHEMA),
            indoc! {"
                type: object
                properties:
                  replicas:
                    type: integer
            "},
        );
        write(
            &module_dir.join(CONVERSIONS_DIR).join("v2.yaml"),
            indoc! {"
                version: 2
                conversions:
                  - del(.obsolete)
            "},
        );
        write(
            &root.path().join(GLOBAL_HOOKS_DIR).join(CONFIG_VALUES_SCHEMA),
            indoc! {"
                type: object
                properties:
                  clusterName:
                    type: string
            "},
        );
        write(
            &modules_dir.join("values-default.yaml"),
            indoc! {"
                moduleOneEnabled: true
                unknownModuleEnabled: true
            "},
        );

        let registry = Registry::new();
        let directory = ModuleDirectory::load(&[modules_dir], None, "Default", &registry)
            .expect("module directory must load");

        assert_eq!(registry.chain("module-one").latest_version(), 2);
        assert_eq!(
            directory.bundle_defaults,
            BTreeMap::from([("module-one".to_owned(), true)])
        );
        assert!(directory.validator.has_module_schema("moduleOne"));
        assert!(
            directory
                .validator
                .validate_module_values("moduleOne", &json!({"moduleOne": {"replicas": "x"}}))
                .is_err()
        );
        assert!(
            directory
                .validator
                .validate_global_values(&json!({"global": {"unknown": 1}}))
                .is_err()
        );
    }
}
