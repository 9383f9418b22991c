//! Declarative conversions shipped with a module.
//!
//! Each `*.yaml` file in a module's `openapi/conversions` directory looks like
//!
//! ```yaml
//! version: 2
//! conversions:
//!   - del(.auth.password)
//!   - if .replicas then .scale.replicas = .replicas | del(.replicas) end
//! ```
//!
//! and migrates settings from `version - 1` to `version`. The expressions are
//! joined with ` | ` into one jq filter.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use jaq_core::{
    Compiler, Ctx, RcIter,
    load::{Arena, File, Loader},
};
use jaq_json::Val;
use serde::Deserialize;
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::debug;

use crate::{
    conversion::{self, BrokenChainSnafu, ConversionChain, UnknownVersionSnafu},
    settings::{Settings, SettingsValues},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read conversions directory {}", path.display()))]
    ReadDirectory {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read conversion file {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse conversion file {}", path.display()))]
    ParseFile {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("conversion file {} has invalid version {version}, must be at least 2", path.display()))]
    InvalidVersion { path: PathBuf, version: u32 },

    #[snafu(display("version {version} is defined twice, second definition in {}", path.display()))]
    DuplicateVersion { path: PathBuf, version: u32 },

    #[snafu(display("failed to compile conversion query {query:?}: {message}"))]
    CompileQuery { query: String, message: String },

    #[snafu(display("failed to run conversion query {query:?}: {message}"))]
    RunQuery { query: String, message: String },

    #[snafu(display("conversion query returned {kind} instead of an object"))]
    NonObjectResult { kind: &'static str },

    #[snafu(display("failed to convert query result into JSON"))]
    DecodeResult { source: serde_json::Error },

    #[snafu(display("no conversion to version {version}"))]
    MissingVersion { version: u32 },
}

/// One conversion file as found on disk.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ConversionFile {
    pub version: u32,
    #[serde(default)]
    pub conversions: Vec<String>,
}

impl ConversionFile {
    pub fn query(&self) -> String {
        self.conversions.join(" | ")
    }
}

/// File-based conversion chain. The query stored for version `N` converts
/// settings from `N - 1` to `N`.
///
/// Filters are compiled when loaded to surface syntax errors early, and
/// recompiled for every run because compiled filters are not thread-safe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileConverter {
    queries: BTreeMap<u32, String>,
}

impl FileConverter {
    /// Loads every `*.yaml` file in `dir`. Other entries are ignored.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).context(ReadDirectorySnafu { path: dir })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.context(ReadDirectorySnafu { path: dir })?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "yaml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read_to_string(&path).context(ReadFileSnafu { path: &path })?;
            let file: ConversionFile =
                serde_yaml::from_str(&content).context(ParseFileSnafu { path: &path })?;
            debug!(path = %path.display(), version = file.version, "loaded conversion file");
            files.push((path, file));
        }

        Self::from_files(files)
    }

    pub fn from_files(files: impl IntoIterator<Item = (PathBuf, ConversionFile)>) -> Result<Self> {
        let mut queries = BTreeMap::new();

        for (path, file) in files {
            ensure!(
                file.version >= 2,
                InvalidVersionSnafu {
                    path,
                    version: file.version
                }
            );
            ensure!(
                !queries.contains_key(&file.version),
                DuplicateVersionSnafu {
                    path,
                    version: file.version
                }
            );

            let query = file.query();
            compile_check(&query)?;
            queries.insert(file.version, query);
        }

        Ok(Self { queries })
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Converts `settings` from `current_version` to `target_version`, where
    /// a target of `0` means the latest version.
    pub fn convert_to(
        &self,
        current_version: u32,
        target_version: u32,
        settings: &Settings,
    ) -> Result<Settings> {
        self.convert_range(current_version, target_version, settings)
            .map_err(|(_, error)| error)
    }

    /// Like [`FileConverter::convert_to`], reporting the source version of the
    /// step that failed.
    fn convert_range(
        &self,
        current_version: u32,
        target_version: u32,
        settings: &Settings,
    ) -> Result<Settings, (u32, Error)> {
        let target_version = match target_version {
            0 => self.latest_version(),
            version => version,
        };

        let mut values = settings.map();
        for previous in current_version..target_version {
            let version = previous + 1;
            let step = |error| (previous, error);
            let query = self
                .queries
                .get(&version)
                .context(MissingVersionSnafu { version })
                .map_err(step)?;

            values = run_query(query, Value::Object(values))
                .map_err(step)?
                .unwrap_or_default();
        }

        Ok(Settings::new(values))
    }
}

impl ConversionChain for FileConverter {
    fn latest_version(&self) -> u32 {
        self.queries.keys().next_back().copied().unwrap_or(1)
    }

    fn is_known_version(&self, version: u32) -> bool {
        version == self.latest_version()
            || version
                .checked_add(1)
                .is_some_and(|next| self.queries.contains_key(&next))
    }

    fn previous_versions(&self) -> Vec<u32> {
        self.queries.keys().map(|version| version - 1).collect()
    }

    fn convert_to_latest(
        &self,
        from_version: u32,
        settings: &Settings,
    ) -> conversion::Result<Settings> {
        if from_version == self.latest_version() {
            return Ok(settings.clone());
        }

        ensure!(
            self.is_known_version(from_version),
            UnknownVersionSnafu {
                version: from_version
            }
        );

        match self.convert_range(from_version, 0, settings) {
            Ok(converted) => Ok(converted),
            Err((version, Error::MissingVersion { .. })) => BrokenChainSnafu { version }.fail(),
            Err((version, error)) => Err(conversion::Error::Propagated {
                source: Box::new(error),
                version,
            }),
        }
    }
}

fn compile_check(query: &str) -> Result<()> {
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();
    let modules = loader
        .load(&arena, File { code: query, path: () })
        .map_err(|errors| compile_error(query, &errors))?;

    Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errors| compile_error(query, &errors))?;

    Ok(())
}

/// Runs `query` on `input` and returns its first output. A stream without
/// outputs or a `null` output means the settings collapsed to nothing.
fn run_query(query: &str, input: Value) -> Result<Option<SettingsValues>> {
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();
    let modules = loader
        .load(&arena, File { code: query, path: () })
        .map_err(|errors| compile_error(query, &errors))?;

    let filter = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errors| compile_error(query, &errors))?;

    let inputs = RcIter::new(core::iter::empty());
    let mut outputs = filter.run((Ctx::new([], &inputs), Val::from(input)));

    let output = match outputs.next() {
        None => return Ok(None),
        Some(Ok(output)) => output,
        Some(Err(error)) => {
            return RunQuerySnafu {
                query,
                message: error.to_string(),
            }
            .fail();
        }
    };

    let value: Value = serde_json::from_str(&output.to_string()).context(DecodeResultSnafu)?;
    match value {
        Value::Null => Ok(None),
        Value::Object(values) => Ok(Some(values)),
        other => NonObjectResultSnafu {
            kind: value_kind(&other),
        }
        .fail(),
    }
}

fn compile_error(query: &str, errors: &impl fmt::Debug) -> Error {
    Error::CompileQuery {
        query: query.to_owned(),
        message: format!("{errors:?}"),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
