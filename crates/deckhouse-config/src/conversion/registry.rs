use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};

use snafu::ResultExt;
use tracing::info;

use crate::{
    conversion::{
        BackendConflictSnafu, BoxedError, Chain, Conversion, ConversionChain, FileConverter,
        Result, file,
    },
    settings::Settings,
};

#[derive(Clone, Debug)]
enum Backend {
    Programmatic(Arc<Chain>),
    File(Arc<FileConverter>),
}

impl Backend {
    fn kind(&self) -> &'static str {
        match self {
            Self::Programmatic(_) => "programmatic",
            Self::File(_) => "file-based",
        }
    }

    fn chain(&self) -> Arc<dyn ConversionChain> {
        match self {
            Self::Programmatic(chain) => chain.clone(),
            Self::File(converter) => converter.clone(),
        }
    }
}

/// Maps module names to their conversion chains.
///
/// Populated while the process starts and read-only afterwards. Modules
/// without conversions get an empty chain with latest version `1`.
#[derive(Debug, Default)]
pub struct Registry {
    backends: RwLock<BTreeMap<String, Backend>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a programmatic conversion for `module`.
    pub fn register<F>(&self, module: &str, source: u32, target: u32, function: F) -> Result<()>
    where
        F: Fn(&Settings) -> std::result::Result<(), BoxedError> + Send + Sync + 'static,
    {
        self.add(module, Conversion::new(source, target, function)?)
    }

    pub fn add(&self, module: &str, conversion: Conversion) -> Result<()> {
        let mut backends = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        let backend = backends
            .entry(module.to_owned())
            .or_insert_with(|| Backend::Programmatic(Arc::default()));

        match backend {
            Backend::Programmatic(chain) => {
                chain.add(conversion);
                Ok(())
            }
            Backend::File(_) => BackendConflictSnafu {
                module,
                existing: backend.kind(),
                requested: "programmatic",
            }
            .fail(),
        }
    }

    pub fn register_file_converter(&self, module: &str, converter: FileConverter) -> Result<()> {
        let mut backends = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = backends.get(module) {
            return BackendConflictSnafu {
                module,
                existing: existing.kind(),
                requested: "file-based",
            }
            .fail();
        }

        backends.insert(module.to_owned(), Backend::File(Arc::new(converter)));
        Ok(())
    }

    /// Loads the conversion files in `dir` and registers them for `module`.
    /// A directory without conversion files registers nothing.
    pub fn load_conversions_dir(
        &self,
        module: &str,
        dir: impl AsRef<Path>,
    ) -> std::result::Result<(), LoadError> {
        let converter = FileConverter::from_dir(dir.as_ref()).context(LoadFilesSnafu { module })?;
        if converter.is_empty() {
            return Ok(());
        }

        info!(
            module.name = module,
            latest_version = converter.latest_version(),
            "registered file-based conversions"
        );
        self.register_file_converter(module, converter)
            .context(RegisterSnafu { module })
    }

    /// Returns the chain registered for `module`, or an empty chain.
    pub fn chain(&self, module: &str) -> Arc<dyn ConversionChain> {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        match backends.get(module) {
            Some(backend) => backend.chain(),
            None => Arc::new(Chain::default()),
        }
    }

    pub fn module_names(&self) -> Vec<String> {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends.keys().cloned().collect()
    }
}

#[derive(Debug, snafu::Snafu)]
pub enum LoadError {
    #[snafu(display("failed to load conversion files of module {module:?}"))]
    LoadFiles { source: file::Error, module: String },

    #[snafu(display("failed to register conversions of module {module:?}"))]
    Register {
        source: crate::conversion::Error,
        module: String,
    },
}
