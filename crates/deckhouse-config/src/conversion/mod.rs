//! Settings schema evolution.
//!
//! A [`Conversion`] migrates a settings document from one schema version to a
//! newer one. Conversions of one module form a chain that ends at the latest
//! version. Chains come in two flavours that share the [`ConversionChain`]
//! contract: programmatic ones ([`Chain`]) built from Rust closures and
//! declarative ones ([`FileConverter`]) loaded from filter files.

use std::{fmt, sync::Arc};

use snafu::{ResultExt, Snafu, ensure};

use crate::settings::Settings;

mod chain;
mod file;
mod registry;

pub use chain::Chain;
pub use file::{ConversionFile, Error as FileError, FileConverter};
pub use registry::{LoadError, Registry};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type returned by a conversion step.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single migration step. Mutates the (already cloned) document in place.
pub type ConversionFn = dyn Fn(&Settings) -> std::result::Result<(), BoxedError> + Send + Sync;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("version {version} is unknown"))]
    UnknownVersion { version: u32 },

    #[snafu(display("conversion chain is broken: no conversion from version {version}"))]
    BrokenChain { version: u32 },

    #[snafu(display("conversion chain loops: gave up after {steps} steps"))]
    Loop { steps: usize },

    #[snafu(display("conversion from version {version} failed: {source}"))]
    Propagated { source: BoxedError, version: u32 },

    #[snafu(display(
        "invalid conversion {source_version} -> {target_version}: source must be lower than target"
    ))]
    InvalidConversion {
        source_version: u32,
        target_version: u32,
    },

    #[snafu(display(
        "module {module:?} already has {existing} conversions, cannot register {requested} ones"
    ))]
    BackendConflict {
        module: String,
        existing: &'static str,
        requested: &'static str,
    },
}

/// The common contract of programmatic and file-based chains.
pub trait ConversionChain: fmt::Debug + Send + Sync {
    fn latest_version(&self) -> u32;

    /// True for the latest version and every version a conversion starts at.
    fn is_known_version(&self, version: u32) -> bool;

    /// Every version a conversion starts at, in ascending order.
    fn previous_versions(&self) -> Vec<u32>;

    /// Converts `settings` from `from_version` to the latest version. The
    /// input is never mutated.
    fn convert_to_latest(&self, from_version: u32, settings: &Settings) -> Result<Settings>;
}

#[derive(Clone)]
pub struct Conversion {
    source: u32,
    target: u32,
    function: Arc<ConversionFn>,
}

impl Conversion {
    pub fn new<F>(source: u32, target: u32, function: F) -> Result<Self>
    where
        F: Fn(&Settings) -> std::result::Result<(), BoxedError> + Send + Sync + 'static,
    {
        ensure!(
            source < target,
            InvalidConversionSnafu {
                source_version: source,
                target_version: target,
            }
        );

        Ok(Self {
            source,
            target,
            function: Arc::new(function),
        })
    }

    pub fn source(&self) -> u32 {
        self.source
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Applies the step to a copy of `settings`.
    pub fn convert(&self, settings: &Settings) -> Result<Settings> {
        let converted = settings.clone();
        (self.function)(&converted).context(PropagatedSnafu {
            version: self.source,
        })?;
        Ok(converted)
    }
}

impl fmt::Debug for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversion")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}
