//! Process-wide handles shared by the sync loop, the status reporter and the
//! admission handlers.
//!
//! The service is set exactly once during startup, before any watcher or
//! webhook handler runs. Reading it earlier is a wiring bug and panics.

use std::sync::{Arc, OnceLock};

use snafu::Snafu;

use crate::{
    modules::ModuleManager, names::PossibleNames, status::StatusReporter,
    validator::ConfigValidator,
};

static SERVICE: OnceLock<ConfigService> = OnceLock::new();

#[derive(Debug, Snafu)]
#[snafu(display("the config service is already initialized"))]
pub struct AlreadyInitializedError;

#[derive(Clone, Debug)]
pub struct ConfigService {
    pub module_manager: Arc<dyn ModuleManager>,
    pub possible_names: PossibleNames,
    pub validator: Arc<ConfigValidator>,
    pub status_reporter: Arc<StatusReporter>,
}

impl ConfigService {
    /// Stores `self` as the process-wide service.
    pub fn init(self) -> Result<&'static Self, AlreadyInitializedError> {
        let mut initialized = false;
        let service = SERVICE.get_or_init(|| {
            initialized = true;
            self
        });

        if initialized {
            Ok(service)
        } else {
            AlreadyInitializedSnafu.fail()
        }
    }

    pub fn try_get() -> Option<&'static Self> {
        SERVICE.get()
    }

    /// The process-wide service.
    ///
    /// # Panics
    ///
    /// Panics when called before [`ConfigService::init`].
    pub fn get() -> &'static Self {
        SERVICE
            .get()
            .expect("the config service must be initialized during startup")
    }
}
