//! Process-lifetime memoization of a loaded runtime.

use super::{RuntimeLoader, SessionBackend};
use crate::errors::HarnessResult;
use log::info;
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Loads a runtime at most once.
///
/// Callers that arrive while a load is in flight block on that load. A failed
/// load leaves the cache empty so a later run can try again.
pub struct RuntimeCache {
    loader: Box<dyn RuntimeLoader>,
    runtime: OnceCell<Arc<dyn SessionBackend>>,
}

impl RuntimeCache {
    pub fn new(loader: Box<dyn RuntimeLoader>) -> Self {
        Self {
            loader,
            runtime: OnceCell::new(),
        }
    }

    pub fn ensure_loaded(&self) -> HarnessResult<Arc<dyn SessionBackend>> {
        self.runtime
            .get_or_try_init(|| {
                info!("Loading {}", self.loader.describe());
                self.loader.load()
            })
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.runtime.get().is_some()
    }

    pub fn describe(&self) -> String {
        self.loader.describe()
    }
}
