use std::sync::{Arc, Mutex};

use missive_store::Database;

use crate::error::{EngineError, Result};

/// Shared handle to the engine database.
///
/// The ledger and the queue each write through it while holding their own
/// collection lock, so the database lock is always taken last.
#[derive(Clone)]
pub struct Persistence {
    db: Arc<Mutex<Database>>,
}

impl Persistence {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn with<T>(&self, f: impl FnOnce(&Database) -> missive_store::Result<T>) -> Result<T> {
        let guard = self
            .db
            .lock()
            .map_err(|_| EngineError::LockPoisoned("database"))?;
        Ok(f(&guard)?)
    }
}
