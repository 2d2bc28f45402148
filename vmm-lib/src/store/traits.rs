// SPDX-License-Identifier: GPL-2.0-only
use crate::vm::VmRecord;

/// Errors from the VM record store.
#[derive(Debug)]
pub enum StoreError {
    /// No record with this name
    NotFound(String),
    /// A record with this name already exists
    AlreadyExists(String),
    /// The persisted form could not be encoded or decoded
    Corrupt(String),
    /// Filesystem operation failed
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(name) => write!(f, "VM '{name}' not found"),
            StoreError::AlreadyExists(name) => write!(f, "VM '{name}' already exists"),
            StoreError::Corrupt(e) => write!(f, "corrupt VM record: {e}"),
            StoreError::Io(e) => write!(f, "store I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// VM record persistence.
///
/// Records are addressed by VM name. Each write replaces one record
/// atomically; there is no locking across records.
pub trait VmStore: Send + Sync {
    /// Persist a new record. Fails with `AlreadyExists` if the name is taken.
    fn create(&self, record: &VmRecord) -> Result<(), StoreError>;

    /// Load a record by name. Fails with `NotFound` if absent.
    fn load(&self, name: &str) -> Result<VmRecord, StoreError>;

    /// Overwrite an existing record. A failed write leaves the previous
    /// contents intact.
    fn save(&self, record: &VmRecord) -> Result<(), StoreError>;

    /// Every readable record. Corrupt entries are skipped, not fatal.
    fn list(&self) -> Result<Vec<VmRecord>, StoreError>;

    /// Remove a record. Fails with `NotFound` if absent.
    fn delete(&self, name: &str) -> Result<(), StoreError>;

    fn exists(&self, name: &str) -> bool {
        self.load(name).is_ok()
    }
}
