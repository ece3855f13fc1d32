//! Key-value backend contract.

use async_trait::async_trait;

use crate::error::BackendError;

/// A stored value and the index of its last modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub modified_index: u64,
}

/// Result of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvListing {
    pub entries: Vec<KvEntry>,
    /// Store index at the time of the listing. Watching from `index + 1`
    /// observes exactly the changes made after it.
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationAction {
    Upsert,
    Delete,
}

/// One observed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: String,
    /// New value for upserts, `None` for deletes.
    pub value: Option<Vec<u8>>,
    pub action: MutationAction,
    /// Strictly increasing across the key space.
    pub index: u64,
}

/// A distributed key-value store.
///
/// Keys are relative paths such as `lport/p1`.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Reads one key. Absence is `Ok(None)`.
    async fn read(&self, key: &str) -> Result<Option<KvEntry>, BackendError>;

    /// Lists every key under `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<KvListing, BackendError>;

    /// Unconditional write. Returns the new modification index.
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<u64, BackendError>;

    /// Writes only if the key's modification index still equals `prev_index`.
    /// Fails with [`BackendError::Conflict`] otherwise, or if the key is gone.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        prev_index: u64,
    ) -> Result<u64, BackendError>;

    /// Deletes a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Blocks until a mutation with index >= `from_index` is available and
    /// returns the first one. Ends with [`BackendError::Timeout`] when the
    /// backend's wait period elapses without a change.
    async fn watch(&self, from_index: u64) -> Result<Mutation, BackendError>;
}
