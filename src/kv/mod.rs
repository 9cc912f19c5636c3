//! Replicated key-value store.
//!
//! Every process keeps a local read-through cache per bucket and follows the
//! bucket's change log through a [`ReplicationBackend`]. Writes go to the
//! backend first (compare-and-set on the record revision) and are applied to
//! the local cache only once committed.

pub mod backend;
pub mod index;
pub mod store;

use thiserror::Error;

pub use backend::{ChangeEntry, ChangeOp, MemoryBackend, ReplicationBackend, VersionedValue};
pub use index::JobIndex;
pub use store::{ChangeOrigin, KvStore, Loader, StoreHooks};

#[derive(Error, Debug)]
pub enum KvError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Revision mismatch on {key}: expected {expected}, actual {actual}")]
    RevisionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Update of {key} still contended after {attempts} attempts")]
    Contended { key: String, attempts: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type KvResult<T> = std::result::Result<T, KvError>;
