//! Persistent state stores.
//!
//! Each store owns one file under the project-local state directory. Reads
//! take a shared lock, writes take an exclusive lock, and every write is
//! atomic (temp file + fsync + rename), so cross-process observers always see
//! a self-consistent snapshot.

mod memory;
mod plan;
mod recovery;
mod status;

pub use memory::{extract_memory_markers, Memory, MemoryKind, MemoryStore};
pub use plan::PlanStore;
pub use recovery::RecoveryStore;
pub use status::{StatusSnapshot, StatusStore};

/// Errors raised by the state stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A state file exists but cannot be parsed. Non-recoverable for the run;
    /// the locking discipline makes this unreachable short of external
    /// tampering.
    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no implementation plan to update")]
    NoPlan,

    #[error("unknown subtask: {0}")]
    UnknownSubtask(String),
}
