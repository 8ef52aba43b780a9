// ===================================================================================================
// Error Handling System - Error Types and Retry Classification
// ===================================================================================================
//
// Structured error types for the node's core pipeline: the metadata store,
// the segment container, the crypto kit, the task controller, and the
// upload/download engines all return `MeshResult<T>`. Each variant maps to
// one of the error kinds the engines must distinguish; `temporary()` and
// `timeout()` implement the "retryable error" classification used by the
// task controller's retry discipline.
// ===================================================================================================

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub enum MeshError {
    /// File system I/O operation failures.
    Io(String),

    /// Generic peer-transport failure (dial, stream open/read/write, gossipsub publish).
    Transport(String),

    /// Store lookup returned nothing. Not a failure on its own; callers treat
    /// this as a signal (e.g. "no existing download record yet").
    NotFound(String),

    /// Duplicate task/segment id on insert. Upload preparation converts this
    /// into an update rather than propagating it.
    AlreadyExists(String),

    /// Container CRC or xref mismatch, or a verified-field mismatch
    /// (segment_id / file_id / slice_table hash) on a fetched segment.
    Corrupt(String),

    /// Reed-Solomon could not reconstruct: fewer than `data_shards` shards
    /// are present across the stripe.
    InsufficientShards(String),

    /// ECDSA signature verification failed on a container or control message.
    Signature(String),

    /// A P2PKH/P2PK script was malformed or its embedded pubkey-hash did not
    /// match the expected owner.
    Script(String),

    /// Task-controller cancellation: the task's own context, or its parent,
    /// was cancelled before the handler completed.
    TaskCanceled(String),

    /// Task-controller timeout: `task_timeout` elapsed before completion.
    TaskTimeout(String),

    /// Task-controller queue/worker budget exhausted (e.g. on shutdown with
    /// tasks still active, or `submit` against a full queue).
    SystemBusy(String),

    /// Persistent store operation failed for a reason other than "not found"
    /// (disk I/O, corruption, query failure).
    Store(String),

    /// Cryptographic operation failure not covered by `Signature`/`Script`
    /// (key parsing, AES-GCM failure, Shamir reconstruction failure).
    Crypto(String),

    /// Data (de)serialization failure (bincode/serde/hex).
    Serialization(String),

    /// Configuration file invalid or a required parameter missing.
    Config(String),

    /// Catch-all for conditions that don't fit another variant.
    Generic(String),
}

impl MeshError {
    /// True for errors the caller may usefully retry immediately.
    pub fn temporary(&self) -> bool {
        matches!(self, MeshError::Transport(_) | MeshError::SystemBusy(_))
    }

    /// True for errors caused by a deadline elapsing.
    pub fn timeout(&self) -> bool {
        matches!(self, MeshError::TaskTimeout(_))
    }

    /// `temporary() || timeout()` — the task controller's retry predicate.
    pub fn retryable(&self) -> bool {
        self.temporary() || self.timeout()
    }
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::Io(e) => write!(f, "IO error: {}", e),
            MeshError::Transport(e) => write!(f, "transport error: {}", e),
            MeshError::NotFound(e) => write!(f, "not found: {}", e),
            MeshError::AlreadyExists(e) => write!(f, "already exists: {}", e),
            MeshError::Corrupt(e) => write!(f, "corrupt: {}", e),
            MeshError::InsufficientShards(e) => write!(f, "insufficient shards: {}", e),
            MeshError::Signature(e) => write!(f, "signature error: {}", e),
            MeshError::Script(e) => write!(f, "script error: {}", e),
            MeshError::TaskCanceled(e) => write!(f, "task canceled: {}", e),
            MeshError::TaskTimeout(e) => write!(f, "task timeout: {}", e),
            MeshError::SystemBusy(e) => write!(f, "system busy: {}", e),
            MeshError::Store(e) => write!(f, "store error: {}", e),
            MeshError::Crypto(e) => write!(f, "cryptographic error: {}", e),
            MeshError::Serialization(e) => write!(f, "serialization error: {}", e),
            MeshError::Config(e) => write!(f, "configuration error: {}", e),
            MeshError::Generic(e) => write!(f, "error: {}", e),
        }
    }
}

impl StdError for MeshError {}

impl From<std::io::Error> for MeshError {
    fn from(error: std::io::Error) -> Self {
        MeshError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(error: serde_json::Error) -> Self {
        MeshError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for MeshError {
    fn from(error: bincode::Error) -> Self {
        MeshError::Serialization(error.to_string())
    }
}

impl From<hex::FromHexError> for MeshError {
    fn from(error: hex::FromHexError) -> Self {
        MeshError::Serialization(format!("hex decode error: {}", error))
    }
}

impl From<reed_solomon_erasure::Error> for MeshError {
    fn from(error: reed_solomon_erasure::Error) -> Self {
        match error {
            reed_solomon_erasure::Error::TooFewShardsPresent => {
                MeshError::InsufficientShards("too few shards present".to_string())
            }
            other => MeshError::Crypto(format!("reed-solomon error: {:?}", other)),
        }
    }
}

impl From<secp256k1::Error> for MeshError {
    fn from(error: secp256k1::Error) -> Self {
        MeshError::Signature(error.to_string())
    }
}

impl From<aes_gcm::Error> for MeshError {
    fn from(_error: aes_gcm::Error) -> Self {
        MeshError::Crypto("AES-GCM operation failed".to_string())
    }
}

impl From<rusqlite::Error> for MeshError {
    fn from(error: rusqlite::Error) -> Self {
        MeshError::Store(error.to_string())
    }
}

impl From<sled::Error> for MeshError {
    fn from(error: sled::Error) -> Self {
        MeshError::Store(error.to_string())
    }
}

impl From<anyhow::Error> for MeshError {
    fn from(error: anyhow::Error) -> Self {
        MeshError::Generic(error.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type MeshResult<T> = Result<T, MeshError>;
