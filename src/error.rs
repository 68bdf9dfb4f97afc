//! Error types for the orchestration engine.
//!
//! Engine operations fail with [`OrchestratorError`]; the metadata store has
//! its own [`StoreError`] which folds into the engine taxonomy. The binary
//! wraps both in `anyhow` at the CLI boundary.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = std::result::Result<T, OrchestratorError>;

/// Failures raised by the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced document does not exist (or has expired).
    #[error("no document '{id}' in collection '{collection}'")]
    Missing { collection: String, id: String },

    /// A persisted document no longer deserializes into its model.
    #[error("malformed document in '{collection}': {detail}")]
    Corrupt { collection: String, detail: String },

    /// Snapshot file could not be read or written.
    #[error("store snapshot i/o: {0}")]
    Snapshot(String),
}

impl StoreError {
    pub fn missing(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Missing {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn corrupt(collection: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            collection: collection.into(),
            detail: detail.into(),
        }
    }
}

/// Failures surfaced by engine operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A referenced compute party id is not present in the registry.
    #[error("compute party '{mpc_id}' is not registered")]
    UnregisteredParty { mpc_id: String },

    /// Unknown or unowned entity. Deliberately carries no detail: ownership
    /// failures must not reveal whether another user's analysis exists.
    #[error("not found")]
    NotFound,

    /// A compute party returned an error payload, an unparsable response, or
    /// the request to it failed outright. `detail` preserves the raw upstream
    /// payload for diagnostics.
    #[error("party '{mpc_id}' compute error: {detail}")]
    PartyCompute { mpc_id: String, detail: String },

    /// Structural mismatch among the batch arrays and sizes.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// An analysis spec violates a model invariant.
    #[error("invalid analysis: {0}")]
    InvalidAnalysis(String),

    /// A streaming session is already active.
    #[error("already streaming; only one streaming session can run at a time")]
    AlreadyStreaming,

    /// No streaming session is active.
    #[error("not streaming")]
    NotStreaming,

    /// No caller identity was resolved for an identity-scoped operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The dataset service rejected or failed a data-plane call.
    #[error("dataset service error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn unregistered(mpc_id: impl Into<String>) -> Self {
        Self::UnregisteredParty {
            mpc_id: mpc_id.into(),
        }
    }

    pub fn party(mpc_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PartyCompute {
            mpc_id: mpc_id.into(),
            detail: detail.into(),
        }
    }

    pub fn invalid_batch(reason: impl Into<String>) -> Self {
        Self::InvalidBatch(reason.into())
    }

    pub fn invalid_analysis(reason: impl Into<String>) -> Self {
        Self::InvalidAnalysis(reason.into())
    }

    pub fn dataset(detail: impl Into<String>) -> Self {
        Self::Dataset(detail.into())
    }
}
