//! Error taxonomy shared by the mesh, renderer, playback and storage layers

use thiserror::Error;

pub type WarpResult<T> = Result<T, WarpError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WarpError {
    /// Mesh creation with fewer than 2 rows or columns
    #[error("invalid mesh dimension {rows}x{cols} (rows and cols must be at least 2)")]
    InvalidDimension { rows: usize, cols: usize },

    /// Point ids or grid topology are inconsistent
    #[error("malformed mesh: {0}")]
    MalformedMesh(String),

    /// A point id or cue id is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// The frame source has nothing to show at this tick
    #[error("frame not ready")]
    FrameNotReady,

    /// Blob store read or write failed
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// A destructive action was requested without confirmation
    #[error("{0} requires confirmation")]
    ConfirmationRequired(&'static str),
}

impl WarpError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMesh(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::PersistenceFailure(msg.into())
    }
}
