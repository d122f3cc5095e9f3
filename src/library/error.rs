use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{AssetId, ResourceKind};

/// Errors reported by a photo store.
///
/// The classification helpers let the collector and the engine decide between
/// asking the user (network access), retrying (transient) and giving up.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("network access required to load {kind} of {asset}")]
    NetworkAccessRequired { asset: AssetId, kind: ResourceKind },

    #[error("operation cancelled by the user")]
    UserCancelled,

    #[error("asset not found: {0}")]
    AssetNotFound(AssetId),

    #[error("album not found: {0}")]
    AlbumNotFound(String),

    #[error("resource {kind} of {asset} is unavailable: {reason}")]
    ResourceUnavailable {
        asset: AssetId,
        kind: ResourceKind,
        reason: String,
    },

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("library at {} is locked by another process", .0.display())]
    Locked(PathBuf),

    #[error("library manifest not found at {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("malformed library manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("invalid library manifest: {0}")]
    InvalidManifest(String),

    #[error("failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// The asset is cloud-only and the request did not permit network access.
    pub fn is_network_access_required(&self) -> bool {
        matches!(self, StoreError::NetworkAccessRequired { .. })
    }

    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, StoreError::UserCancelled)
    }

    /// Whether a failed part request is worth another attempt.
    ///
    /// Interrupted or timed-out reads count as transient; missing files,
    /// malformed manifests and user decisions do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Which half of a library mutation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Creation,
    Deletion,
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationPhase::Creation => f.write_str("asset creation"),
            MutationPhase::Deletion => f.write_str("asset deletion"),
        }
    }
}

/// A failed library mutation. Mutations are all-or-nothing, so whatever the
/// phase, nothing from the change set was applied.
#[derive(Debug, Error)]
#[error("{phase} failed: {source}")]
pub struct MutationError {
    pub phase: MutationPhase,
    #[source]
    pub source: StoreError,
}

impl MutationError {
    pub fn creation(source: StoreError) -> Self {
        Self {
            phase: MutationPhase::Creation,
            source,
        }
    }

    pub fn deletion(source: StoreError) -> Self {
        Self {
            phase: MutationPhase::Deletion,
            source,
        }
    }
}
