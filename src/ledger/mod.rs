//! Processed-asset ledger.
//!
//! Remembers which Live Photos were already replaced so that later scans
//! exclude them, across process restarts. The on-disk format is a UTF-8
//! text file with one identifier per line, appended after every committed
//! batch.

pub mod error;
pub mod file;

pub use error::LedgerError;
pub use file::FileLedger;

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::AssetId;

/// Notifications emitted by a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    /// These ids were newly recorded; candidate lists should drop them.
    Recorded(Vec<AssetId>),
    /// The ledger was cleared; candidate lists should be rebuilt.
    Reset,
}

/// Trait for ledger operations.
///
/// Object-safe so the engine and the scanner can share an
/// `Arc<dyn AssetLedger>`. Reads are served from memory and never fail.
#[async_trait]
pub trait AssetLedger: Send + Sync {
    /// True iff `id` was recorded by a previous commit.
    fn contains(&self, id: &AssetId) -> bool;

    /// Append identifiers and broadcast [`LedgerEvent::Recorded`] with the
    /// new ones. Already-recorded ids are skipped, so repeating a call is a
    /// no-op. Returns the number of newly recorded ids.
    async fn record_processed(&self, ids: &[AssetId]) -> Result<usize, LedgerError>;

    /// Snapshot of every recorded identifier.
    fn load_all(&self) -> HashSet<AssetId>;

    /// Forget everything and broadcast [`LedgerEvent::Reset`].
    async fn reset(&self) -> Result<(), LedgerError>;

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent>;
}
