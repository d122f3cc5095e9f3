//! Candidate listing.
//!
//! Lists the library's Live Photos that are not yet in the ledger, split
//! into unedited and edited ones, and keeps that list current as the
//! library changes or the ledger is updated.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ledger::{AssetLedger, LedgerEvent};
use crate::library::{PhotoStore, StoreError};
use crate::types::{AssetId, CandidateFilter, LibraryChange, PhotoAsset};

/// Unprocessed Live Photos, each list in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    pub unedited: Vec<PhotoAsset>,
    /// Assets carrying adjustment data; copying them keeps the edit but the
    /// edit can no longer be reverted to the Live Photo.
    pub edited: Vec<PhotoAsset>,
}

impl CandidateSet {
    /// Both lists merged back into creation order.
    pub fn all(&self) -> Vec<PhotoAsset> {
        let mut all: Vec<PhotoAsset> = self.unedited.iter().chain(&self.edited).cloned().collect();
        all.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn ids(&self) -> BTreeSet<AssetId> {
        self.unedited
            .iter()
            .chain(&self.edited)
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.unedited.iter().chain(&self.edited).any(|a| a.id == *id)
    }

    pub fn len(&self) -> usize {
        self.unedited.len() + self.edited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the given ids from both lists.
    pub fn prune(&mut self, removed: &BTreeSet<AssetId>) {
        self.unedited.retain(|a| !removed.contains(&a.id));
        self.edited.retain(|a| !removed.contains(&a.id));
    }
}

pub struct CandidateScanner {
    store: Arc<dyn PhotoStore>,
    ledger: Arc<dyn AssetLedger>,
}

impl std::fmt::Debug for CandidateScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateScanner").finish_non_exhaustive()
    }
}

impl CandidateScanner {
    pub fn new(store: Arc<dyn PhotoStore>, ledger: Arc<dyn AssetLedger>) -> Self {
        Self { store, ledger }
    }

    pub async fn scan(&self) -> Result<CandidateSet, StoreError> {
        let assets = self.store.fetch_candidates(CandidateFilter::LivePhotos).await?;
        let total = assets.len();
        let mut set = CandidateSet::default();
        for asset in assets {
            if self.ledger.contains(&asset.id) {
                continue;
            }
            if asset.has_adjustments {
                set.edited.push(asset);
            } else {
                set.unedited.push(asset);
            }
        }
        tracing::debug!(
            live_photos = total,
            unedited = set.unedited.len(),
            edited = set.edited.len(),
            "Scanned candidates"
        );
        Ok(set)
    }

    /// Bring `set` up to date after a library change. Insertions, changed
    /// assets and an empty diff trigger a full rescan; pure removals are
    /// pruned in place.
    pub async fn apply_change(
        &self,
        set: &mut CandidateSet,
        change: &LibraryChange,
    ) -> Result<(), StoreError> {
        if change.is_empty() || !change.inserted.is_empty() || !change.changed.is_empty() {
            *set = self.scan().await?;
        } else {
            set.prune(&change.removed);
        }
        Ok(())
    }

    /// Keep a candidate set current in the background until `cancel` fires.
    pub fn spawn_watch(
        self: Arc<Self>,
        initial: CandidateSet,
        cancel: CancellationToken,
    ) -> (watch::Receiver<CandidateSet>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(initial);
        let mut changes = self.store.subscribe_changes();
        let mut ledger_events = self.ledger.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let mut current = tx.borrow().clone();
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) => self.apply_change(&mut current, &change).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Missed library changes, rescanning");
                            self.scan().await.map(|set| current = set)
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = ledger_events.recv() => match event {
                        Ok(LedgerEvent::Recorded(ids)) => {
                            current.prune(&ids.into_iter().collect());
                            Ok(())
                        }
                        Ok(LedgerEvent::Reset) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            tracing::info!("Ledger reset, rescanning candidates");
                            self.scan().await.map(|set| current = set)
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                match result {
                    Ok(()) => {
                        tx.send_replace(current);
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to refresh candidates"),
                }
            }
        });
        (rx, handle)
    }
}
