//! Duplication engine.
//!
//! Takes the selected Live Photos, splits them into bounded batches and, one
//! batch at a time, collects the still-image data, commits a single library
//! transaction that creates the copies (re-linked into the originals' albums)
//! and optionally deletes the originals, then records the batch in the
//! ledger. Every transition happens inside `run`/`resume` while the engine's
//! inner lock is held, so there is exactly one logical context mutating
//! engine state.

pub mod alert;
pub mod space;

pub use alert::{Alert, AlertAction, AlertKind, AlertPresentation};
pub use space::{approx_freed_space, bytes_to_mib_rounded, paired_video_bytes};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::albums::{AlbumResolver, DEFAULT_DESTINATION_ALBUM};
use crate::collector::{CollectOutcome, CollectorOptions, CompletedCollection, ResourceCollector};
use crate::ledger::AssetLedger;
use crate::library::{AssetCreationRequest, ChangeSet, MutationPhase, PhotoStore};
use crate::retry::RetryConfig;
use crate::settings::Settings;
use crate::types::{AlbumHandle, AssetId, PhotoAsset};

/// Default number of assets per batch.
pub const DEFAULT_BLOCK_SIZE: usize = 25;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub block_size: usize,
    pub concurrent_fetches: usize,
    pub retry: RetryConfig,
    pub destination_album: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            concurrent_fetches: 8,
            retry: RetryConfig::default(),
            destination_album: DEFAULT_DESTINATION_ALBUM.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    BatchPreparing,
    BatchCollecting,
    BatchCommitting,
    BatchDone,
    /// Paused on a recoverable alert; see [`DuplicationEngine::resume`].
    Aborted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::BatchPreparing => "batch-preparing",
            EngineState::BatchCollecting => "batch-collecting",
            EngineState::BatchCommitting => "batch-committing",
            EngineState::BatchDone => "batch-done",
            EngineState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    BatchStarted { index: usize, size: usize },
    /// A batch was committed; `processed` are the originals it replaced.
    Progress { index: usize, processed: Vec<AssetId> },
    /// Every batch committed with deletion enabled.
    Completed { processed: usize },
    Alert(Alert),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The queue drained. With deletion disabled a
    /// `didFinishDuplicateWithoutDelete` alert was emitted as well.
    Finished { processed: usize },
    /// Paused on a recoverable alert; the failed batch is still queued.
    Paused(Alert),
    /// A commit failed; the queue was dropped and the engine is idle.
    Failed(Alert),
    Cancelled,
    /// There was nothing to do: the queue was empty, or `resume` was called
    /// on an engine that is not paused. No events are emitted.
    Idle,
}

struct EngineInner {
    queue: VecDeque<PhotoAsset>,
    settings: Settings,
    batches: usize,
    processed: usize,
    paused: Option<Alert>,
}

pub struct DuplicationEngine {
    store: Arc<dyn PhotoStore>,
    ledger: Arc<dyn AssetLedger>,
    collector: ResourceCollector,
    albums: AlbumResolver,
    config: EngineConfig,
    inner: Mutex<EngineInner>,
    state: watch::Sender<EngineState>,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: std::sync::Mutex<CancellationToken>,
}

impl fmt::Debug for DuplicationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplicationEngine")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DuplicationEngine {
    /// Create an engine and the receiving end of its event channel.
    pub fn new(
        store: Arc<dyn PhotoStore>,
        ledger: Arc<dyn AssetLedger>,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(EngineState::Idle);
        let engine = Self {
            collector: ResourceCollector::new(Arc::clone(&store)),
            albums: AlbumResolver::new(Arc::clone(&store), config.destination_album.clone()),
            store,
            ledger,
            config,
            inner: Mutex::new(EngineInner {
                queue: VecDeque::new(),
                settings: Settings::default(),
                batches: 0,
                processed: 0,
                paused: None,
            }),
            state,
            events,
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        };
        (engine, rx)
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Replace the queue with `assets`, processed in the given order.
    /// Clears a pause and arms a fresh cancellation token.
    pub async fn set_assets(&self, assets: Vec<PhotoAsset>) {
        let mut inner = self.inner.lock().await;
        tracing::debug!(assets = assets.len(), "Queue replaced");
        inner.queue = assets.into();
        inner.paused = None;
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        self.set_state(EngineState::Idle);
    }

    pub async fn set_settings(&self, settings: Settings) {
        self.inner.lock().await.settings = settings;
    }

    pub async fn settings(&self) -> Settings {
        self.inner.lock().await.settings
    }

    pub async fn pending(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Stop fetching and abandon the in-flight batch. Callable while a run
    /// is in progress.
    pub fn cancel(&self) {
        tracing::info!("Cancelling duplication");
        self.cancel_token().cancel();
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!(from = %previous, to = %state, "Engine state");
        }
    }

    fn emit(&self, event: EngineEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Process the queue batch by batch until it drains, a batch fails or
    /// the run is cancelled.
    pub async fn run(&self) -> RunOutcome {
        let mut inner = self.inner.lock().await;
        if let Some(alert) = inner.paused.clone() {
            tracing::warn!(alert = %alert, "Engine is paused, resume or abandon first");
            return RunOutcome::Paused(alert);
        }
        if inner.queue.is_empty() {
            tracing::debug!("Run requested with an empty queue");
            return RunOutcome::Idle;
        }
        inner.batches = 0;
        inner.processed = 0;

        if inner.settings.move_to_album {
            if let Err(e) = self.albums.destination_album().await {
                tracing::warn!(
                    album = %self.albums.destination_title(),
                    error = %e,
                    "Failed to prepare destination album"
                );
            }
        }

        let allow_network = inner.settings.include_icloud_images;
        self.drive(&mut inner, allow_network).await
    }

    /// Continue after a pause. `allow_cloud` enables cloud fetching for
    /// this and later runs.
    pub async fn resume(&self, allow_cloud: bool) -> RunOutcome {
        let mut inner = self.inner.lock().await;
        let Some(alert) = inner.paused.take() else {
            tracing::debug!("Resume requested but engine is not paused");
            return RunOutcome::Idle;
        };
        if allow_cloud {
            inner.settings.include_icloud_images = true;
        }
        tracing::info!(after = %alert.kind, allow_cloud, "Resuming duplication");
        let allow_network = inner.settings.include_icloud_images;
        self.drive(&mut inner, allow_network).await
    }

    /// Drop the paused batch and everything queued after it.
    pub async fn abandon(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let dropped = inner.queue.len();
        inner.queue.clear();
        inner.paused = None;
        self.set_state(EngineState::Idle);
        tracing::info!(dropped, "Abandoned remaining assets");
        dropped
    }

    async fn drive(&self, inner: &mut EngineInner, allow_network: bool) -> RunOutcome {
        let cancel = self.cancel_token();
        let options = CollectorOptions {
            allow_network,
            concurrency: self.config.concurrent_fetches,
            retry: self.config.retry,
        };

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(inner);
            }

            self.set_state(EngineState::BatchPreparing);
            let take = self.config.block_size.max(1).min(inner.queue.len());
            if take == 0 {
                break;
            }
            let batch: Vec<PhotoAsset> = inner.queue.drain(..take).collect();
            inner.batches += 1;
            let index = inner.batches;
            tracing::info!(batch = index, size = batch.len(), remaining = inner.queue.len(), "Starting batch");
            self.emit(EngineEvent::BatchStarted {
                index,
                size: batch.len(),
            });

            self.set_state(EngineState::BatchCollecting);
            let data = match self.collector.collect(&batch, &options, &cancel).await {
                CollectOutcome::Complete(data) => data,
                CollectOutcome::NetworkAccessRequired { asset, .. } => {
                    let alert = Alert::with_detail(AlertKind::UnableToLoadCloudAssetData, asset.as_str());
                    return self.pause(inner, batch, alert);
                }
                CollectOutcome::Failed { asset, error, .. } => {
                    let alert = Alert::with_detail(AlertKind::ResourceLoadError, format!("{asset}: {error}"));
                    return self.pause(inner, batch, alert);
                }
                CollectOutcome::Cancelled => return self.cancelled(inner),
            };

            self.set_state(EngineState::BatchCommitting);
            let processed = match self.commit(&batch, &data, &inner.settings).await {
                Ok(processed) => processed,
                Err(alert) => {
                    tracing::error!(batch = index, alert = %alert, "Batch commit failed");
                    inner.queue.clear();
                    self.set_state(EngineState::Idle);
                    self.emit(EngineEvent::Alert(alert.clone()));
                    return RunOutcome::Failed(alert);
                }
            };
            drop(data);

            self.set_state(EngineState::BatchDone);
            if let Err(e) = self.ledger.record_processed(&processed).await {
                tracing::error!(batch = index, error = %e, "Failed to record processed assets");
            }
            inner.processed += processed.len();
            tracing::info!(batch = index, processed = processed.len(), "Batch committed");
            self.emit(EngineEvent::Progress { index, processed });
        }

        self.set_state(EngineState::Idle);
        let processed = inner.processed;
        if inner.settings.delete_original_live_photos {
            tracing::info!(processed, "Duplication complete");
            self.emit(EngineEvent::Completed { processed });
        } else {
            tracing::info!(processed, "Duplication complete, originals kept");
            self.emit(EngineEvent::Alert(Alert::new(
                AlertKind::DidFinishDuplicateWithoutDelete,
            )));
        }
        RunOutcome::Finished { processed }
    }

    fn pause(&self, inner: &mut EngineInner, batch: Vec<PhotoAsset>, alert: Alert) -> RunOutcome {
        tracing::warn!(alert = %alert, size = batch.len(), "Batch aborted, pausing");
        for asset in batch.into_iter().rev() {
            inner.queue.push_front(asset);
        }
        inner.paused = Some(alert.clone());
        self.set_state(EngineState::Aborted);
        self.emit(EngineEvent::Alert(alert.clone()));
        RunOutcome::Paused(alert)
    }

    fn cancelled(&self, inner: &mut EngineInner) -> RunOutcome {
        tracing::info!(dropped = inner.queue.len(), "Duplication cancelled");
        inner.queue.clear();
        inner.paused = None;
        self.set_state(EngineState::Idle);
        RunOutcome::Cancelled
    }

    /// Build and apply the batch transaction. Returns the originals that
    /// were replaced.
    async fn commit(
        &self,
        batch: &[PhotoAsset],
        data: &CompletedCollection,
        settings: &Settings,
    ) -> Result<Vec<AssetId>, Alert> {
        let destination = if settings.move_to_album {
            self.destination_album().await
        } else {
            None
        };

        let mut changes = ChangeSet::new();
        let mut replaced = Vec::with_capacity(batch.len());
        for asset in batch {
            let Some(parts) = data.get(&asset.id) else {
                continue;
            };
            let Some(photo) = parts.photo.clone() else {
                tracing::warn!(asset = %asset.id, "No primary image, skipping");
                continue;
            };
            let albums = self
                .albums
                .albums_containing(&asset.id)
                .await
                .map_err(|e| Alert::with_detail(AlertKind::AssetCreationError, e.to_string()))?;

            let placeholder = changes.create_asset(AssetCreationRequest {
                source: asset.id.clone(),
                created: asset.created,
                photo,
                full_size_photo: parts.full_size_photo.clone(),
                adjustment_data: parts.adjustment_data.clone(),
            });
            for album in &albums {
                changes.add_assets(&[placeholder], album);
            }
            if let Some(destination) = &destination {
                changes.add_assets(&[placeholder], destination);
            }
            replaced.push(asset.id.clone());
        }

        if settings.delete_original_live_photos {
            changes.delete_assets(replaced.iter().cloned());
        }
        if changes.is_empty() {
            return Ok(replaced);
        }

        match self.store.perform_mutation(changes).await {
            Ok(receipt) => {
                tracing::debug!(
                    created = receipt.created.len(),
                    deleted = receipt.deleted.len(),
                    "Library transaction applied"
                );
                Ok(replaced)
            }
            Err(e) => {
                let detail = e.source.to_string();
                let kind = match e.phase {
                    MutationPhase::Creation => AlertKind::AssetCreationError,
                    MutationPhase::Deletion => AlertKind::AssetDeletionError {
                        user_cancelled: e.source.is_user_cancelled(),
                    },
                };
                Err(Alert::with_detail(kind, detail))
            }
        }
    }

    async fn destination_album(&self) -> Option<AlbumHandle> {
        match self.albums.destination_album().await {
            Ok(album) => Some(album),
            Err(e) => {
                tracing::warn!(error = %e, "Destination album unavailable, copies stay in their original albums only");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FileLedger;
    use crate::library::{JournalEntry, MemoryLibrary, StoreError};
    use crate::types::{AlbumKind, ResourceKind};
    use bytes::Bytes;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    struct Harness {
        lib: Arc<MemoryLibrary>,
        ledger: Arc<FileLedger>,
        engine: DuplicationEngine,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        _dir: tempfile::TempDir,
    }

    async fn harness(block_size: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let lib = Arc::new(MemoryLibrary::with_chunk_size(1024));
        let ledger = Arc::new(FileLedger::open(&dir.path().join("images")).await);
        let config = EngineConfig {
            block_size,
            concurrent_fetches: 4,
            retry: RetryConfig {
                max_retries: 1,
                base_delay: StdDuration::ZERO,
                max_delay: StdDuration::ZERO,
            },
            ..EngineConfig::default()
        };
        let (engine, events) = DuplicationEngine::new(lib.clone(), ledger.clone(), config);
        Harness {
            lib,
            ledger,
            engine,
            events,
            _dir: dir,
        }
    }

    fn photo_bytes(n: usize) -> Bytes {
        Bytes::from((0..5000).map(|i| ((i + n) % 251) as u8).collect::<Vec<u8>>())
    }

    fn add_live(lib: &MemoryLibrary, n: usize, cloud_only: bool) -> PhotoAsset {
        let created = Utc.timestamp_opt(1_600_000_000, 0).unwrap() + Duration::minutes(n as i64);
        let asset = PhotoAsset::new(format!("IMG_{n:03}"), created, false);
        lib.insert_asset(
            asset.clone(),
            true,
            vec![
                (ResourceKind::Photo, photo_bytes(n), cloud_only),
                (ResourceKind::PairedVideo, Bytes::from(vec![9u8; 300]), cloud_only),
            ],
        );
        asset
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn all_settings(delete: bool, album: bool) -> Settings {
        Settings {
            include_icloud_images: false,
            delete_original_live_photos: delete,
            move_to_album: album,
        }
    }

    #[tokio::test]
    async fn test_batches_are_bounded_and_sequential() {
        let mut h = harness(25).await;
        let assets: Vec<PhotoAsset> = (0..57).map(|n| add_live(&h.lib, n, false)).collect();
        let batch_of: HashMap<AssetId, usize> = assets
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i / 25))
            .collect();
        h.engine.set_settings(all_settings(true, false)).await;
        h.engine.set_assets(assets.clone()).await;

        let outcome = h.engine.run().await;
        assert_eq!(outcome, RunOutcome::Finished { processed: 57 });

        let sizes: Vec<usize> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::BatchStarted { size, .. } => Some(size),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![25, 25, 7]);

        // Every request of batch k happens after the commit of batch k-1.
        let mut commits = 0;
        let mut mutation_sizes = Vec::new();
        for entry in h.lib.journal() {
            match entry {
                JournalEntry::Request { asset, .. } => assert_eq!(batch_of[&asset], commits),
                JournalEntry::Mutation { sources, .. } => {
                    mutation_sizes.push(sources.len());
                    commits += 1;
                }
                JournalEntry::AlbumCreated(_) => {}
            }
        }
        assert_eq!(mutation_sizes, vec![25, 25, 7]);
        assert_eq!(h.ledger.load_all().len(), 57);
        assert_eq!(h.engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_copies_carry_complete_data_and_albums() {
        let mut h = harness(25).await;
        let a = add_live(&h.lib, 1, false);
        let trip = h.lib.add_album("Trip", AlbumKind::User, true);
        let favs = h.lib.add_album("Favorites", AlbumKind::Smart, true);
        h.lib.add_to_album(&trip, &a.id);
        h.lib.add_to_album(&favs, &a.id);
        h.engine.set_settings(all_settings(true, true)).await;
        h.engine.set_assets(vec![a.clone()]).await;

        assert_eq!(h.engine.run().await, RunOutcome::Finished { processed: 1 });

        assert!(!h.lib.contains(&a.id));
        let copies = h.lib.asset_ids();
        assert_eq!(copies.len(), 1);
        let copy = &copies[0];
        assert_eq!(h.lib.is_live(copy), Some(false));
        assert_eq!(h.lib.asset(copy).unwrap().created, a.created);
        assert_eq!(h.lib.resources(copy)[&ResourceKind::Photo], photo_bytes(1));
        assert!(h.lib.album_members(&trip).contains(copy));
        assert!(h.lib.album_members(&favs).contains(copy));
        let destination = h.lib.albums_titled(DEFAULT_DESTINATION_ALBUM);
        assert_eq!(destination.len(), 1);
        assert!(h.lib.album_members(&destination[0]).contains(copy));

        let events = drain(&mut h.events);
        assert!(events.contains(&EngineEvent::Progress {
            index: 1,
            processed: vec![a.id.clone()],
        }));
        assert_eq!(events.last(), Some(&EngineEvent::Completed { processed: 1 }));
    }

    #[tokio::test]
    async fn test_cloud_gate_pauses_then_resumes() {
        let mut h = harness(25).await;
        let local = add_live(&h.lib, 1, false);
        let cloud = add_live(&h.lib, 2, true);
        h.engine.set_settings(all_settings(true, false)).await;
        h.engine.set_assets(vec![local.clone(), cloud.clone()]).await;

        let outcome = h.engine.run().await;
        let alert = match outcome {
            RunOutcome::Paused(alert) => alert,
            other => panic!("expected pause, got {other:?}"),
        };
        assert_eq!(alert.kind, AlertKind::UnableToLoadCloudAssetData);
        assert_eq!(h.engine.state(), EngineState::Aborted);
        assert_eq!(h.engine.pending().await, 2);
        assert_eq!(h.lib.mutation_count(), 0);
        assert!(h.ledger.is_empty());
        // A plain run does not bypass the pause.
        assert!(matches!(h.engine.run().await, RunOutcome::Paused(_)));

        assert_eq!(h.engine.resume(true).await, RunOutcome::Finished { processed: 2 });
        assert!(h.engine.settings().await.include_icloud_images);
        assert!(!h.lib.contains(&local.id));
        assert!(!h.lib.contains(&cloud.id));
        assert_eq!(h.ledger.load_all().len(), 2);
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, EngineEvent::Alert(a) if a.kind == AlertKind::UnableToLoadCloudAssetData)));
    }

    #[tokio::test]
    async fn test_keep_originals_finishes_with_alert() {
        let mut h = harness(25).await;
        let a = add_live(&h.lib, 1, false);
        h.engine.set_settings(all_settings(false, false)).await;
        h.engine.set_assets(vec![a.clone()]).await;

        assert_eq!(h.engine.run().await, RunOutcome::Finished { processed: 1 });
        assert!(h.lib.contains(&a.id));
        assert_eq!(h.lib.asset_ids().len(), 2);
        assert!(h.ledger.contains(&a.id));

        let events = drain(&mut h.events);
        assert!(!events.iter().any(|e| matches!(e, EngineEvent::Completed { .. })));
        assert_eq!(
            events.last(),
            Some(&EngineEvent::Alert(Alert::new(AlertKind::DidFinishDuplicateWithoutDelete)))
        );
    }

    #[tokio::test]
    async fn test_creation_failure_leaves_ledger_unchanged() {
        let mut h = harness(25).await;
        let a = add_live(&h.lib, 1, false);
        let b = add_live(&h.lib, 2, false);
        h.lib.fail_next_mutation(MutationPhase::Creation, StoreError::Transient("disk full".into()));
        h.engine.set_settings(all_settings(true, false)).await;
        h.engine.set_assets(vec![a.clone(), b]).await;

        let alert = match h.engine.run().await {
            RunOutcome::Failed(alert) => alert,
            other => panic!("expected failure, got {other:?}"),
        };
        assert_eq!(alert.kind, AlertKind::AssetCreationError);
        assert!(alert.detail.unwrap().contains("disk full"));
        assert!(h.ledger.is_empty());
        assert!(h.lib.contains(&a.id));
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.engine.pending().await, 0);
        assert!(!drain(&mut h.events).iter().any(|e| matches!(e, EngineEvent::Progress { .. })));
    }

    #[tokio::test]
    async fn test_user_cancelled_deletion() {
        let h = harness(25).await;
        let a = add_live(&h.lib, 1, false);
        h.lib.fail_next_mutation(MutationPhase::Deletion, StoreError::UserCancelled);
        h.engine.set_settings(all_settings(true, false)).await;
        h.engine.set_assets(vec![a]).await;

        match h.engine.run().await {
            RunOutcome::Failed(alert) => assert_eq!(
                alert.kind,
                AlertKind::AssetDeletionError {
                    user_cancelled: true
                }
            ),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_unloadable_part_pauses_and_can_be_abandoned() {
        let h = harness(2).await;
        let a = add_live(&h.lib, 1, false);
        let b = add_live(&h.lib, 2, false);
        let c = add_live(&h.lib, 3, false);
        h.lib.fail_part(&b.id, ResourceKind::Photo, 5, true);
        h.engine.set_settings(all_settings(true, false)).await;
        h.engine.set_assets(vec![a, b.clone(), c]).await;

        match h.engine.run().await {
            RunOutcome::Paused(alert) => {
                assert_eq!(alert.kind, AlertKind::ResourceLoadError);
                assert!(alert.detail.unwrap().starts_with(b.id.as_str()));
            }
            other => panic!("expected pause, got {other:?}"),
        }
        assert_eq!(h.lib.mutation_count(), 0);
        assert_eq!(h.engine.pending().await, 3);

        assert_eq!(h.engine.abandon().await, 3);
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.engine.resume(false).await, RunOutcome::Idle);
        assert_eq!(h.engine.run().await, RunOutcome::Idle);
        assert_eq!(h.lib.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_part_failure_recovers() {
        let h = harness(25).await;
        let a = add_live(&h.lib, 1, false);
        h.lib.fail_part(&a.id, ResourceKind::Photo, 1, true);
        h.engine.set_settings(all_settings(true, false)).await;
        h.engine.set_assets(vec![a.clone()]).await;

        assert_eq!(h.engine.run().await, RunOutcome::Finished { processed: 1 });
        let copy = h.lib.asset_ids().pop().unwrap();
        assert_eq!(h.lib.resources(&copy)[&ResourceKind::Photo], photo_bytes(1));
    }

    #[tokio::test]
    async fn test_cancel_discards_run() {
        let h = harness(25).await;
        let a = add_live(&h.lib, 1, false);
        h.engine.set_assets(vec![a.clone()]).await;
        h.engine.cancel();

        assert_eq!(h.engine.run().await, RunOutcome::Cancelled);
        assert_eq!(h.lib.mutation_count(), 0);
        assert!(h.lib.contains(&a.id));
        assert_eq!(h.engine.pending().await, 0);
        // The queue is gone, so running again has nothing to cancel.
        assert_eq!(h.engine.run().await, RunOutcome::Idle);

        // A new selection gets a fresh token.
        h.engine.set_assets(vec![a]).await;
        assert_eq!(h.engine.run().await, RunOutcome::Finished { processed: 1 });
    }

    #[tokio::test]
    async fn test_empty_queue_and_resume_without_pause_are_idle() {
        let mut h = harness(25).await;
        assert_eq!(h.engine.run().await, RunOutcome::Idle);
        assert_eq!(h.engine.resume(true).await, RunOutcome::Idle);
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(drain(&mut h.events).is_empty());
        // Not paused, so the cloud flag was not taken over.
        assert!(!h.engine.settings().await.include_icloud_images);
    }
}
