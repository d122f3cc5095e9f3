//! Resource collector: fetches the still-image parts of a batch.
//!
//! Part requests run concurrently in a background task. Every chunk,
//! restart, completion and failure is sent over a channel to the collecting
//! task, which is the only writer of the [`CollectionState`]. Once it stops
//! listening (batch complete, aborted or cancelled) later messages from
//! sibling requests are dropped with the receiver.

pub mod state;

pub use state::{CollectionState, CompletedAsset, CompletedCollection, PartData};

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::library::{PhotoStore, StoreError};
use crate::retry::{self, RetryConfig};
use crate::types::{AssetId, PhotoAsset, ResourceKind, ResourcePart};

const EVENT_BUFFER: usize = 64;

/// Per-run collection options.
#[derive(Debug, Clone, Copy)]
pub struct CollectorOptions {
    /// Permit fetching cloud-only parts over the network.
    pub allow_network: bool,
    /// Maximum part requests in flight.
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            allow_network: false,
            concurrency: 8,
            retry: RetryConfig::default(),
        }
    }
}

/// How a collection attempt ended.
#[derive(Debug)]
pub enum CollectOutcome {
    /// Every tracked part of every asset arrived.
    Complete(CompletedCollection),
    /// A part is cloud-only and network access was not permitted.
    NetworkAccessRequired {
        asset: AssetId,
        kind: ResourceKind,
        state: CollectionState,
    },
    /// A part failed for good (after retries, if the error was transient).
    Failed {
        asset: AssetId,
        kind: Option<ResourceKind>,
        error: StoreError,
        state: CollectionState,
    },
    /// The caller cancelled; received bytes were discarded.
    Cancelled,
}

#[derive(Debug)]
enum PartEvent {
    Chunk {
        asset: AssetId,
        kind: ResourceKind,
        bytes: Bytes,
    },
    Restarted {
        asset: AssetId,
        kind: ResourceKind,
    },
    Done {
        asset: AssetId,
        kind: ResourceKind,
    },
    Failed {
        asset: AssetId,
        kind: ResourceKind,
        error: StoreError,
    },
}

pub struct ResourceCollector {
    store: Arc<dyn PhotoStore>,
}

impl std::fmt::Debug for ResourceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCollector").finish_non_exhaustive()
    }
}

impl ResourceCollector {
    pub fn new(store: Arc<dyn PhotoStore>) -> Self {
        Self { store }
    }

    /// Build an empty collection state for `assets` and list the parts to
    /// request. Video parts are not tracked.
    pub async fn prepare(
        &self,
        assets: &[PhotoAsset],
    ) -> Result<(CollectionState, Vec<ResourcePart>), (AssetId, StoreError)> {
        let mut state = CollectionState::new();
        let mut requests = Vec::new();
        for asset in assets {
            state.track_asset(&asset.id);
            let parts = self
                .store
                .resource_parts(&asset.id)
                .await
                .map_err(|e| (asset.id.clone(), e))?;
            for part in parts {
                if !part.kind.is_still_component() {
                    tracing::trace!(asset = %asset.id, kind = %part.kind, "Skipping video part");
                    continue;
                }
                state.track_part(&asset.id, part.kind);
                requests.push(part);
            }
        }
        Ok((state, requests))
    }

    /// Collect the still-image parts of `assets`.
    pub async fn collect(
        &self,
        assets: &[PhotoAsset],
        options: &CollectorOptions,
        cancel: &CancellationToken,
    ) -> CollectOutcome {
        let (state, parts) = match self.prepare(assets).await {
            Ok(prepared) => prepared,
            Err((asset, error)) => {
                tracing::error!(asset = %asset, error = %error, "Failed to list resources");
                return CollectOutcome::Failed {
                    asset,
                    kind: None,
                    error,
                    state: CollectionState::new(),
                };
            }
        };
        self.collect_parts(state, parts, options, cancel).await
    }

    /// Drive the requests for a prepared state to an outcome.
    pub async fn collect_parts(
        &self,
        mut state: CollectionState,
        parts: Vec<ResourcePart>,
        options: &CollectorOptions,
        cancel: &CancellationToken,
    ) -> CollectOutcome {
        if state.is_complete() {
            return finish(state);
        }

        tracing::debug!(
            assets = state.len(),
            parts = parts.len(),
            allow_network = options.allow_network,
            "Requesting resource data"
        );

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let fetch_token = cancel.child_token();
        let producer = tokio::spawn(fetch_all(
            Arc::clone(&self.store),
            parts,
            *options,
            tx,
            fetch_token.clone(),
        ));
        // Stops outstanding requests on every exit path below.
        let _stop = fetch_token.clone().drop_guard();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Collection cancelled, discarding received data");
                    state.clear();
                    producer.abort();
                    return CollectOutcome::Cancelled;
                }
                event = rx.recv() => event,
            };

            match event {
                Some(PartEvent::Chunk { asset, kind, bytes }) => {
                    state.append(&asset, kind, &bytes);
                }
                Some(PartEvent::Restarted { asset, kind }) => {
                    state.restart_part(&asset, kind);
                }
                Some(PartEvent::Done { asset, kind }) => {
                    tracing::debug!(asset = %asset, kind = %kind, "Received complete data");
                    state.mark_complete(&asset, kind);
                    if state.is_complete() {
                        return finish(state);
                    }
                }
                Some(PartEvent::Failed { asset, kind, error }) => {
                    fetch_token.cancel();
                    if error.is_network_access_required() && !options.allow_network {
                        tracing::warn!(
                            asset = %asset,
                            kind = %kind,
                            "Network access required but not permitted"
                        );
                        return CollectOutcome::NetworkAccessRequired { asset, kind, state };
                    }
                    tracing::error!(asset = %asset, kind = %kind, error = %error, "Resource request failed");
                    return CollectOutcome::Failed {
                        asset,
                        kind: Some(kind),
                        error,
                        state,
                    };
                }
                None => {
                    // Every request finished but some part never reported
                    // completion; only possible if the fetch task died.
                    let (asset, kind) = state
                        .incomplete_parts()
                        .into_iter()
                        .next()
                        .map(|(a, k)| (a, Some(k)))
                        .unwrap_or_else(|| (AssetId::new(""), None));
                    return CollectOutcome::Failed {
                        asset,
                        kind,
                        error: StoreError::Transient("resource requests ended early".to_string()),
                        state,
                    };
                }
            }
        }
    }
}

fn finish(state: CollectionState) -> CollectOutcome {
    match state.into_complete() {
        Ok(done) => {
            tracing::info!(assets = done.len(), "Batch data complete");
            CollectOutcome::Complete(done)
        }
        Err(state) => {
            // into_complete only refuses incomplete state, which callers
            // check beforehand.
            let (asset, kind) = state
                .incomplete_parts()
                .into_iter()
                .next()
                .map(|(a, k)| (a, Some(k)))
                .unwrap_or_else(|| (AssetId::new(""), None));
            CollectOutcome::Failed {
                asset,
                kind,
                error: StoreError::Transient("batch data incomplete".to_string()),
                state,
            }
        }
    }
}

async fn fetch_all(
    store: Arc<dyn PhotoStore>,
    parts: Vec<ResourcePart>,
    options: CollectorOptions,
    tx: mpsc::Sender<PartEvent>,
    token: CancellationToken,
) {
    stream::iter(parts)
        .for_each_concurrent(options.concurrency.max(1), |part| {
            fetch_part(
                Arc::clone(&store),
                part,
                options,
                tx.clone(),
                token.clone(),
            )
        })
        .await;
}

/// Stream one part into the channel, retrying transient failures.
async fn fetch_part(
    store: Arc<dyn PhotoStore>,
    part: ResourcePart,
    options: CollectorOptions,
    tx: mpsc::Sender<PartEvent>,
    token: CancellationToken,
) {
    if token.is_cancelled() {
        return;
    }

    let result = retry::retry_with_backoff(&options.retry, retry::classify, |attempt| {
        let store = Arc::clone(&store);
        let part = part.clone();
        let tx = tx.clone();
        let token = token.clone();
        async move {
            if attempt > 0
                && tx
                    .send(PartEvent::Restarted {
                        asset: part.asset_id.clone(),
                        kind: part.kind,
                    })
                    .await
                    .is_err()
            {
                return Ok(false);
            }

            let mut chunks = store.request_part_data(&part, options.allow_network);
            while let Some(chunk) = chunks.next().await {
                if token.is_cancelled() {
                    return Ok(false);
                }
                let event = PartEvent::Chunk {
                    asset: part.asset_id.clone(),
                    kind: part.kind,
                    bytes: chunk?,
                };
                if tx.send(event).await.is_err() {
                    return Ok(false);
                }
            }
            Ok::<bool, StoreError>(true)
        }
    })
    .await;

    let event = match result {
        Ok(true) => PartEvent::Done {
            asset: part.asset_id,
            kind: part.kind,
        },
        Ok(false) => return,
        Err(error) => PartEvent::Failed {
            asset: part.asset_id,
            kind: part.kind,
            error,
        },
    };
    // A closed channel means the batch was already decided.
    let _ = tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::MemoryLibrary;
    use chrono::Utc;

    fn add_live(lib: &MemoryLibrary, id: &str, cloud_only: bool, edited: bool) -> PhotoAsset {
        let asset = PhotoAsset::new(id, Utc::now(), edited);
        let mut parts = vec![
            (ResourceKind::Photo, Bytes::from(vec![1u8; 50_000]), cloud_only),
            (ResourceKind::PairedVideo, Bytes::from(vec![2u8; 10]), cloud_only),
        ];
        if edited {
            parts.push((ResourceKind::AdjustmentData, Bytes::from_static(b"<plist/>"), cloud_only));
            parts.push((ResourceKind::FullSizePhoto, Bytes::from(vec![3u8; 70_000]), cloud_only));
        }
        lib.insert_asset(asset.clone(), true, parts);
        asset
    }

    fn no_retry(allow_network: bool) -> CollectorOptions {
        CollectorOptions {
            allow_network,
            concurrency: 4,
            retry: RetryConfig::none(),
        }
    }

    #[tokio::test]
    async fn test_local_assets_complete_without_network() {
        let lib = Arc::new(MemoryLibrary::with_chunk_size(4096));
        let a = add_live(&lib, "A", false, false);
        let b = add_live(&lib, "B", false, true);
        let collector = ResourceCollector::new(lib.clone());

        let outcome = collector
            .collect(&[a.clone(), b.clone()], &no_retry(false), &CancellationToken::new())
            .await;

        let done = match outcome {
            CollectOutcome::Complete(done) => done,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(done.get(&a.id).unwrap().photo.as_ref().unwrap().len(), 50_000);
        let edited = done.get(&b.id).unwrap();
        assert_eq!(edited.full_size_photo.as_ref().unwrap().len(), 70_000);
        assert_eq!(edited.adjustment_data.as_deref(), Some(&b"<plist/>"[..]));

        // Video parts are never requested and nothing asked for the network.
        for entry in lib.journal() {
            if let crate::library::JournalEntry::Request { kind, allow_network, .. } = entry {
                assert!(kind.is_still_component());
                assert!(!allow_network);
            }
        }
    }

    #[tokio::test]
    async fn test_cloud_gate_then_success() {
        let lib = Arc::new(MemoryLibrary::new());
        let a = add_live(&lib, "CLOUD", true, false);
        let collector = ResourceCollector::new(lib.clone());

        let outcome = collector
            .collect(&[a.clone()], &no_retry(false), &CancellationToken::new())
            .await;
        match outcome {
            CollectOutcome::NetworkAccessRequired { asset, kind, state } => {
                assert_eq!(asset, a.id);
                assert_eq!(kind, ResourceKind::Photo);
                assert!(!state.is_asset_complete(&a.id));
            }
            other => panic!("expected network gate, got {other:?}"),
        }

        let outcome = collector
            .collect(&[a.clone()], &no_retry(true), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, CollectOutcome::Complete(_)));
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let lib = Arc::new(MemoryLibrary::with_chunk_size(1000));
        let a = add_live(&lib, "A", false, false);
        lib.fail_part(&a.id, ResourceKind::Photo, 2, true);
        let collector = ResourceCollector::new(lib.clone());
        let options = CollectorOptions {
            allow_network: false,
            concurrency: 2,
            retry: RetryConfig {
                max_retries: 2,
                base_delay: std::time::Duration::ZERO,
                max_delay: std::time::Duration::ZERO,
            },
        };

        let outcome = collector.collect(&[a.clone()], &options, &CancellationToken::new()).await;
        match outcome {
            CollectOutcome::Complete(done) => {
                assert_eq!(done.get(&a.id).unwrap().photo.as_ref().unwrap().len(), 50_000);
            }
            other => panic!("expected completion after retries, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_batch() {
        let lib = Arc::new(MemoryLibrary::new());
        let a = add_live(&lib, "A", false, false);
        let b = add_live(&lib, "B", false, false);
        lib.fail_part(&b.id, ResourceKind::Photo, 1, false);
        let collector = ResourceCollector::new(lib.clone());

        let outcome = collector
            .collect(&[a, b.clone()], &no_retry(false), &CancellationToken::new())
            .await;
        match outcome {
            CollectOutcome::Failed { asset, kind, state, .. } => {
                assert_eq!(asset, b.id);
                assert_eq!(kind, Some(ResourceKind::Photo));
                assert!(!state.is_complete());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_asset_fails_prepare() {
        let lib = Arc::new(MemoryLibrary::new());
        let collector = ResourceCollector::new(lib);
        let ghost = PhotoAsset::new("GHOST", Utc::now(), false);
        let outcome = collector
            .collect(&[ghost], &no_retry(false), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, CollectOutcome::Failed { kind: None, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let lib = Arc::new(MemoryLibrary::new());
        let a = add_live(&lib, "A", false, false);
        let collector = ResourceCollector::new(lib);
        let token = CancellationToken::new();
        token.cancel();
        let outcome = collector.collect(&[a], &no_retry(false), &token).await;
        assert!(matches!(outcome, CollectOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_asset_without_still_parts_completes_immediately() {
        let lib = Arc::new(MemoryLibrary::new());
        let asset = PhotoAsset::new("VIDEO_ONLY", Utc::now(), false);
        lib.insert_asset(
            asset.clone(),
            true,
            vec![(ResourceKind::PairedVideo, Bytes::from_static(b"mov"), false)],
        );
        let collector = ResourceCollector::new(lib.clone());
        let outcome = collector
            .collect(&[asset.clone()], &no_retry(false), &CancellationToken::new())
            .await;
        match outcome {
            CollectOutcome::Complete(done) => assert!(done.get(&asset.id).unwrap().photo.is_none()),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(lib.journal().is_empty());
    }
}
