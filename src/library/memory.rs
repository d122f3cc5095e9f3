//! In-process photo library.
//!
//! Holds assets, resource bytes and albums in memory, and records every
//! part request and mutation in a journal so callers can check ordering.
//! Faults can be injected per part (transient or permanent failures) and per
//! mutation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;

use super::error::{MutationError, MutationPhase, StoreError};
use super::{ChangeSet, ChunkStream, MutationReceipt, PhotoStore};
use crate::types::{
    AlbumHandle, AlbumKind, AssetId, CandidateFilter, LibraryChange, PhotoAsset, ResourceKind,
    ResourcePart,
};

const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// One recorded interaction with the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Request {
        asset: AssetId,
        kind: ResourceKind,
        allow_network: bool,
    },
    Mutation {
        sources: Vec<AssetId>,
        deleted: Vec<AssetId>,
    },
    AlbumCreated(String),
}

#[derive(Debug, Clone)]
struct StoredPart {
    kind: ResourceKind,
    data: Bytes,
    cloud_only: bool,
}

#[derive(Debug, Clone)]
struct StoredAsset {
    asset: PhotoAsset,
    live: bool,
    parts: Vec<StoredPart>,
}

#[derive(Debug, Clone)]
struct StoredAlbum {
    handle: AlbumHandle,
    kind: AlbumKind,
    top_level: bool,
    members: BTreeSet<AssetId>,
}

#[derive(Debug, Clone, Copy)]
struct PartFault {
    remaining: u32,
    retryable: bool,
}

#[derive(Default)]
struct State {
    assets: BTreeMap<AssetId, StoredAsset>,
    albums: Vec<StoredAlbum>,
    faults: HashMap<(AssetId, ResourceKind), PartFault>,
    mutation_fault: Option<MutationError>,
    journal: Vec<JournalEntry>,
    next_id: u64,
}

pub struct MemoryLibrary {
    state: Mutex<State>,
    chunk_size: usize,
    changes: broadcast::Sender<LibraryChange>,
}

impl std::fmt::Debug for MemoryLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLibrary")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State::default()),
            chunk_size: chunk_size.max(1),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an asset. Each part is `(kind, bytes, cloud_only)`.
    pub fn insert_asset(
        &self,
        asset: PhotoAsset,
        live: bool,
        parts: Vec<(ResourceKind, Bytes, bool)>,
    ) {
        let id = asset.id.clone();
        let parts = parts
            .into_iter()
            .map(|(kind, data, cloud_only)| StoredPart {
                kind,
                data,
                cloud_only,
            })
            .collect();
        self.lock()
            .assets
            .insert(id.clone(), StoredAsset { asset, live, parts });

        let mut change = LibraryChange::default();
        change.inserted.insert(id);
        let _ = self.changes.send(change);
    }

    pub fn add_album(&self, title: &str, kind: AlbumKind, top_level: bool) -> AlbumHandle {
        let mut state = self.lock();
        state.next_id += 1;
        let handle = AlbumHandle::new(format!("album-{}", state.next_id), title);
        state.albums.push(StoredAlbum {
            handle: handle.clone(),
            kind,
            top_level,
            members: BTreeSet::new(),
        });
        handle
    }

    pub fn add_to_album(&self, album: &AlbumHandle, asset: &AssetId) {
        let mut state = self.lock();
        if let Some(stored) = state.albums.iter_mut().find(|a| a.handle == *album) {
            stored.members.insert(asset.clone());
        }
    }

    /// Make the next `times` requests for a part fail.
    pub fn fail_part(&self, asset: &AssetId, kind: ResourceKind, times: u32, retryable: bool) {
        self.lock().faults.insert(
            (asset.clone(), kind),
            PartFault {
                remaining: times,
                retryable,
            },
        );
    }

    /// Make the next mutation fail in `phase` with `source`.
    pub fn fail_next_mutation(&self, phase: MutationPhase, source: StoreError) {
        self.lock().mutation_fault = Some(MutationError { phase, source });
    }

    /// Emit a change notification without touching the library.
    pub fn notify(&self, change: LibraryChange) {
        let _ = self.changes.send(change);
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.lock().assets.contains_key(id)
    }

    pub fn asset_ids(&self) -> Vec<AssetId> {
        self.lock().assets.keys().cloned().collect()
    }

    pub fn asset(&self, id: &AssetId) -> Option<PhotoAsset> {
        self.lock().assets.get(id).map(|s| s.asset.clone())
    }

    pub fn is_live(&self, id: &AssetId) -> Option<bool> {
        self.lock().assets.get(id).map(|s| s.live)
    }

    /// Resource bytes of an asset by kind.
    pub fn resources(&self, id: &AssetId) -> BTreeMap<ResourceKind, Bytes> {
        self.lock()
            .assets
            .get(id)
            .map(|s| s.parts.iter().map(|p| (p.kind, p.data.clone())).collect())
            .unwrap_or_default()
    }

    pub fn album_members(&self, album: &AlbumHandle) -> BTreeSet<AssetId> {
        self.lock()
            .albums
            .iter()
            .find(|a| a.handle == *album)
            .map(|a| a.members.clone())
            .unwrap_or_default()
    }

    pub fn albums_titled(&self, title: &str) -> Vec<AlbumHandle> {
        self.lock()
            .albums
            .iter()
            .filter(|a| a.handle.title == title)
            .map(|a| a.handle.clone())
            .collect()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|e| matches!(e, JournalEntry::Mutation { .. }))
            .count()
    }
}

#[async_trait]
impl PhotoStore for MemoryLibrary {
    async fn fetch_candidates(&self, filter: CandidateFilter) -> Result<Vec<PhotoAsset>, StoreError> {
        let state = self.lock();
        let mut assets: Vec<PhotoAsset> = state
            .assets
            .values()
            .filter(|s| filter == CandidateFilter::All || s.live)
            .map(|s| s.asset.clone())
            .collect();
        assets.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(assets)
    }

    async fn resource_parts(&self, asset: &AssetId) -> Result<Vec<ResourcePart>, StoreError> {
        let state = self.lock();
        let stored = state
            .assets
            .get(asset)
            .ok_or_else(|| StoreError::AssetNotFound(asset.clone()))?;
        Ok(stored
            .parts
            .iter()
            .map(|p| ResourcePart {
                asset_id: asset.clone(),
                kind: p.kind,
                size: p.data.len() as u64,
            })
            .collect())
    }

    fn request_part_data(&self, part: &ResourcePart, allow_network: bool) -> ChunkStream {
        let mut state = self.lock();
        state.journal.push(JournalEntry::Request {
            asset: part.asset_id.clone(),
            kind: part.kind,
            allow_network,
        });

        if let Some(fault) = state.faults.get_mut(&(part.asset_id.clone(), part.kind)) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                let err = if fault.retryable {
                    StoreError::Transient(format!("{} of {} interrupted", part.kind, part.asset_id))
                } else {
                    StoreError::ResourceUnavailable {
                        asset: part.asset_id.clone(),
                        kind: part.kind,
                        reason: "injected failure".to_string(),
                    }
                };
                return stream::once(async move { Err(err) }).boxed();
            }
        }

        let stored = state
            .assets
            .get(&part.asset_id)
            .and_then(|a| a.parts.iter().find(|p| p.kind == part.kind));
        let stored = match stored {
            Some(p) => p,
            None => {
                let err = StoreError::AssetNotFound(part.asset_id.clone());
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        if stored.cloud_only && !allow_network {
            let err = StoreError::NetworkAccessRequired {
                asset: part.asset_id.clone(),
                kind: part.kind,
            };
            return stream::once(async move { Err(err) }).boxed();
        }

        let data = stored.data.clone();
        let chunks: Vec<Result<Bytes, StoreError>> = data
            .chunks(self.chunk_size)
            .map(|c| Ok(data.slice_ref(c)))
            .collect();
        stream::iter(chunks)
            .then(|chunk| async move {
                tokio::task::yield_now().await;
                chunk
            })
            .boxed()
    }

    async fn albums_containing(
        &self,
        asset: &AssetId,
        kind: AlbumKind,
    ) -> Result<Vec<AlbumHandle>, StoreError> {
        let state = self.lock();
        Ok(state
            .albums
            .iter()
            .filter(|a| a.kind == kind && a.members.contains(asset))
            .map(|a| a.handle.clone())
            .collect())
    }

    async fn find_top_level_album(&self, title: &str) -> Result<Option<AlbumHandle>, StoreError> {
        let state = self.lock();
        Ok(state
            .albums
            .iter()
            .find(|a| a.kind == AlbumKind::User && a.top_level && a.handle.title == title)
            .map(|a| a.handle.clone()))
    }

    async fn create_album(&self, title: &str) -> Result<AlbumHandle, StoreError> {
        let handle = self.add_album(title, AlbumKind::User, true);
        self.lock()
            .journal
            .push(JournalEntry::AlbumCreated(title.to_string()));
        Ok(handle)
    }

    async fn perform_mutation(&self, changes: ChangeSet) -> Result<MutationReceipt, MutationError> {
        let mut state = self.lock();

        if let Some(fault) = state.mutation_fault.take() {
            return Err(fault);
        }

        for creation in changes.creations() {
            for album in &creation.albums {
                if !state.albums.iter().any(|a| a.handle == *album) {
                    return Err(MutationError::creation(StoreError::AlbumNotFound(
                        album.id.clone(),
                    )));
                }
            }
        }
        for id in changes.deletions() {
            if !state.assets.contains_key(id) {
                return Err(MutationError::deletion(StoreError::AssetNotFound(id.clone())));
            }
        }

        let mut receipt = MutationReceipt::default();
        let mut change = LibraryChange::default();

        for creation in changes.creations() {
            state.next_id += 1;
            let id = AssetId::new(format!("copy-{}", state.next_id));
            let request = &creation.request;

            let mut parts = vec![StoredPart {
                kind: ResourceKind::Photo,
                data: request.photo.clone(),
                cloud_only: false,
            }];
            if let Some(full) = &request.full_size_photo {
                parts.push(StoredPart {
                    kind: ResourceKind::FullSizePhoto,
                    data: full.clone(),
                    cloud_only: false,
                });
            }
            if let Some(adjustment) = &request.adjustment_data {
                parts.push(StoredPart {
                    kind: ResourceKind::AdjustmentData,
                    data: adjustment.clone(),
                    cloud_only: false,
                });
            }

            let asset = PhotoAsset::new(
                id.clone(),
                request.created,
                request.adjustment_data.is_some(),
            );
            state.assets.insert(
                id.clone(),
                StoredAsset {
                    asset,
                    live: false,
                    parts,
                },
            );
            for album in &creation.albums {
                if let Some(stored) = state.albums.iter_mut().find(|a| a.handle == *album) {
                    stored.members.insert(id.clone());
                }
            }
            change.inserted.insert(id.clone());
            receipt.created.push(id);
        }

        for id in changes.deletions() {
            state.assets.remove(id);
            for album in state.albums.iter_mut() {
                album.members.remove(id);
            }
            change.removed.insert(id.clone());
            receipt.deleted.push(id.clone());
        }

        state.journal.push(JournalEntry::Mutation {
            sources: changes
                .creations()
                .iter()
                .map(|c| c.request.source.clone())
                .collect(),
            deleted: receipt.deleted.clone(),
        });
        drop(state);

        let _ = self.changes.send(change);
        Ok(receipt)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<LibraryChange> {
        self.changes.subscribe()
    }
}
