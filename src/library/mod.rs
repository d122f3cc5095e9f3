//! Photo store abstraction, covering everything the cleaner needs from a photo
//! library: candidate listing, resource streaming, album membership and
//! all-or-nothing mutations. Two implementations ship with the crate: an
//! on-disk library directory and an in-process library used by tests.

mod directory;
pub mod error;
mod memory;

pub use directory::{DirectoryLibrary, LibraryLock};
pub use error::{MutationError, MutationPhase, StoreError};
pub use memory::{JournalEntry, MemoryLibrary};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;

use crate::types::{AlbumHandle, AlbumKind, AssetId, CandidateFilter, LibraryChange, PhotoAsset, ResourcePart};

/// Incremental byte chunks of one resource part. The stream ends after the
/// last chunk; an `Err` item terminates the request.
pub type ChunkStream = BoxStream<'static, Result<Bytes, StoreError>>;

/// Photo library collaborator.
///
/// Object-safe so it can be shared as `Arc<dyn PhotoStore>` across the
/// collector's fetch tasks.
#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// List assets matching `filter`, ordered by creation date ascending.
    async fn fetch_candidates(&self, filter: CandidateFilter) -> Result<Vec<PhotoAsset>, StoreError>;

    /// All resource parts of an asset, video kinds included.
    async fn resource_parts(&self, asset: &AssetId) -> Result<Vec<ResourcePart>, StoreError>;

    /// Start streaming one resource part. Cloud-only parts fail with
    /// [`StoreError::NetworkAccessRequired`] unless `allow_network` is set.
    fn request_part_data(&self, part: &ResourcePart, allow_network: bool) -> ChunkStream;

    async fn albums_containing(
        &self,
        asset: &AssetId,
        kind: AlbumKind,
    ) -> Result<Vec<AlbumHandle>, StoreError>;

    /// Look up a top-level user album by exact title.
    async fn find_top_level_album(&self, title: &str) -> Result<Option<AlbumHandle>, StoreError>;

    async fn create_album(&self, title: &str) -> Result<AlbumHandle, StoreError>;

    /// Apply a change set atomically: either every creation, album insertion
    /// and deletion is applied, or none is.
    async fn perform_mutation(&self, changes: ChangeSet) -> Result<MutationReceipt, MutationError>;

    /// Subscribe to library change notifications.
    fn subscribe_changes(&self) -> broadcast::Receiver<LibraryChange>;
}

/// Data for one replacement asset.
#[derive(Debug, Clone)]
pub struct AssetCreationRequest {
    /// The original this asset replaces.
    pub source: AssetId,
    pub created: DateTime<Utc>,
    pub photo: Bytes,
    pub full_size_photo: Option<Bytes>,
    pub adjustment_data: Option<Bytes>,
}

/// Reference to an asset created earlier in the same change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder(usize);

impl Placeholder {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A pending creation together with the albums it will be added to.
#[derive(Debug, Clone)]
pub struct PendingCreation {
    pub request: AssetCreationRequest,
    pub albums: Vec<AlbumHandle>,
}

/// Everything one library transaction will do.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    creations: Vec<PendingCreation>,
    deletions: Vec<AssetId>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_asset(&mut self, request: AssetCreationRequest) -> Placeholder {
        self.creations.push(PendingCreation {
            request,
            albums: Vec::new(),
        });
        Placeholder(self.creations.len() - 1)
    }

    pub fn add_assets(&mut self, placeholders: &[Placeholder], album: &AlbumHandle) {
        for placeholder in placeholders {
            if let Some(creation) = self.creations.get_mut(placeholder.0) {
                if !creation.albums.contains(album) {
                    creation.albums.push(album.clone());
                }
            }
        }
    }

    pub fn delete_assets<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = AssetId>,
    {
        for id in ids {
            if !self.deletions.contains(&id) {
                self.deletions.push(id);
            }
        }
    }

    pub fn creations(&self) -> &[PendingCreation] {
        &self.creations
    }

    pub fn deletions(&self) -> &[AssetId] {
        &self.deletions
    }

    pub fn is_empty(&self) -> bool {
        self.creations.is_empty() && self.deletions.is_empty()
    }
}

/// Identifiers assigned by the store, one per creation, in change-set order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationReceipt {
    pub created: Vec<AssetId>,
    pub deleted: Vec<AssetId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: &str) -> AssetCreationRequest {
        AssetCreationRequest {
            source: AssetId::from(source),
            created: Utc::now(),
            photo: Bytes::from_static(b"jpeg"),
            full_size_photo: None,
            adjustment_data: None,
        }
    }

    #[test]
    fn test_change_set_album_links() {
        let mut changes = ChangeSet::new();
        let a = changes.create_asset(request("A"));
        let b = changes.create_asset(request("B"));
        let album = AlbumHandle::new("al1", "Holidays");
        changes.add_assets(&[a], &album);
        changes.add_assets(&[a, b], &album);

        assert_eq!(changes.creations()[0].albums, vec![album.clone()]);
        assert_eq!(changes.creations()[1].albums, vec![album]);
    }

    #[test]
    fn test_change_set_deletions_deduplicated() {
        let mut changes = ChangeSet::new();
        changes.delete_assets([AssetId::from("A"), AssetId::from("A"), AssetId::from("B")]);
        assert_eq!(changes.deletions().len(), 2);
        assert!(!changes.is_empty());
    }
}
