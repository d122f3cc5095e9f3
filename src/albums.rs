use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::library::{PhotoStore, StoreError};
use crate::types::{AlbumHandle, AlbumKind, AssetId};

/// Title of the album replacement copies are collected in.
pub const DEFAULT_DESTINATION_ALBUM: &str = "Live Photo Cleaner";

/// Album membership lookups and the destination album.
pub struct AlbumResolver {
    store: Arc<dyn PhotoStore>,
    destination_title: String,
    destination: OnceCell<AlbumHandle>,
}

impl std::fmt::Debug for AlbumResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlbumResolver")
            .field("destination_title", &self.destination_title)
            .field("destination", &self.destination.get())
            .finish_non_exhaustive()
    }
}

impl AlbumResolver {
    pub fn new(store: Arc<dyn PhotoStore>, destination_title: impl Into<String>) -> Self {
        Self {
            store,
            destination_title: destination_title.into(),
            destination: OnceCell::new(),
        }
    }

    pub fn destination_title(&self) -> &str {
        &self.destination_title
    }

    /// Every user and smart album the asset belongs to.
    pub async fn albums_containing(&self, asset: &AssetId) -> Result<BTreeSet<AlbumHandle>, StoreError> {
        let mut albums: BTreeSet<AlbumHandle> = self
            .store
            .albums_containing(asset, AlbumKind::User)
            .await?
            .into_iter()
            .collect();
        albums.extend(self.store.albums_containing(asset, AlbumKind::Smart).await?);
        Ok(albums)
    }

    /// Find a top-level user album by exact title, creating it when absent.
    ///
    /// The lookup and the creation are separate store calls; another writer
    /// creating the same title in between yields a second album.
    pub async fn get_or_create_album(&self, title: &str) -> Result<AlbumHandle, StoreError> {
        if let Some(existing) = self.store.find_top_level_album(title).await? {
            tracing::debug!(album = %title, id = %existing.id, "Found existing album");
            return Ok(existing);
        }
        let created = self.store.create_album(title).await?;
        tracing::info!(album = %title, id = %created.id, "Created album");
        Ok(created)
    }

    /// The destination album, resolved at most once per resolver.
    pub async fn destination_album(&self) -> Result<AlbumHandle, StoreError> {
        self.destination
            .get_or_try_init(|| self.get_or_create_album(&self.destination_title))
            .await
            .cloned()
    }
}
