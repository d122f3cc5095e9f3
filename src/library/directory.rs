//! On-disk photo library.
//!
//! Layout:
//!
//! ```text
//! <root>/library.json          manifest: assets, resources, albums
//! <root>/media/<id>/<file>     locally available resource data
//! <root>/cloud/<id>/<file>     cloud-only resource data
//! <root>/.lock                 held while a cleaning run mutates the library
//! ```
//!
//! Mutations stage new media first, then swap the manifest with a
//! write-to-temp-and-rename so a failed transaction leaves the previous
//! manifest untouched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, RwLock};
use tokio_util::io::ReaderStream;

use super::error::{MutationError, StoreError};
use super::{ChangeSet, ChunkStream, MutationReceipt, PhotoStore};
use crate::types::{
    AlbumHandle, AlbumKind, AssetId, CandidateFilter, LibraryChange, PhotoAsset, ResourceKind,
    ResourcePart,
};

const MANIFEST_FILE: &str = "library.json";
const MEDIA_DIR: &str = "media";
const CLOUD_DIR: &str = "cloud";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    assets: Vec<ManifestAsset>,
    #[serde(default)]
    albums: Vec<ManifestAlbum>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestAsset {
    id: AssetId,
    created: DateTime<Utc>,
    #[serde(default)]
    live: bool,
    #[serde(default)]
    resources: Vec<ManifestResource>,
}

impl ManifestAsset {
    fn is_live(&self) -> bool {
        self.live || self.resources.iter().any(|r| r.kind.is_paired_video())
    }

    fn has_adjustments(&self) -> bool {
        self.resources
            .iter()
            .any(|r| r.kind == ResourceKind::AdjustmentData)
    }

    fn to_photo_asset(&self) -> PhotoAsset {
        PhotoAsset::new(self.id.clone(), self.created, self.has_adjustments())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestResource {
    kind: ResourceKind,
    file: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    cloud_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestAlbum {
    id: String,
    title: String,
    kind: AlbumKind,
    #[serde(default = "default_top_level")]
    top_level: bool,
    #[serde(default)]
    assets: Vec<AssetId>,
}

fn default_top_level() -> bool {
    true
}

impl ManifestAlbum {
    fn handle(&self) -> AlbumHandle {
        AlbumHandle::new(self.id.clone(), self.title.clone())
    }
}

/// Exclusive lock on a library directory. Released on drop.
#[derive(Debug)]
pub struct LibraryLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl LibraryLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct DirectoryLibrary {
    root: PathBuf,
    manifest: RwLock<Manifest>,
    changes: broadcast::Sender<LibraryChange>,
}

impl std::fmt::Debug for DirectoryLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryLibrary")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl DirectoryLibrary {
    /// Open an existing library directory.
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        let manifest_path = root.join(MANIFEST_FILE);
        let contents = match fs::read_to_string(&manifest_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ManifestMissing(manifest_path));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_json::from_str(&contents)?;
        validate_manifest(&manifest)?;
        tracing::debug!(
            root = %root.display(),
            assets = manifest.assets.len(),
            albums = manifest.albums.len(),
            "Opened library"
        );

        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            root: root.to_path_buf(),
            manifest: RwLock::new(manifest),
            changes,
        })
    }

    /// Create an empty library directory (no-op for the manifest if one exists).
    pub async fn create(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join(MEDIA_DIR)).await?;
        fs::create_dir_all(root.join(CLOUD_DIR)).await?;
        let manifest_path = root.join(MANIFEST_FILE);
        if !fs::try_exists(&manifest_path).await? {
            write_manifest(root, &Manifest::default()).await?;
        }
        Self::open(root).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take the library's exclusive lock, failing fast if another process
    /// holds it.
    pub async fn acquire_lock(&self) -> Result<LibraryLock, StoreError> {
        use fs4::fs_std::FileExt;

        let path = self.root.join(LOCK_FILE);
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&path)?;
            file.try_lock_exclusive()
                .map_err(|_| StoreError::Locked(root))?;
            Ok::<_, StoreError>(LibraryLock { _file: file, path })
        })
        .await?
    }

    fn resource_path(&self, asset: &AssetId, resource: &ManifestResource) -> PathBuf {
        let dir = if resource.cloud_only { CLOUD_DIR } else { MEDIA_DIR };
        self.root.join(dir).join(asset.as_str()).join(&resource.file)
    }

    async fn stage_creation(
        &self,
        new_id: &AssetId,
        source: Option<&ManifestAsset>,
        data: &[(ResourceKind, &[u8])],
    ) -> Result<Vec<ManifestResource>, StoreError> {
        let dir = self.root.join(MEDIA_DIR).join(new_id.as_str());
        fs::create_dir_all(&dir).await?;

        let mut resources = Vec::with_capacity(data.len());
        for (kind, bytes) in data {
            let file = source
                .and_then(|s| s.resources.iter().find(|r| r.kind == *kind))
                .map(|r| r.file.clone())
                .unwrap_or_else(|| kind.as_str().to_string());
            let mut out = fs::File::create(dir.join(&file)).await?;
            out.write_all(bytes).await?;
            out.flush().await?;
            resources.push(ManifestResource {
                kind: *kind,
                file,
                size: bytes.len() as u64,
                cloud_only: false,
            });
        }
        Ok(resources)
    }

    async fn discard_media(&self, ids: &[AssetId]) {
        for id in ids {
            if !is_safe_component(id.as_str()) {
                tracing::warn!(asset = ?id.as_str(), "Refusing to remove media for unsafe asset id");
                continue;
            }
            for dir in [MEDIA_DIR, CLOUD_DIR] {
                let path = self.root.join(dir).join(id.as_str());
                match fs::remove_dir_all(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to remove media directory"
                    ),
                }
            }
        }
    }
}

/// A single path component that stays inside its parent directory and
/// fits on one ledger line.
fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control)
}

/// Asset ids and resource file names become directory and file names under
/// `media/` and `cloud/`, and asset ids become ledger lines.
fn validate_manifest(manifest: &Manifest) -> Result<(), StoreError> {
    let mut seen = std::collections::HashSet::new();
    for asset in &manifest.assets {
        if !is_safe_component(asset.id.as_str()) {
            return Err(StoreError::InvalidManifest(format!(
                "asset id {:?} is not a valid identifier",
                asset.id.as_str()
            )));
        }
        if !seen.insert(&asset.id) {
            return Err(StoreError::InvalidManifest(format!(
                "duplicate asset id {:?}",
                asset.id.as_str()
            )));
        }
        for resource in &asset.resources {
            if !is_safe_component(&resource.file) {
                return Err(StoreError::InvalidManifest(format!(
                    "file name {:?} of asset {:?} is not a plain file name",
                    resource.file,
                    asset.id.as_str()
                )));
            }
        }
    }
    Ok(())
}

/// Write the manifest via temp file + rename.
async fn write_manifest(root: &Path, manifest: &Manifest) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(manifest)?;
    let tmp = root.join(format!("{MANIFEST_FILE}.tmp"));
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, root.join(MANIFEST_FILE)).await?;
    Ok(())
}

#[async_trait]
impl PhotoStore for DirectoryLibrary {
    async fn fetch_candidates(&self, filter: CandidateFilter) -> Result<Vec<PhotoAsset>, StoreError> {
        let manifest = self.manifest.read().await;
        let mut assets: Vec<PhotoAsset> = manifest
            .assets
            .iter()
            .filter(|a| filter == CandidateFilter::All || a.is_live())
            .map(ManifestAsset::to_photo_asset)
            .collect();
        assets.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(assets)
    }

    async fn resource_parts(&self, asset: &AssetId) -> Result<Vec<ResourcePart>, StoreError> {
        let manifest = self.manifest.read().await;
        let entry = manifest
            .assets
            .iter()
            .find(|a| a.id == *asset)
            .ok_or_else(|| StoreError::AssetNotFound(asset.clone()))?;
        Ok(entry
            .resources
            .iter()
            .map(|r| ResourcePart {
                asset_id: asset.clone(),
                kind: r.kind,
                size: r.size,
            })
            .collect())
    }

    fn request_part_data(&self, part: &ResourcePart, allow_network: bool) -> ChunkStream {
        // Part requests are never issued while this library is mid-mutation;
        // a contended lock is reported as transient so the caller retries.
        let resource = match self.manifest.try_read() {
            Ok(manifest) => manifest
                .assets
                .iter()
                .find(|a| a.id == part.asset_id)
                .and_then(|a| a.resources.iter().find(|r| r.kind == part.kind))
                .cloned(),
            Err(_) => {
                let err = StoreError::Transient("library manifest is being updated".to_string());
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        let resource = match resource {
            Some(r) => r,
            None => {
                let err = StoreError::AssetNotFound(part.asset_id.clone());
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        if resource.cloud_only && !allow_network {
            let err = StoreError::NetworkAccessRequired {
                asset: part.asset_id.clone(),
                kind: part.kind,
            };
            return stream::once(async move { Err(err) }).boxed();
        }

        let path = self.resource_path(&part.asset_id, &resource);
        tracing::trace!(path = %path.display(), "Streaming resource");
        stream::once(async move { fs::File::open(path).await })
            .map_ok(ReaderStream::new)
            .try_flatten()
            .map_err(StoreError::from)
            .boxed()
    }

    async fn albums_containing(
        &self,
        asset: &AssetId,
        kind: AlbumKind,
    ) -> Result<Vec<AlbumHandle>, StoreError> {
        let manifest = self.manifest.read().await;
        Ok(manifest
            .albums
            .iter()
            .filter(|a| a.kind == kind && a.assets.contains(asset))
            .map(ManifestAlbum::handle)
            .collect())
    }

    async fn find_top_level_album(&self, title: &str) -> Result<Option<AlbumHandle>, StoreError> {
        let manifest = self.manifest.read().await;
        Ok(manifest
            .albums
            .iter()
            .find(|a| a.kind == AlbumKind::User && a.top_level && a.title == title)
            .map(ManifestAlbum::handle))
    }

    async fn create_album(&self, title: &str) -> Result<AlbumHandle, StoreError> {
        let mut manifest = self.manifest.write().await;
        let album = ManifestAlbum {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            kind: AlbumKind::User,
            top_level: true,
            assets: Vec::new(),
        };
        let handle = album.handle();

        let mut updated = manifest.clone();
        updated.albums.push(album);
        write_manifest(&self.root, &updated).await?;
        *manifest = updated;

        tracing::info!(title = %title, "Created album");
        Ok(handle)
    }

    async fn perform_mutation(&self, changes: ChangeSet) -> Result<MutationReceipt, MutationError> {
        let mut manifest = self.manifest.write().await;
        let mut updated = manifest.clone();

        for id in changes.deletions() {
            if !updated.assets.iter().any(|a| a.id == *id) {
                return Err(MutationError::deletion(StoreError::AssetNotFound(id.clone())));
            }
        }

        let mut receipt = MutationReceipt::default();
        let mut change = LibraryChange::default();

        for creation in changes.creations() {
            let request = &creation.request;
            let new_id = AssetId::new(uuid::Uuid::new_v4().to_string());
            let source = manifest.assets.iter().find(|a| a.id == request.source);

            let mut data: Vec<(ResourceKind, &[u8])> = vec![(ResourceKind::Photo, &request.photo[..])];
            if let Some(full) = &request.full_size_photo {
                data.push((ResourceKind::FullSizePhoto, &full[..]));
            }
            if let Some(adjustment) = &request.adjustment_data {
                data.push((ResourceKind::AdjustmentData, &adjustment[..]));
            }

            // Record the id before staging so a failed write is cleaned up too.
            receipt.created.push(new_id.clone());
            let resources = match self.stage_creation(&new_id, source, &data).await {
                Ok(r) => r,
                Err(e) => {
                    self.discard_media(&receipt.created).await;
                    return Err(MutationError::creation(e));
                }
            };

            for album in &creation.albums {
                match updated.albums.iter_mut().find(|a| a.id == album.id) {
                    Some(entry) => entry.assets.push(new_id.clone()),
                    None => {
                        self.discard_media(&receipt.created).await;
                        return Err(MutationError::creation(StoreError::AlbumNotFound(
                            album.id.clone(),
                        )));
                    }
                }
            }

            updated.assets.push(ManifestAsset {
                id: new_id.clone(),
                created: request.created,
                live: false,
                resources,
            });
            change.inserted.insert(new_id);
        }

        for id in changes.deletions() {
            updated.assets.retain(|a| a.id != *id);
            for album in updated.albums.iter_mut() {
                album.assets.retain(|a| a != id);
            }
            change.removed.insert(id.clone());
            receipt.deleted.push(id.clone());
        }

        if let Err(e) = write_manifest(&self.root, &updated).await {
            self.discard_media(&receipt.created).await;
            let err = if changes.creations().is_empty() {
                MutationError::deletion(e)
            } else {
                MutationError::creation(e)
            };
            return Err(err);
        }
        *manifest = updated;
        drop(manifest);

        self.discard_media(&receipt.deleted).await;
        tracing::debug!(
            created = receipt.created.len(),
            deleted = receipt.deleted.len(),
            "Library mutation committed"
        );

        let _ = self.changes.send(change);
        Ok(receipt)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<LibraryChange> {
        self.changes.subscribe()
    }
}
