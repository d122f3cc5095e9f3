//! Per-batch collection state.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::types::{AssetId, ResourceKind};

/// Bytes received so far for one resource part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartData {
    pub bytes: Vec<u8>,
    pub complete: bool,
}

/// Asset → part kind → received data, for the batch in flight.
///
/// An asset is complete when every tracked part is complete; the batch is
/// ready to commit only when every asset is. Only
/// [`CollectionState::into_complete`] produces the data a commit consumes,
/// so a commit cannot be built from partial data.
#[derive(Debug, Clone, Default)]
pub struct CollectionState {
    entries: BTreeMap<AssetId, BTreeMap<ResourceKind, PartData>>,
}

impl CollectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset, even one without collectable parts.
    pub fn track_asset(&mut self, asset: &AssetId) {
        self.entries.entry(asset.clone()).or_default();
    }

    pub fn track_part(&mut self, asset: &AssetId, kind: ResourceKind) {
        self.entries
            .entry(asset.clone())
            .or_default()
            .insert(kind, PartData::default());
    }

    /// Append a chunk. Returns false for untracked or already completed parts.
    pub fn append(&mut self, asset: &AssetId, kind: ResourceKind, chunk: &[u8]) -> bool {
        match self.part_mut(asset, kind) {
            Some(part) if !part.complete => {
                part.bytes.extend_from_slice(chunk);
                true
            }
            _ => false,
        }
    }

    /// Drop whatever was received for a part ahead of a fresh attempt.
    pub fn restart_part(&mut self, asset: &AssetId, kind: ResourceKind) {
        if let Some(part) = self.part_mut(asset, kind) {
            part.bytes.clear();
            part.complete = false;
        }
    }

    pub fn mark_complete(&mut self, asset: &AssetId, kind: ResourceKind) -> bool {
        match self.part_mut(asset, kind) {
            Some(part) => {
                part.complete = true;
                true
            }
            None => false,
        }
    }

    pub fn part(&self, asset: &AssetId, kind: ResourceKind) -> Option<&PartData> {
        self.entries.get(asset).and_then(|parts| parts.get(&kind))
    }

    fn part_mut(&mut self, asset: &AssetId, kind: ResourceKind) -> Option<&mut PartData> {
        self.entries
            .get_mut(asset)
            .and_then(|parts| parts.get_mut(&kind))
    }

    pub fn is_asset_complete(&self, asset: &AssetId) -> bool {
        self.entries
            .get(asset)
            .is_some_and(|parts| parts.values().all(|p| p.complete))
    }

    pub fn is_complete(&self) -> bool {
        self.entries
            .values()
            .all(|parts| parts.values().all(|p| p.complete))
    }

    pub fn incomplete_parts(&self) -> Vec<(AssetId, ResourceKind)> {
        self.entries
            .iter()
            .flat_map(|(id, parts)| {
                parts
                    .iter()
                    .filter(|(_, p)| !p.complete)
                    .map(move |(kind, _)| (id.clone(), *kind))
            })
            .collect()
    }

    pub fn assets(&self) -> impl Iterator<Item = &AssetId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Freeze a fully collected batch. Hands the state back unchanged when
    /// any part is still incomplete.
    pub fn into_complete(self) -> Result<CompletedCollection, CollectionState> {
        if !self.is_complete() {
            return Err(self);
        }
        let entries = self
            .entries
            .into_iter()
            .map(|(id, mut parts)| {
                let mut take =
                    |kind: ResourceKind| parts.remove(&kind).map(|p| Bytes::from(p.bytes));
                let asset = CompletedAsset {
                    photo: take(ResourceKind::Photo),
                    full_size_photo: take(ResourceKind::FullSizePhoto),
                    adjustment_data: take(ResourceKind::AdjustmentData),
                };
                (id, asset)
            })
            .collect();
        Ok(CompletedCollection { entries })
    }
}

/// Still-image data of one fully collected asset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedAsset {
    pub photo: Option<Bytes>,
    pub full_size_photo: Option<Bytes>,
    pub adjustment_data: Option<Bytes>,
}

/// A batch whose every tracked part was received in full.
#[derive(Debug, Clone, Default)]
pub struct CompletedCollection {
    entries: BTreeMap<AssetId, CompletedAsset>,
}

impl CompletedCollection {
    pub fn get(&self, asset: &AssetId) -> Option<&CompletedAsset> {
        self.entries.get(asset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
