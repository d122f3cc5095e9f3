use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a library-managed asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Handle to an asset owned by the photo store. The core only ever holds
/// identifiers and a few cached attributes, never the asset's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoAsset {
    pub id: AssetId,
    pub created: DateTime<Utc>,
    pub has_adjustments: bool,
}

impl PhotoAsset {
    pub fn new(id: impl Into<AssetId>, created: DateTime<Utc>, has_adjustments: bool) -> Self {
        Self {
            id: id.into(),
            created,
            has_adjustments,
        }
    }
}

/// Physical data component of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Photo,
    FullSizePhoto,
    AdjustmentData,
    PairedVideo,
    FullSizePairedVideo,
    AdjustmentBasePairedVideo,
}

impl ResourceKind {
    /// Kinds needed to rebuild a still-image-only copy.
    pub fn is_still_component(self) -> bool {
        matches!(
            self,
            ResourceKind::Photo | ResourceKind::FullSizePhoto | ResourceKind::AdjustmentData
        )
    }

    /// Kinds that disappear with the Live Photo and count as reclaimed space.
    pub fn is_paired_video(self) -> bool {
        matches!(
            self,
            ResourceKind::PairedVideo
                | ResourceKind::FullSizePairedVideo
                | ResourceKind::AdjustmentBasePairedVideo
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Photo => "photo",
            ResourceKind::FullSizePhoto => "full_size_photo",
            ResourceKind::AdjustmentData => "adjustment_data",
            ResourceKind::PairedVideo => "paired_video",
            ResourceKind::FullSizePairedVideo => "full_size_paired_video",
            ResourceKind::AdjustmentBasePairedVideo => "adjustment_base_paired_video",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource of one asset, as reported by the photo store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePart {
    pub asset_id: AssetId,
    pub kind: ResourceKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlbumKind {
    User,
    Smart,
}

/// Opaque reference to an album in the photo store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlbumHandle {
    pub id: String,
    pub title: String,
}

impl AlbumHandle {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// Filter passed to `fetch_candidates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidateFilter {
    #[default]
    LivePhotos,
    All,
}

/// Diff reported by the photo store after the library changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryChange {
    pub inserted: BTreeSet<AssetId>,
    pub removed: BTreeSet<AssetId>,
    pub changed: BTreeSet<AssetId>,
}

impl LibraryChange {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_still_components() {
        assert!(ResourceKind::Photo.is_still_component());
        assert!(ResourceKind::FullSizePhoto.is_still_component());
        assert!(ResourceKind::AdjustmentData.is_still_component());
        assert!(!ResourceKind::PairedVideo.is_still_component());
        assert!(!ResourceKind::FullSizePairedVideo.is_still_component());
    }

    #[test]
    fn test_paired_video_kinds() {
        assert!(ResourceKind::PairedVideo.is_paired_video());
        assert!(ResourceKind::FullSizePairedVideo.is_paired_video());
        assert!(ResourceKind::AdjustmentBasePairedVideo.is_paired_video());
        assert!(!ResourceKind::Photo.is_paired_video());
    }

    #[test]
    fn test_resource_kind_serde_names() {
        let json = serde_json::to_string(&ResourceKind::FullSizePairedVideo).unwrap();
        assert_eq!(json, "\"full_size_paired_video\"");
        let kind: ResourceKind = serde_json::from_str("\"adjustment_data\"").unwrap();
        assert_eq!(kind, ResourceKind::AdjustmentData);
    }

    #[test]
    fn test_empty_change() {
        assert!(LibraryChange::default().is_empty());
        let mut change = LibraryChange::default();
        change.removed.insert(AssetId::from("A"));
        assert!(!change.is_empty());
    }
}
