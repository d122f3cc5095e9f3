//! Alerts raised by the duplication engine and how they are presented.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// A part is only available in the cloud and cloud fetching is off.
    UnableToLoadCloudAssetData,
    /// Every batch committed but the originals were kept.
    DidFinishDuplicateWithoutDelete,
    AssetCreationError,
    AssetDeletionError { user_cancelled: bool },
    /// A part could not be loaded even after retrying.
    ResourceLoadError,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::UnableToLoadCloudAssetData => "unableToLoadCloudAssetData",
            AlertKind::DidFinishDuplicateWithoutDelete => "didFinishDuplicateWithoutDelete",
            AlertKind::AssetCreationError => "assetCreationError",
            AlertKind::AssetDeletionError { .. } => "assetDeletionError",
            AlertKind::ResourceLoadError => "resourceLoadError",
        }
    }

    /// Alerts after which the engine is paused rather than idle.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            AlertKind::UnableToLoadCloudAssetData | AlertKind::ResourceLoadError
        )
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Choices offered alongside an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertAction {
    Dismiss,
    EnableCloudAndResume,
    Retry,
    Abandon,
}

impl AlertAction {
    pub fn label(self) -> &'static str {
        match self {
            AlertAction::Dismiss => "OK",
            AlertAction::EnableCloudAndResume => "Load from iCloud",
            AlertAction::Retry => "Retry",
            AlertAction::Abandon => "Cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    /// Underlying error text, or the asset concerned.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertPresentation {
    pub title: &'static str,
    pub message: String,
    pub actions: Vec<AlertAction>,
}

impl Alert {
    pub fn new(kind: AlertKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: AlertKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn presentation(&self) -> AlertPresentation {
        let with_detail = |base: &str| match &self.detail {
            Some(detail) => format!("{base} {detail}"),
            None => base.to_string(),
        };
        match self.kind {
            AlertKind::UnableToLoadCloudAssetData => AlertPresentation {
                title: "Photos stored in iCloud",
                message: with_detail(
                    "Some of the selected photos are only available in iCloud. Load them from iCloud to continue?",
                ),
                actions: vec![AlertAction::EnableCloudAndResume, AlertAction::Abandon],
            },
            AlertKind::DidFinishDuplicateWithoutDelete => AlertPresentation {
                title: "Done",
                message: "Still copies were created. The original Live Photos were kept.".to_string(),
                actions: vec![AlertAction::Dismiss],
            },
            AlertKind::AssetCreationError => AlertPresentation {
                title: "Error",
                message: with_detail("The still copies could not be created."),
                actions: vec![AlertAction::Dismiss],
            },
            AlertKind::AssetDeletionError {
                user_cancelled: true,
            } => AlertPresentation {
                title: "Error",
                message: "Deleting the original Live Photos was cancelled. Nothing was changed."
                    .to_string(),
                actions: vec![AlertAction::Dismiss],
            },
            AlertKind::AssetDeletionError {
                user_cancelled: false,
            } => AlertPresentation {
                title: "Error",
                message: with_detail("The original Live Photos could not be deleted."),
                actions: vec![AlertAction::Dismiss],
            },
            AlertKind::ResourceLoadError => AlertPresentation {
                title: "Error",
                message: with_detail("Photo data could not be loaded."),
                actions: vec![AlertAction::Retry, AlertAction::Abandon],
            },
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind, detail),
            None => write!(f, "{}", self.kind),
        }
    }
}
