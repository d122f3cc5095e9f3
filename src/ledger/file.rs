//! Newline-delimited ledger file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

use super::error::LedgerError;
use super::{AssetLedger, LedgerEvent};
use crate::types::AssetId;

/// File-backed ledger.
///
/// The whole file is read once at open into an in-memory set. Writes are
/// serialized by `write_lock`, and the set is only updated after the file
/// operation succeeded, so the two never disagree about a committed id.
pub struct FileLedger {
    path: PathBuf,
    ids: RwLock<HashSet<AssetId>>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<LedgerEvent>,
}

impl std::fmt::Debug for FileLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileLedger {
    /// Open the ledger at `path`.
    ///
    /// A missing file is an empty ledger. An unreadable file is logged and
    /// also treated as empty: already-processed assets may reappear, which
    /// is preferable to refusing to start.
    pub async fn open(path: &Path) -> Self {
        let ids = match fs::read(path).await {
            Ok(bytes) => parse_ledger(&String::from_utf8_lossy(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No ledger file yet");
                HashSet::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read ledger, treating it as empty"
                );
                HashSet::new()
            }
        };
        tracing::debug!(path = %path.display(), entries = ids.len(), "Loaded ledger");

        let (events, _) = broadcast::channel(16);
        Self {
            path: path.to_path_buf(),
            ids: RwLock::new(ids),
            write_lock: Mutex::new(()),
            events,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn append_lines(&self, ids: &[AssetId]) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| LedgerError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let mut payload = String::new();
        for id in ids {
            payload.push_str(id.as_str());
            payload.push('\n');
        }

        let append_err = |source| LedgerError::Append {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(append_err)?;
        file.write_all(payload.as_bytes()).await.map_err(append_err)?;
        file.sync_data().await.map_err(append_err)?;
        Ok(())
    }
}

/// One identifier per line; blank lines and stray carriage returns are ignored.
fn parse_ledger(contents: &str) -> HashSet<AssetId> {
    contents
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(AssetId::from)
        .collect()
}

fn is_single_line(id: &AssetId) -> bool {
    let id = id.as_str();
    !id.is_empty() && !id.contains(['\n', '\r'])
}

#[async_trait]
impl AssetLedger for FileLedger {
    fn contains(&self, id: &AssetId) -> bool {
        self.ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    async fn record_processed(&self, ids: &[AssetId]) -> Result<usize, LedgerError> {
        let _guard = self.write_lock.lock().await;

        let fresh: Vec<AssetId> = {
            let known = self.ids.read().unwrap_or_else(|e| e.into_inner());
            let mut seen = HashSet::new();
            ids.iter()
                .filter(|id| {
                    if !is_single_line(id) {
                        tracing::warn!(asset = ?id.as_str(), "Skipping id that cannot be stored as one ledger line");
                        return false;
                    }
                    !known.contains(*id) && seen.insert(*id)
                })
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return Ok(0);
        }

        self.append_lines(&fresh).await?;

        let added = fresh.len();
        {
            let mut known = self.ids.write().unwrap_or_else(|e| e.into_inner());
            known.extend(fresh.iter().cloned());
            tracing::debug!(added, total = known.len(), "Ledger updated");
        }
        let _ = self.events.send(LedgerEvent::Recorded(fresh));
        Ok(added)
    }

    fn load_all(&self) -> HashSet<AssetId> {
        self.ids.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn reset(&self) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().await;

        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "No ledger file present to reset");
            }
            Err(source) => {
                return Err(LedgerError::Remove {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        self.ids.write().unwrap_or_else(|e| e.into_inner()).clear();
        drop(_guard);

        tracing::info!(path = %self.path.display(), "Ledger reset");
        let _ = self.events.send(LedgerEvent::Reset);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<AssetId> {
        values.iter().map(|v| AssetId::from(*v)).collect()
    }

    #[tokio::test]
    async fn test_open_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::open(&dir.path().join("images")).await;
        assert!(ledger.is_empty());
        assert!(!ledger.contains(&AssetId::from("A")));
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images");
        let ledger = FileLedger::open(&path).await;

        assert_eq!(ledger.record_processed(&ids(&["A"])).await.unwrap(), 1);
        assert_eq!(ledger.record_processed(&ids(&["A"])).await.unwrap(), 0);

        let all = ledger.load_all();
        assert_eq!(all.len(), 1);
        assert!(all.contains(&AssetId::from("A")));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A\n");
    }

    #[tokio::test]
    async fn test_duplicates_within_one_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images");
        let ledger = FileLedger::open(&path).await;
        assert_eq!(ledger.record_processed(&ids(&["A", "B", "A"])).await.unwrap(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A\nB\n");
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("images");
        {
            let ledger = FileLedger::open(&path).await;
            ledger.record_processed(&ids(&["A", "B"])).await.unwrap();
            ledger.record_processed(&ids(&["C"])).await.unwrap();
        }
        let reopened = FileLedger::open(&path).await;
        assert_eq!(reopened.load_all().len(), 3);
        assert!(reopened.contains(&AssetId::from("C")));
    }

    #[tokio::test]
    async fn test_parse_tolerates_blank_lines_and_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images");
        std::fs::write(&path, "A\r\n\nB\n\n").unwrap();
        let ledger = FileLedger::open(&path).await;
        assert_eq!(ledger.load_all(), ids(&["A", "B"]).into_iter().collect());
    }

    #[tokio::test]
    async fn test_unreadable_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in place of the file cannot be read as a file.
        let path = dir.path().join("images");
        std::fs::create_dir_all(&path).unwrap();
        let ledger = FileLedger::open(&path).await;
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_failed_append_leaves_ledger_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images");
        std::fs::create_dir_all(&path).unwrap();
        let ledger = FileLedger::open(&path).await;
        assert!(ledger.record_processed(&ids(&["A"])).await.is_err());
        assert!(!ledger.contains(&AssetId::from("A")));
    }

    #[tokio::test]
    async fn test_reset_clears_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images");
        let ledger = FileLedger::open(&path).await;
        let mut events = ledger.subscribe();
        ledger.record_processed(&ids(&["A", "B"])).await.unwrap();

        ledger.reset().await.unwrap();

        assert!(ledger.load_all().is_empty());
        assert!(!path.exists());
        assert_eq!(
            events.recv().await.unwrap(),
            LedgerEvent::Recorded(ids(&["A", "B"]))
        );
        assert_eq!(events.recv().await.unwrap(), LedgerEvent::Reset);

        // Appends after a reset start a fresh file.
        ledger.record_processed(&ids(&["A"])).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A\n");
    }

    #[tokio::test]
    async fn test_reset_without_file_still_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::open(&dir.path().join("images")).await;
        let mut events = ledger.subscribe();
        ledger.reset().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), LedgerEvent::Reset);
    }

    #[tokio::test]
    async fn test_record_broadcasts_only_new_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::open(&dir.path().join("images")).await;
        ledger.record_processed(&ids(&["A"])).await.unwrap();
        let mut events = ledger.subscribe();

        ledger.record_processed(&ids(&["A", "B"])).await.unwrap();
        ledger.record_processed(&ids(&["B"])).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), LedgerEvent::Recorded(ids(&["B"])));
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_multiline_ids_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images");
        let ledger = FileLedger::open(&path).await;

        let added = ledger
            .record_processed(&ids(&["A\nB", "C\r", "", "D"]))
            .await
            .unwrap();

        assert_eq!(added, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "D\n");
        let reopened = FileLedger::open(&path).await;
        assert_eq!(reopened.load_all(), ids(&["D"]).into_iter().collect());
    }
}
