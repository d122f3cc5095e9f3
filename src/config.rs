use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::{CleanArgs, GlobalArgs};
use crate::engine::EngineConfig;
use crate::retry::RetryConfig;
use crate::settings::{Settings, SettingsStore};
use crate::types::LogLevel;

/// File name of the processed-asset ledger inside the data directory.
pub const LEDGER_FILE: &str = "images";

/// Upper bound for the retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Application configuration shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_directory: PathBuf,
    pub library: Option<PathBuf>,
    pub log_level: LogLevel,
    pub no_progress_bar: bool,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(args: &GlobalArgs) -> Self {
        Self {
            data_directory: expand_tilde(&args.data_directory),
            library: args.library.as_deref().map(expand_tilde),
            log_level: args.log_level,
            no_progress_bar: args.no_progress_bar,
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_directory.join(LEDGER_FILE)
    }

    pub fn settings_store(&self) -> SettingsStore {
        SettingsStore::new(&self.data_directory)
    }

    /// The library directory, for commands that need one.
    pub fn require_library(&self) -> anyhow::Result<&Path> {
        self.library.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No photo library given. Pass --library <dir> or set LIVEPHOTO_CLEANER_LIBRARY."
            )
        })
    }
}

/// Settings for one `clean` run: the persisted ones with the run's flags
/// applied on top. Flags only ever turn features on (cloud) or off
/// (deletion, album); they never change the file.
pub fn run_settings(persisted: Settings, args: &CleanArgs) -> Settings {
    Settings {
        include_icloud_images: persisted.include_icloud_images || args.include_icloud,
        delete_original_live_photos: persisted.delete_original_live_photos && !args.keep_originals,
        move_to_album: persisted.move_to_album && !args.no_album,
    }
}

pub fn engine_config(args: &CleanArgs) -> EngineConfig {
    EngineConfig {
        block_size: usize::from(args.block_size),
        concurrent_fetches: usize::from(args.concurrent_fetches),
        retry: RetryConfig {
            max_retries: args.max_retries,
            base_delay: Duration::from_secs(args.retry_delay),
            max_delay: MAX_RETRY_DELAY.max(Duration::from_secs(args.retry_delay)),
        },
        ..EngineConfig::default()
    }
}
