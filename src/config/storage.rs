//! Settings Storage
//!
//! Reads and writes the structured settings document that holds the
//! connection lists. Settings location: ~/.codescan on macOS/Linux,
//! %APPDATA%\CodeScan on Windows.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::SettingsFile;

/// Settings storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the CodeScan configuration directory
/// Returns %APPDATA%\CodeScan on Windows, ~/.codescan on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("CodeScan"));
        }
        dirs::home_dir()
            .map(|home| home.join(".codescan"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".codescan"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the settings file path
pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Get the options file path
pub fn options_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("connected-mode.json"))
}

/// Backing store for the settings document.
///
/// Writes replace the whole document; there is no transaction spanning a
/// load and the following save.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<SettingsFile, StorageError>;

    async fn save(&self, settings: &SettingsFile) -> Result<(), StorageError>;
}

/// JSON file backed settings store
pub struct JsonSettingsStorage {
    path: PathBuf,
}

impl JsonSettingsStorage {
    /// Create a storage manager with the default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current file next to itself with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStorage {
    /// Returns defaults if the file doesn't exist.
    /// A corrupted file is backed up and defaults are returned.
    async fn load(&self) -> Result<SettingsFile, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(SettingsFile::default()),
            Ok(contents) => match serde_json::from_str::<SettingsFile>(&contents) {
                Ok(settings) => Ok(settings),
                Err(e) => {
                    tracing::warn!("Settings file corrupted: {}", e);

                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted settings backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted settings: {}", backup_err);
                        }
                    }

                    Ok(SettingsFile::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SettingsFile::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn save(&self, settings: &SettingsFile) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(settings)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        tracing::debug!("Settings saved to {:?}", self.path);
        Ok(())
    }
}

/// In-memory settings store (embedding hosts and tests)
#[derive(Default)]
pub struct MemorySettingsStore {
    settings: RwLock<SettingsFile>,
    saves: AtomicUsize,
}

impl MemorySettingsStore {
    pub fn new(settings: SettingsFile) -> Self {
        Self {
            settings: RwLock::new(settings),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> SettingsFile {
        self.settings.read().clone()
    }

    /// Number of completed `save` calls
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> Result<SettingsFile, StorageError> {
        Ok(self.settings.read().clone())
    }

    async fn save(&self, settings: &SettingsFile) -> Result<(), StorageError> {
        *self.settings.write() = settings.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
