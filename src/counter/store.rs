//! Persistence for [`IntervalCounter`] state.
//!
//! A store reads or writes the whole document in a single call and never keeps a handle
//! open between calls.

use super::IntervalCounter;
use crate::error::{ConfigError, StoreError};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const STATE_FILE_PREFIX: &str = "logfence-counter";
const STATE_FILE_EXTENSION: &str = ".state.json";

/// Load/save/delete contract for counter state.
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Load persisted state. `Ok(None)` when nothing (or only whitespace) was stored;
    /// malformed content is an error.
    fn load_state(&self) -> Result<Option<IntervalCounter>, StoreError>;

    /// Replace any stored state with `state`.
    fn save_state(&self, state: &IntervalCounter) -> Result<(), StoreError>;

    /// Remove stored state. Removing absent state succeeds.
    fn delete_state(&self) -> Result<(), StoreError>;
}

impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    fn load_state(&self) -> Result<Option<IntervalCounter>, StoreError> {
        (**self).load_state()
    }

    fn save_state(&self, state: &IntervalCounter) -> Result<(), StoreError> {
        (**self).save_state(state)
    }

    fn delete_state(&self) -> Result<(), StoreError> {
        (**self).delete_state()
    }
}

fn decode(path: &Path, raw: &str) -> Result<Option<IntervalCounter>, StoreError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|source| StoreError::Json { path: path.to_path_buf(), source })
}

fn encode(path: &Path, state: &IntervalCounter) -> Result<String, StoreError> {
    serde_json::to_string(state).map_err(|source| StoreError::Json { path: path.to_path_buf(), source })
}

/// Simple in-memory store holding the serialized document.
///
/// Clones share the same slot.
#[derive(Default, Clone, Debug)]
pub struct InMemoryCounterStore {
    document: Arc<Mutex<Option<String>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with raw content, e.g. to exercise malformed-state handling.
    pub fn with_contents(raw: impl Into<String>) -> Self {
        Self { document: Arc::new(Mutex::new(Some(raw.into()))) }
    }

    /// The raw stored document, if any.
    pub fn contents(&self) -> Option<String> {
        self.document.lock().clone()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn load_state(&self) -> Result<Option<IntervalCounter>, StoreError> {
        let guard = self.document.lock();
        match guard.as_deref() {
            Some(raw) => decode(Path::new("<memory>"), raw),
            None => Ok(None),
        }
    }

    fn save_state(&self, state: &IntervalCounter) -> Result<(), StoreError> {
        let json = encode(Path::new("<memory>"), state)?;
        *self.document.lock() = Some(json);
        Ok(())
    }

    fn delete_state(&self) -> Result<(), StoreError> {
        self.document.lock().take();
        Ok(())
    }
}

/// Stores the counter as a single JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by `path`. Errors if the path is blank.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if path.as_os_str().to_string_lossy().trim().is_empty() {
            return Err(ConfigError::EmptyStateFile);
        }
        Ok(Self { path })
    }

    pub fn builder() -> JsonFileStoreBuilder {
        JsonFileStoreBuilder::default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CounterStore for JsonFileStore {
    fn load_state(&self) -> Result<Option<IntervalCounter>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        decode(&self.path, &raw)
    }

    fn save_state(&self, state: &IntervalCounter) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        let json = encode(&self.path, state)?;

        // Write beside the target then rename, so the file is either fully replaced or
        // left untouched.
        let staging = self.staging_path();
        fs::write(&staging, json).map_err(|e| StoreError::io(&staging, e))?;
        fs::rename(&staging, &self.path).map_err(|e| {
            let _ = fs::remove_file(&staging);
            StoreError::io(&self.path, e)
        })
    }

    fn delete_state(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}

/// Builder for [`JsonFileStore`].
#[derive(Debug, Clone, Default)]
pub struct JsonFileStoreBuilder {
    file: Option<PathBuf>,
}

impl JsonFileStoreBuilder {
    /// Use an explicit file.
    pub fn file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Derive the file from the owning target's name; see [`default_state_file`].
    pub fn use_name(mut self, name: &str) -> Self {
        self.file = Some(default_state_file(name));
        self
    }

    /// Currently configured file, if any.
    pub fn configured_file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn build(self) -> Result<JsonFileStore, ConfigError> {
        match self.file {
            Some(file) => JsonFileStore::new(file),
            None => Err(ConfigError::EmptyStateFile),
        }
    }
}

/// Default state file for a target called `name`:
/// `<temp dir>/logfence-counter-<process>-<name>.state.json`.
///
/// Process and target names are stripped to `[A-Za-z0-9_-]`, so distinct names map to
/// distinct files and the same name maps to the same file across restarts.
pub fn default_state_file(name: &str) -> PathBuf {
    let process = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let file_name = format!(
        "{STATE_FILE_PREFIX}-{}-{}{STATE_FILE_EXTENSION}",
        remove_unsafe_characters(&process),
        remove_unsafe_characters(name)
    );
    std::env::temp_dir().join(file_name)
}

fn remove_unsafe_characters(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-').collect()
}
