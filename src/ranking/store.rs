//! Persisted per-app usage history.
//!
//! Stored as JSON: `{ "apps": { "<id>": { "use_count": 3, "last_use_date": 1700000000000 } } }`.
//! `last_use_date` is milliseconds since the Unix epoch; 0 means never used.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::ranking::FrecencyLookup;

/// Usage history of one app.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrecencyRecord {
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub last_use_date: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    apps: BTreeMap<String, FrecencyRecord>,
}

/// Usage records keyed by app identifier.
#[derive(Debug, Default)]
pub struct FrecencyStore {
    path: Option<PathBuf>,
    apps: BTreeMap<String, FrecencyRecord>,
    dirty: bool,
}

/// A store shared between a session and its owner.
pub type SharedFrecencyStore = Arc<Mutex<FrecencyStore>>;

impl FrecencyStore {
    /// Load the store at `path`. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let apps = match fs::read_to_string(&path) {
            Ok(data) => {
                serde_json::from_str::<StoreFile>(&data)
                    .map_err(|e| StoreError::Corrupt {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?
                    .apps
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StoreError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        tracing::debug!(path = %path.display(), apps = apps.len(), "Frecency store loaded");
        Ok(Self {
            path: Some(path),
            apps,
            dirty: false,
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedFrecencyStore {
        Arc::new(Mutex::new(self))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, id: &str) -> FrecencyRecord {
        self.apps.get(id).copied().unwrap_or_default()
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &FrecencyRecord)> {
        self.apps.iter().map(|(id, record)| (id.as_str(), record))
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Count one completed payment with `id` at `now_ms`.
    pub fn record_use(&mut self, id: &str, now_ms: i64) -> FrecencyRecord {
        let record = self.apps.entry(id.to_string()).or_default();
        record.use_count = record.use_count.saturating_add(1);
        record.last_use_date = record.last_use_date.max(now_ms);
        self.dirty = true;
        *record
    }

    /// Overwrite the use count of `id`.
    pub fn set_use_count(&mut self, id: &str, use_count: u64) {
        self.apps.entry(id.to_string()).or_default().use_count = use_count;
        self.dirty = true;
    }

    /// Overwrite the last use date of `id`.
    pub fn set_last_use_date(&mut self, id: &str, last_use_date: i64) {
        self.apps.entry(id.to_string()).or_default().last_use_date = last_use_date;
        self.dirty = true;
    }

    /// Write pending changes. In-memory stores and clean stores are a no-op.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        let write_err = |e: &dyn std::fmt::Display| StoreError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_err(&e))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp_file = BufWriter::new(File::create(&tmp_path).map_err(|e| write_err(&e))?);
            let file = StoreFile {
                apps: self.apps.clone(),
            };
            serde_json::to_writer_pretty(&mut tmp_file, &file).map_err(|e| write_err(&e))?;
            tmp_file.flush().map_err(|e| write_err(&e))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| write_err(&e))?;

        self.dirty = false;
        tracing::debug!(path = %path.display(), apps = self.apps.len(), "Frecency store flushed");
        Ok(())
    }
}

impl FrecencyLookup for FrecencyStore {
    fn frecency_record(&self, id: &str) -> FrecencyRecord {
        self.get(id)
    }
}
