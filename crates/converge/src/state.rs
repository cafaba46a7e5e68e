//! Persisted state and the crash-consistent state store
//!
//! The state file records every resource whose most recent create succeeded
//! and has not since been destroyed. The executor updates it immediately
//! after each resource operation, so an interrupted run leaves an accurate
//! record of whatever did succeed.

use crate::diff::config_hash;
use crate::error::StateError;
use crate::resource::Resource;
use crate::types::RunKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Current state file format version
pub const STATE_VERSION: u32 = 1;

// ============================================================================
// State Structures
// ============================================================================

/// Persisted snapshot of an applied resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Declared config at the time of the last successful operation
    #[serde(default)]
    pub config: Value,
    /// Structural hash of `config`
    pub config_hash: String,
    /// Provider-populated outputs
    #[serde(default)]
    pub outputs: Value,
    pub applied_at: DateTime<Utc>,
}

impl StateEntry {
    /// Snapshot a resource after a successful operation
    pub fn from_resource(resource: &Resource, outputs: Value, checksum: Option<String>) -> Self {
        Self {
            id: resource.id.clone(),
            name: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            module: resource.module.clone(),
            source_file: resource.source_file.clone(),
            checksum,
            depends_on: resource.depends_on.clone(),
            config: resource.config.clone(),
            config_hash: config_hash(&resource.config),
            outputs,
            applied_at: Utc::now(),
        }
    }

    /// Reconstruct the resource as it was last applied
    ///
    /// Used to tear down resources that are no longer declared.
    pub fn to_resource(&self) -> Resource {
        let mut resource = Resource::new(&self.resource_type, &self.name);
        resource.id = self.id.clone();
        resource.module = self.module.clone();
        resource.source_file = self.source_file.clone();
        resource.depends_on = self.depends_on.clone();
        resource.config = self.config.clone();
        resource.outputs = self.outputs.clone();
        resource.checksum = self.checksum.clone();
        resource
    }
}

/// Ordered collection of state entries plus run metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub version: u32,
    pub engine_version: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunKind>,
    #[serde(default)]
    pub resources: Vec<StateEntry>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            last_updated: Utc::now(),
            last_run: None,
            resources: Vec::new(),
        }
    }
}

impl State {
    pub fn find(&self, id: &str) -> Option<&StateEntry> {
        self.resources.iter().find(|e| e.id == id)
    }

    /// Insert or replace an entry; a replaced entry keeps its position
    pub fn upsert(&mut self, entry: StateEntry) {
        match self.resources.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.resources.push(entry),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<StateEntry> {
        let index = self.resources.iter().position(|e| e.id == id)?;
        Some(self.resources.remove(index))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(|e| e.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Read state from `path`; a missing file yields an empty state
    pub fn load(path: &Path) -> Result<Self, StateError> {
        if !path.exists() {
            log::debug!("State file {} does not exist, using empty state", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| StateError::Io {
            action: "read",
            path: path.to_path_buf(),
            source,
        })?;

        let state: State = serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        if state.version != STATE_VERSION {
            log::warn!(
                "State file {} has version {}, expected {}",
                path.display(),
                state.version,
                STATE_VERSION
            );
        }

        log::debug!(
            "Loaded state from {} ({} resources)",
            path.display(),
            state.len()
        );
        Ok(state)
    }

    /// Write state to `path` atomically
    ///
    /// Serializes to a sibling temp file, syncs it, then renames it over the
    /// previous file so a crash mid-write leaves the old file intact.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |action: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| StateError::Io {
                action,
                path,
                source,
            }
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err("create directory for", path))?;
        }

        let content = serde_json::to_string_pretty(self).map_err(StateError::Serialize)?;

        let tmp_path = temp_path(path);
        let mut file = File::create(&tmp_path).map_err(io_err("create", &tmp_path))?;
        file.write_all(content.as_bytes())
            .map_err(io_err("write", &tmp_path))?;
        file.sync_all().map_err(io_err("sync", &tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, path).map_err(io_err("replace", path))?;

        log::trace!("Saved state to {}", path.display());
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".tmp");
    path.with_file_name(name)
}

// ============================================================================
// StateStore
// ============================================================================

/// State shared by concurrently executing workers
///
/// Every mutation takes the lock, writes the updated state to disk and only
/// then publishes it in memory, so concurrent workers never lose updates and
/// memory never runs ahead of the file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl StateStore {
    /// Open the store at `path`, loading any existing state
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let state = State::load(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> State {
        self.lock().clone()
    }

    pub fn find_by_id(&self, id: &str) -> Option<StateEntry> {
        self.lock().find(id).cloned()
    }

    /// Apply `change` to a copy, persist it, then publish it
    ///
    /// A failed save leaves the in-memory state as it was on disk.
    fn commit<T>(&self, change: impl FnOnce(&mut State) -> T) -> Result<T, StateError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = change(&mut next);
        next.last_updated = Utc::now();
        next.save(&self.path)?;
        *guard = next;
        Ok(out)
    }

    /// Insert or replace an entry and persist
    pub fn upsert(&self, entry: StateEntry) -> Result<(), StateError> {
        log::debug!("State upsert {}", entry.id);
        self.commit(|state| state.upsert(entry))
    }

    /// Remove an entry and persist; removing an unknown ID is a no-op
    pub fn remove(&self, id: &str) -> Result<Option<StateEntry>, StateError> {
        if self.lock().find(id).is_none() {
            return Ok(None);
        }
        log::debug!("State remove {id}");
        self.commit(|state| state.remove(id))
    }

    /// Record the kind of the last run and persist
    pub fn mark_run(&self, kind: RunKind) -> Result<(), StateError> {
        self.commit(|state| state.last_run = Some(kind))
    }

    /// Persist the current in-memory state
    pub fn save(&self) -> Result<(), StateError> {
        self.lock().save(&self.path)
    }
}

// ============================================================================
// Tests
// ============================================================================
