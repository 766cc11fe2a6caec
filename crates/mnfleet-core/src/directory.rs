//! ---
//! mnf_section: "04-storage"
//! mnf_subsection: "module"
//! mnf_type: "source"
//! mnf_scope: "code"
//! mnf_description: "Label, address and instance id lookup table for the fleet."
//! mnf_version: "v0.1.0"
//! mnf_owner: "tbd"
//! ---
//! Server directory.
//!
//! The directory is an eventually consistent projection of the provider's
//! machine list plus the per-instance setup line. Controllers consult it but
//! never treat it as the source of truth for an instance they own.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use mnfleet_common::{InstanceId, Ip, Label};
use parking_lot::{Mutex, RwLock};
use tempfile::NamedTempFile;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::provider::{CloudProvider, ProviderError};

/// One machine known to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: InstanceId,
    pub label: Label,
    #[serde(default)]
    pub address: Option<Ip>,
    /// Host-specific argument handed to the install script.
    #[serde(default)]
    pub config_line: Option<String>,
}

/// Lookup table consumed by instance controllers.
pub trait ServerDirectory: Send + Sync + 'static {
    fn by_label(&self, label: &Label) -> Option<DirectoryEntry>;
    fn by_address(&self, address: &Ip) -> Option<DirectoryEntry>;
    fn by_id(&self, id: &InstanceId) -> Option<DirectoryEntry>;
    fn all_addresses(&self) -> Vec<Ip>;
    /// Insert or replace the entry for `entry.id`.
    fn upsert(&self, entry: DirectoryEntry);
    /// Flush to durable storage. Directories without one have nothing to do.
    fn persist(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    /// When the machine list last came from the provider.
    #[serde(default)]
    refreshed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    servers: Vec<DirectoryEntry>,
}

/// In-memory directory with JSON persistence.
///
/// A directory opened with [`MemoryDirectory::open`] remembers its file and
/// rewrites it on [`ServerDirectory::persist`].
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: RwLock<IndexMap<InstanceId, DirectoryEntry>>,
    refreshed_at: RwLock<Option<DateTime<Utc>>>,
    backing: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        let directory = Self::new();
        for entry in entries {
            directory.upsert(entry);
        }
        directory
    }

    /// Load a directory file; a missing file yields an empty directory.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "directory file absent, starting empty");
            return Ok(Self::new());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read directory file {}", path.display()))?;
        let file: DirectoryFile = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse directory file {}", path.display()))?;
        let directory = Self::from_entries(file.servers);
        *directory.refreshed_at.write() = file.refreshed_at;
        Ok(directory)
    }

    /// Load `path` like [`MemoryDirectory::load`] and keep it as the backing file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut directory = Self::load(&path)?;
        directory.backing = Some(path);
        Ok(directory)
    }

    pub fn backing_path(&self) -> Option<&Path> {
        self.backing.as_deref()
    }

    /// Write the directory to `path` through a temporary file in the same
    /// directory, so readers never see a partial document.
    pub fn save(&self, path: &Path) -> Result<()> {
        let _guard = self.write_lock.lock();
        let file = DirectoryFile {
            refreshed_at: self.refreshed_at(),
            servers: self.entries(),
        };
        let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent,
            None => Path::new("."),
        };
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create {}", parent.display()))?;
        let rendered = serde_json::to_string_pretty(&file)?;
        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("unable to stage directory file in {}", parent.display()))?;
        tmp.write_all(rendered.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|err| err.error)
            .with_context(|| format!("unable to write directory file {}", path.display()))?;
        Ok(())
    }

    /// Time of the last [`MemoryDirectory::refresh`], if any.
    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        *self.refreshed_at.read()
    }

    pub fn entries(&self) -> Vec<DirectoryEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Attach the install argument for `label`. Returns false when unknown.
    pub fn set_config_line(&self, label: &Label, line: String) -> bool {
        let mut entries = self.entries.write();
        match entries.values_mut().find(|e| &e.label == label) {
            Some(entry) => {
                entry.config_line = Some(line);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &InstanceId) -> Option<DirectoryEntry> {
        self.entries.write().shift_remove(id)
    }

    /// Replace the machine list with the provider's view. Config lines are
    /// carried over for ids that survive; unlabeled machines are skipped.
    pub async fn refresh(&self, provider: &dyn CloudProvider) -> Result<usize, ProviderError> {
        let records = provider.list().await?;
        let mut entries = self.entries.write();
        let mut refreshed = IndexMap::with_capacity(records.len());
        for record in records {
            let Some(label) = record.label else {
                debug!(instance = %record.id, "skipping unlabeled machine");
                continue;
            };
            let config_line = entries.get(&record.id).and_then(|e| e.config_line.clone());
            refreshed.insert(
                record.id.clone(),
                DirectoryEntry {
                    id: record.id,
                    label,
                    address: record.main_ip,
                    config_line,
                },
            );
        }
        *entries = refreshed;
        *self.refreshed_at.write() = Some(Utc::now());
        info!(servers = entries.len(), "directory refreshed");
        Ok(entries.len())
    }
}

impl ServerDirectory for MemoryDirectory {
    fn by_label(&self, label: &Label) -> Option<DirectoryEntry> {
        self.entries
            .read()
            .values()
            .find(|e| &e.label == label)
            .cloned()
    }

    fn by_address(&self, address: &Ip) -> Option<DirectoryEntry> {
        self.entries
            .read()
            .values()
            .find(|e| e.address.as_ref() == Some(address))
            .cloned()
    }

    fn by_id(&self, id: &InstanceId) -> Option<DirectoryEntry> {
        self.entries.read().get(id).cloned()
    }

    fn all_addresses(&self) -> Vec<Ip> {
        self.entries
            .read()
            .values()
            .filter_map(|e| e.address.clone())
            .collect()
    }

    fn upsert(&self, entry: DirectoryEntry) {
        self.entries.write().insert(entry.id.clone(), entry);
    }

    fn persist(&self) -> Result<()> {
        match &self.backing {
            Some(path) => {
                self.save(path)?;
                debug!(path = %path.display(), servers = self.len(), "directory persisted");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, label: &str, address: Option<&str>) -> DirectoryEntry {
        DirectoryEntry {
            id: id.parse().unwrap(),
            label: label.parse().unwrap(),
            address: address.map(|a| a.parse().unwrap()),
            config_line: None,
        }
    }

    #[test]
    fn lookups_by_every_key() {
        let directory = MemoryDirectory::from_entries([
            entry("100", "GLT_MN01", Some("10.0.0.1")),
            entry("101", "GLT_MN02", None),
        ]);
        let label: Label = "GLT_MN02".parse().unwrap();
        assert_eq!(directory.by_label(&label).unwrap().id.as_str(), "101");
        let ip: Ip = "10.0.0.1".parse().unwrap();
        assert_eq!(directory.by_address(&ip).unwrap().label.as_str(), "GLT_MN01");
        let id: InstanceId = "100".parse().unwrap();
        assert!(directory.by_id(&id).is_some());
        assert_eq!(directory.all_addresses(), vec![ip]);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let directory = MemoryDirectory::new();
        directory.upsert(entry("100", "GLT_MN01", None));
        directory.upsert(entry("100", "GLT_MN01", Some("10.0.0.1")));
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.all_addresses().len(), 1);

        let id: InstanceId = "100".parse().unwrap();
        assert!(directory.remove(&id).is_some());
        assert!(directory.is_empty());
    }

    #[test]
    fn save_then_load_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/servers.json");
        let directory = MemoryDirectory::from_entries([entry("100", "GLT_MN01", Some("10.0.0.1"))]);
        let label: Label = "GLT_MN01".parse().unwrap();
        assert!(directory.set_config_line(&label, "GLT_MN01 10.0.0.1:9319 key".into()));
        directory.save(&path).unwrap();

        let loaded = MemoryDirectory::load(&path).unwrap();
        assert_eq!(loaded.entries(), directory.entries());
        assert!(loaded.refreshed_at().is_none());
        assert!(MemoryDirectory::load(&dir.path().join("absent.json"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn opened_directory_persists_to_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        let directory = MemoryDirectory::open(&path).unwrap();
        assert_eq!(directory.backing_path(), Some(path.as_path()));
        assert!(directory.is_empty());

        directory.upsert(entry("100", "GLT_MN01", None));
        directory.persist().unwrap();
        let reloaded = MemoryDirectory::load(&path).unwrap();
        assert_eq!(reloaded.entries(), directory.entries());

        // Unbacked directories accept persist without touching disk.
        MemoryDirectory::new().persist().unwrap();
    }
}
