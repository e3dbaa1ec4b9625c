use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Durable set of source identifiers that were already uploaded.
///
/// Readers consult the in-memory copy. Only `mark_done` writes, and it rewrites
/// the whole file before returning, so a crash after it returns never loses the
/// entry.
pub struct ProcessedSet {
    path: PathBuf,
    ids: RwLock<HashSet<String>>,
}

impl ProcessedSet {
    /// Load the set from `path`. A missing, unreadable or corrupt file yields an
    /// empty set instead of an error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ids = match load_ids(&path) {
            Ok(ids) => {
                if !ids.is_empty() {
                    info!("Loaded {} processed id(s) from {}", ids.len(), path.display());
                }
                ids
            }
            Err(e) => {
                warn!("Failed to read {}: {}; starting empty", path.display(), e);
                HashSet::new()
            }
        };
        Self {
            path,
            ids: RwLock::new(ids),
        }
    }

    pub fn is_new(&self, id: &str) -> bool {
        !self.ids.read().contains(id)
    }

    /// Record `id` and persist the set. Returns `false` when it was already present.
    pub fn mark_done(&self, id: &str) -> io::Result<bool> {
        let mut ids = self.ids.write();
        if !ids.insert(id.to_string()) {
            debug!("{} already recorded", id);
            return Ok(false);
        }
        if let Err(e) = save_ids(&self.path, &ids) {
            ids.remove(id);
            return Err(e);
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load_ids(path: &Path) -> io::Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let data = fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(HashSet::new());
    }
    let ids: Vec<serde_json::Value> = serde_json::from_str(&data)?;
    // Older caches stored numeric media pks; normalize everything to strings.
    Ok(ids
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}

fn save_ids(path: &Path, ids: &HashSet<String>) -> io::Result<()> {
    let mut sorted: Vec<&String> = ids.iter().collect();
    sorted.sort();
    let data = serde_json::to_string_pretty(&sorted)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = File::create(&tmp)?;
        f.write_all(data.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
