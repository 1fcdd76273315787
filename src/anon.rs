//! The anonymous-export name table: `a_XXX` -> real backing subpath.
//!
//! Reads `anon_mapping_file` line by line, splits on the first `:`, skips
//! blank or malformed lines with a warning. Reloads lazily on a miss or two
//! explicit commands (`CLEARCACHE`, `FORCE-RELOAD`), tracking the file's
//! mtime so a stale map reloads on next miss without waiting for an
//! explicit command.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::warn;
use parking_lot::RwLock;

struct Loaded {
    /// A `Vec`, not a map, so iteration preserves the order entries appear
    /// in the mapping file. A plain sorted map would silently reorder
    /// exports alphabetically.
    entries: Vec<(String, String)>,
    mtime: Option<SystemTime>,
}

/// Owned by the `lister` module, shared read-only with `anonym`.
pub struct AnonMap {
    file: PathBuf,
    state: RwLock<Loaded>,
}

impl AnonMap {
    pub fn new(file: PathBuf) -> Self {
        let state = load(&file);
        AnonMap {
            file,
            state: RwLock::new(state),
        }
    }

    /// Looks a name up, triggering a lazy reload first if the map is empty
    /// or the backing file's mtime has advanced since the last load.
    pub fn get(&self, name: &str) -> Option<String> {
        self.reload_if_stale();
        self.state
            .read()
            .entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    /// In insertion order.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.reload_if_stale();
        self.state.read().entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// `CLEARCACHE`: evict without reloading.
    pub fn clear(&self) {
        *self.state.write() = Loaded {
            entries: Vec::new(),
            mtime: None,
        };
    }

    /// `FORCE-RELOAD`: reload unconditionally.
    pub fn force_reload(&self) {
        *self.state.write() = load(&self.file);
    }

    fn reload_if_stale(&self) {
        let need_reload = {
            let state = self.state.read();
            state.entries.is_empty() || state.mtime != file_mtime(&self.file)
        };
        if need_reload {
            *self.state.write() = load(&self.file);
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

fn load(path: &Path) -> Loaded {
    let mtime = file_mtime(path);
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => String::new(),
    };

    let mut entries: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) if key.starts_with("a_") => {
                match entries.iter_mut().find(|(k, _)| k == key) {
                    Some((_, v)) => *v = value.to_string(),
                    None => entries.push((key.to_string(), value.to_string())),
                }
            }
            _ => warn!("skipping invalid anon-map line: {line}"),
        }
    }

    Loaded { entries, mtime }
}
