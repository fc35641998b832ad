//! Snapshot: point-in-time file metadata for a tree, keyed by relative path

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::MAIN_SEPARATOR;
use std::time::UNIX_EPOCH;

/// Type flag carried in `FileEntry::mode` for directories.
pub const MODE_DIR: u32 = 1 << 31;
/// Permission bits portion of `FileEntry::mode`.
pub const MODE_PERM: u32 = 0o7777;

/// One filesystem object as seen by a tree walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub mode: u32,
    pub is_dir: bool,
}

impl FileEntry {
    pub fn from_metadata(name: impl Into<String>, md: &Metadata) -> Self {
        let is_dir = md.is_dir();
        let mod_time = md
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(UNIX_EPOCH));
        let mut mode = permission_bits(md, is_dir);
        if is_dir {
            mode |= MODE_DIR;
        }
        FileEntry {
            name: name.into(),
            size: if is_dir { 0 } else { md.len() as i64 },
            mod_time,
            mode,
            is_dir,
        }
    }

    pub fn permissions(&self) -> u32 {
        self.mode & MODE_PERM
    }

    /// Zero-length regular files need no transfer round trip.
    pub fn is_empty_file(&self) -> bool {
        !self.is_dir && self.size == 0
    }
}

#[cfg(unix)]
fn permission_bits(md: &Metadata, _is_dir: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & MODE_PERM
}

#[cfg(not(unix))]
fn permission_bits(md: &Metadata, is_dir: bool) -> u32 {
    match (is_dir, md.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

/// Convert a relative path to the forward-slash form used on the wire and on disk.
pub fn to_wire_path(rel: &str) -> String {
    if MAIN_SEPARATOR == '/' {
        rel.to_string()
    } else {
        rel.replace(MAIN_SEPARATOR, "/")
    }
}

/// Convert a forward-slash wire path to the platform-native form.
///
/// Only `/` is rewritten: `\\` is a legal filename byte on Unix and must
/// survive a cache round trip.
pub fn to_native_path(rel: &str) -> String {
    if MAIN_SEPARATOR == '/' {
        rel.to_string()
    } else {
        rel.replace('/', &MAIN_SEPARATOR.to_string())
    }
}

/// Convert a user-supplied path written with either separator to native form.
/// Used for command destination dirs and exclude lines, never for snapshot keys.
pub fn normalize_separators(path: &str) -> String {
    path.chars()
        .map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
        .collect()
}

/// Mapping of relative path → FileEntry. Keys are platform-native in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: BTreeMap<String, FileEntry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, rel: &str) -> Option<&FileEntry> {
        self.entries.get(rel)
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.entries.contains_key(rel)
    }

    pub fn insert(&mut self, rel: impl Into<String>, entry: FileEntry) -> Option<FileEntry> {
        self.entries.insert(rel.into(), entry)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, FileEntry> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Merge another snapshot in, converting its keys to native form.
    pub fn merge_normalized(&mut self, other: Snapshot) {
        for (k, v) in other.entries {
            self.entries.insert(to_native_path(&k), v);
        }
    }

    /// Copy with forward-slash keys, for the wire and cache files.
    pub fn to_wire(&self) -> Snapshot {
        Snapshot {
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (to_wire_path(k), v.clone()))
                .collect(),
        }
    }

    /// Copy with native keys.
    pub fn to_native(&self) -> Snapshot {
        let mut out = Snapshot::new();
        out.merge_normalized(self.clone());
        out
    }
}

impl FromIterator<(String, FileEntry)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, FileEntry)>>(iter: I) -> Self {
        Snapshot {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Snapshot {
    type Item = (String, FileEntry);
    type IntoIter = btree_map::IntoIter<String, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = (&'a String, &'a FileEntry);
    type IntoIter = btree_map::Iter<'a, String, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
