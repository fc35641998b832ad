use crate::error::{Result, SyncError};
use crate::logger::Logger;
use crate::snapshot::{FileEntry, Snapshot};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};
// Filesystem enumeration and exclusion

/// Exclusion list: bare names, relative paths, or absolute paths
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    exact: HashSet<String>,
    patterns: Vec<String>,
}

/// Lexically clean a path: drop `.` components, duplicate and trailing separators.
fn clean_path(raw: &str) -> String {
    let p: PathBuf = Path::new(raw)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    p.to_string_lossy().into_owned()
}

impl ExcludeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one entry per line; blank lines are ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SyncError::fs(path, e))?;
        Ok(text.lines().collect())
    }

    pub fn insert(&mut self, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        let cleaned = clean_path(&crate::snapshot::normalize_separators(raw));
        if cleaned.contains('*') {
            self.patterns.push(cleaned);
        } else {
            self.exact.insert(cleaned);
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(&self, s: &str) -> bool {
        self.exact.contains(s) || self.patterns.iter().any(|p| glob_match(p, s))
    }

    /// Check a walked entry given its root-relative and absolute paths.
    ///
    /// Every segment and every ancestor prefix of `rel` is checked, so an
    /// excluded directory hides its whole subtree.
    pub fn is_excluded(&self, rel: &str, abs: &Path) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.matches(rel) || self.matches(&abs.to_string_lossy()) {
            return true;
        }
        let mut prefix = String::with_capacity(rel.len());
        for segment in rel.split(MAIN_SEPARATOR).filter(|s| !s.is_empty()) {
            if self.matches(segment) {
                return true;
            }
            if !prefix.is_empty() {
                prefix.push(MAIN_SEPARATOR);
            }
            prefix.push_str(segment);
            if self.matches(&prefix) {
                return true;
            }
        }
        false
    }
}

impl<'a> FromIterator<&'a str> for ExcludeSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut set = ExcludeSet::new();
        for line in iter {
            set.insert(line);
        }
        set
    }
}

/// Simple glob matching (supports * wildcards)
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    // Simple wildcard matching
    if pattern.starts_with('*') && pattern.ends_with('*') && pattern.len() > 1 {
        let middle = &pattern[1..pattern.len() - 1];
        return text.contains(middle);
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        return text.ends_with(suffix);
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        return text.starts_with(prefix);
    }

    // Exact match
    pattern == text
}

fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let s = rel.to_string_lossy();
    s.strip_prefix(MAIN_SEPARATOR).unwrap_or(&s).to_string()
}

/// Walk `root` into a snapshot keyed by native relative path.
///
/// The root itself is not recorded, symlinks are skipped, excluded
/// directories are not descended into, and per-entry errors are logged.
pub fn walk_tree(root: &Path, exclude: &ExcludeSet, logger: &dyn Logger) -> Snapshot {
    use walkdir::WalkDir;

    let mut snapshot = Snapshot::new();

    for item in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            // Skip excluded entries entirely - this prevents walking into them
            e.depth() == 0 || !exclude.is_excluded(&relative_key(root, e.path()), e.path())
        })
    {
        let entry = match item {
            Ok(e) => e,
            Err(e) => {
                log_error!(logger, "visit for path: {:?} failed: {}", e.path(), e);
                continue;
            }
        };
        if entry.depth() == 0 || entry.file_type().is_symlink() {
            continue;
        }
        let md = match entry.metadata() {
            Ok(md) => md,
            Err(e) => {
                log_error!(logger, "stat {} failed: {}", entry.path().display(), e);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        snapshot.insert(
            relative_key(root, entry.path()),
            FileEntry::from_metadata(name, &md),
        );
    }

    snapshot
}
