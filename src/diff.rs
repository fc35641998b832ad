//! One-directional, additive snapshot comparison

use crate::logger::Logger;
use crate::snapshot::Snapshot;

/// Entries of `src` that must be transferred to bring `dst` up to date.
///
/// New paths (files or directories) are always included. A path present on
/// both sides is included only when the source is a regular file and either
/// the destination is older or the sizes differ. Directories that already
/// exist are never re-sent, and paths only present in `dst` are ignored.
pub fn compare(src: &Snapshot, dst: &Snapshot) -> Snapshot {
    src.iter()
        .filter(|(path, entry)| match dst.get(path) {
            None => true,
            Some(d) => !entry.is_dir && (d.mod_time < entry.mod_time || d.size != entry.size),
        })
        .map(|(p, e)| (p.clone(), e.clone()))
        .collect()
}

/// Same as [`compare`] but reports each decision at debug level.
pub fn compare_logged(src: &Snapshot, dst: &Snapshot, logger: &dyn Logger) -> Snapshot {
    let diff = compare(src, dst);
    for (path, _) in &diff {
        if dst.contains(path) {
            log_debug!(logger, "{} changed in src, needs sync", path);
        } else {
            log_debug!(logger, "{} missing in dst, needs sync", path);
        }
    }
    diff
}
