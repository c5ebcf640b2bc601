//! Detect changes between directory trees.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use fn_error_context::context;
use walkdir::WalkDir;

use crate::whiteout::Whiteout;
use crate::Result;

/// What happened to a path between two tree states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    /// The path exists in both states with differing identity.
    Modify,
    /// The path exists only in the newer state.
    Add,
    /// The path exists only in the older state.
    Delete,
}

/// A single difference between two directory tree states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Path of the changed node, rooted with a leading separator.
    pub path: PathBuf,
    /// The kind of change.
    pub kind: ChangeKind,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = match self.kind {
            ChangeKind::Modify => 'C',
            ChangeKind::Add => 'A',
            ChangeKind::Delete => 'D',
        };
        write!(f, "{k} {}", self.path.display())
    }
}

/// The identity of one filesystem node, as compared between trees.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStat {
    is_dir: bool,
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    size: u64,
    mtime: (i64, i64),
    link_target: Option<PathBuf>,
    capability: Option<Vec<u8>>,
}

/// Compare timestamps the way archived trees require: equal seconds with
/// a zero nanosecond part on either side still count as equal, since the
/// archive format truncates to whole seconds.
fn same_fs_time(a: (i64, i64), b: (i64, i64)) -> bool {
    a == b || (a.0 == b.0 && (a.1 == 0 || b.1 == 0))
}

fn stat_different(old: &FileStat, new: &FileStat) -> bool {
    if old.mode != new.mode
        || old.uid != new.uid
        || old.gid != new.gid
        || old.rdev != new.rdev
        || old.link_target != new.link_target
        || old.capability != new.capability
    {
        return true;
    }
    // Size and mtime of a directory churn with operations on its
    // children and are not a meaningful change of the directory itself.
    // (Trees on NTFS would need directory mtime considered; this crate
    // only targets Unix filesystems.)
    if !old.is_dir && (!same_fs_time(old.mtime, new.mtime) || old.size != new.size) {
        return true;
    }
    false
}

fn capability_of(path: &Path) -> Option<Vec<u8>> {
    let mut buf = [0u8; 256];
    match rustix::fs::lgetxattr(path, "security.capability", &mut buf) {
        Ok(n) => Some(buf[..n].to_vec()),
        Err(_) => None,
    }
}

fn collect_tree(root: &Path) -> Result<BTreeMap<String, FileStat>> {
    let mut ret = BTreeMap::new();
    for dent in WalkDir::new(root).sort_by_file_name() {
        let dent = dent?;
        let rel = dent
            .path()
            .strip_prefix(root)
            .expect("walk stays under root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel = rel
            .to_str()
            .with_context(|| format!("invalid non-UTF8 path {:?}", dent.path()))?;
        let meta = std::fs::symlink_metadata(dent.path())?;
        let ft = meta.file_type();
        let stat = FileStat {
            is_dir: ft.is_dir(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            mtime: (meta.mtime(), meta.mtime_nsec()),
            link_target: if ft.is_symlink() {
                Some(std::fs::read_link(dent.path())?)
            } else {
                None
            },
            capability: if ft.is_file() {
                capability_of(dent.path())
            } else {
                None
            },
        };
        ret.insert(format!("/{rel}"), stat);
    }
    Ok(ret)
}

/// Compare the tree at `new_dir` against the older tree at `old_dir`,
/// returning the differences sorted by path.
#[context("Diffing {} against {}", new_dir.display(), old_dir.display())]
pub fn changes_dirs(new_dir: &Path, old_dir: &Path) -> Result<Vec<Change>> {
    let new_tree = collect_tree(new_dir)?;
    let old_tree = collect_tree(old_dir)?;

    let mut ret = Vec::new();
    let paths: BTreeSet<&String> = new_tree.keys().chain(old_tree.keys()).collect();
    for path in paths {
        let kind = match (old_tree.get(path), new_tree.get(path)) {
            (Some(old), Some(new)) => {
                if stat_different(old, new) {
                    ChangeKind::Modify
                } else {
                    continue;
                }
            }
            (None, Some(_)) => ChangeKind::Add,
            (Some(_), None) => ChangeKind::Delete,
            (None, None) => unreachable!(),
        };
        ret.push(Change {
            path: PathBuf::from(path),
            kind,
        });
    }
    Ok(ret)
}

/// Read `rw` as the writable layer above the union of `parent_layers`,
/// interpreting whiteout markers as deletions.
///
/// An opaque marker produces deletions for the parent union's contents of
/// that directory, followed by additions for the layer's own contents;
/// the resulting list is sorted by path with deletions ordered before
/// re-additions of the same name.
#[context("Reading layer changes of {}", rw.display())]
pub fn changes(parent_layers: &[&Path], rw: &Path) -> Result<Vec<Change>> {
    // First pass: record markers so classification below does not depend
    // on walk order relative to them.
    let mut entries = Vec::new();
    let mut deletes: BTreeSet<String> = BTreeSet::new();
    let mut opaque_dirs: Vec<String> = Vec::new();
    for dent in WalkDir::new(rw).sort_by_file_name() {
        let dent = dent?;
        let rel = dent.path().strip_prefix(rw).expect("walk stays under root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel = rel
            .to_str()
            .with_context(|| format!("invalid non-UTF8 path {:?}", dent.path()))?;
        let base = rel.rsplit('/').next().expect("non-empty path");
        let parent = &rel[..rel.len() - base.len()];
        match Whiteout::parse(base) {
            Some(Whiteout::Meta) => continue,
            Some(Whiteout::OpaqueDir) => {
                let dir = parent.trim_end_matches('/').to_string();
                for layer in parent_layers {
                    let lower = layer.join(&dir);
                    let Ok(children) = std::fs::read_dir(&lower) else {
                        continue;
                    };
                    for child in children {
                        let child = child?;
                        let name = child.file_name();
                        let name = name.to_str().context("non-UTF8 name in parent layer")?;
                        deletes.insert(if dir.is_empty() {
                            format!("/{name}")
                        } else {
                            format!("/{dir}/{name}")
                        });
                    }
                }
                opaque_dirs.push(dir);
            }
            Some(Whiteout::Sibling(victim)) => {
                deletes.insert(format!("/{parent}{victim}"));
            }
            None => entries.push((rel.to_string(), dent.file_type().is_dir())),
        }
    }

    let mut ret: Vec<Change> = deletes
        .into_iter()
        .map(|path| Change {
            path: PathBuf::from(path),
            kind: ChangeKind::Delete,
        })
        .collect();

    // Second pass: classify the layer's own content.  Only strict
    // descendants count as under an opaque marker; the directory holding
    // the marker is still subject to the copied-up-directory skip below.
    // A root-level marker covers every entry, since the root itself is
    // never walked as an entry.
    for (rel, is_dir) in entries {
        let under_opaque = opaque_dirs
            .iter()
            .any(|d| d.is_empty() || rel.starts_with(&format!("{d}/")));
        let in_parent = !under_opaque
            && parent_layers
                .iter()
                .any(|l| l.join(&rel).symlink_metadata().is_ok());
        if is_dir && in_parent {
            // Copied-up directories are not changes by themselves.
            continue;
        }
        ret.push(Change {
            path: PathBuf::from(format!("/{rel}")),
            kind: if in_parent {
                ChangeKind::Modify
            } else {
                ChangeKind::Add
            },
        });
    }

    // Sorted by path; a deletion sorts before a re-addition of the same
    // name so consumers apply them in a safe order.
    ret.sort_by(|a, b| {
        a.path
            .cmp(&b.path)
            .then_with(|| (b.kind == ChangeKind::Delete).cmp(&(a.kind == ChangeKind::Delete)))
    });
    Ok(ret)
}
