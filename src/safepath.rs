//! Confined path resolution for untrusted archive entry names.
//!
//! Resolution never trusts `realpath`-then-prefix-check: a symlink can be
//! swapped between the check and the use.  Instead paths are resolved
//! component by component below a fixed root, `..` is clamped at that
//! root, and absolute symlink targets restart at the root rather than at
//! `/`.  The final component is deliberately left unresolved so that the
//! result is safe to hand to syscalls which do not themselves follow
//! symlinks (lstat, unlink, symlink and link creation).

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::ArchiveError;
use crate::Result;

/// Upper bound on symlink expansions during one resolution.  The kernel
/// itself gives up at 40 (`ELOOP`); this is intentionally more generous
/// so that deep but legitimate link chains inside images still resolve.
const MAX_SYMLINK_FOLLOWS: u32 = 255;

/// Normalize an entry name to a clean relative path.
///
/// Leading slashes and `.` components are dropped.  `..` components are
/// only accepted while they still have something to cancel against;
/// a name that would climb above the root fails with
/// [`ArchiveError::Breakout`].
pub(crate) fn lexical_relpath(name: &str) -> Result<Utf8PathBuf> {
    let mut ret = Utf8PathBuf::new();
    let mut depth: isize = 0;
    for part in Utf8Path::new(name).components() {
        match part {
            Utf8Component::RootDir | Utf8Component::Prefix(_) | Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(ArchiveError::Breakout {
                        name: name.to_string(),
                    }
                    .into());
                }
                ret.pop();
            }
            Utf8Component::Normal(c) => {
                depth += 1;
                ret.push(c);
            }
        }
    }
    Ok(ret)
}

fn push_components(work: &mut VecDeque<OsString>, path: &Path) {
    // Prepend in order, so the target's own components are walked first.
    for c in path.components().rev() {
        match c {
            Component::Normal(c) => work.push_front(c.to_os_string()),
            Component::ParentDir => work.push_front(OsString::from("..")),
            Component::CurDir => {}
            // Absolute targets are handled by the caller clearing the stack.
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
}

/// Resolve `unsafe_path` below `root`, following symlinks only within the
/// root scope.
///
/// Every intermediate symlink is expanded in place: relative targets are
/// spliced into the remaining components, absolute targets restart the
/// walk at `root`, and `..` never escapes it.  The final component is
/// returned as-is even if it names a symlink, so callers can replace or
/// inspect it without following it.  The result is therefore always a
/// path at or underneath `root`.
pub(crate) fn scoped_join(root: &Path, unsafe_path: &Path) -> Result<PathBuf> {
    let mut work: VecDeque<OsString> = VecDeque::new();
    push_components(&mut work, unsafe_path);

    let mut stack: Vec<OsString> = Vec::new();
    let mut follows = 0u32;
    while let Some(part) = work.pop_front() {
        if part == ".." {
            stack.pop();
            continue;
        }
        let mut candidate = root.to_path_buf();
        candidate.extend(stack.iter());
        candidate.push(&part);
        let meta = match std::fs::symlink_metadata(&candidate) {
            Ok(m) => m,
            // Nonexistent suffixes stay literal; they will be created by
            // the caller below the already-validated prefix.
            Err(_) => {
                stack.push(part);
                continue;
            }
        };
        if meta.file_type().is_symlink() && !work.is_empty() {
            follows += 1;
            if follows > MAX_SYMLINK_FOLLOWS {
                return Err(ArchiveError::TooManySymlinks {
                    path: unsafe_path.to_path_buf(),
                }
                .into());
            }
            let target = std::fs::read_link(&candidate)?;
            if target.is_absolute() {
                stack.clear();
            }
            push_components(&mut work, &target);
        } else {
            stack.push(part);
        }
    }

    let mut ret = root.to_path_buf();
    ret.extend(stack.iter());
    Ok(ret)
}
