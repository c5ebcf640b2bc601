//! Materialize tar streams onto disk.
//!
//! Every entry path is funneled through the scoped resolver before any
//! filesystem mutation, hardlinks are validated at both ends, and PAX
//! global headers never create anything.  Extraction is not transactional:
//! on error, entries materialized so far are left in place.

use std::collections::HashSet;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::Context as _;
use camino::Utf8Path;
use fn_error_context::context;
use rustix::fs::{FileType, Mode, CWD};
use tracing::{debug, instrument, trace, warn};

use crate::compression::decompress_stream;
use crate::entry::{lutimes, pax_to_xattrs, set_xattr};
use crate::error::ArchiveError;
use crate::pack::TarOptions;
use crate::safepath::{lexical_relpath, scoped_join};
use crate::whiteout::Whiteout;
use crate::Result;

/// Materialize the (possibly compressed) tar stream `src` under `dest`,
/// creating `dest` if needed.
#[instrument(skip(src, options))]
pub fn untar(src: impl Read, dest: &Path, options: &TarOptions) -> Result<()> {
    let src = decompress_stream(src)?;
    unpack(src, dest, None, options, false).map(|_| ())
}

/// Like [`untar`], but the stream must already be raw tar.
pub fn untar_uncompressed(src: impl Read, dest: &Path, options: &TarOptions) -> Result<()> {
    unpack(src, dest, None, options, false).map(|_| ())
}

/// Like [`untar`], with path confinement anchored at `root` rather than
/// at `dest`.  `dest` must be at or below `root`; copy-style callers use
/// this when entry paths may legitimately resolve between the two.
pub fn untar_with_root(
    src: impl Read,
    dest: &Path,
    root: &Path,
    options: &TarOptions,
) -> Result<()> {
    let src = decompress_stream(src)?;
    unpack(src, dest, Some(root), options, false).map(|_| ())
}

/// Shared entry loop for plain extraction and layer application.
/// Returns the cumulative size of materialized regular file content.
#[context("Unpacking to {}", dest.display())]
pub(crate) fn unpack(
    src: impl Read,
    dest: &Path,
    root: Option<&Path>,
    options: &TarOptions,
    whiteouts: bool,
) -> Result<u64> {
    match std::fs::symlink_metadata(dest) {
        Ok(m) if !m.is_dir() => {
            return Err(ArchiveError::InvalidDestination {
                path: dest.to_path_buf(),
                reason: "not a directory",
            }
            .into())
        }
        Ok(_) => {}
        Err(_) => std::fs::create_dir_all(dest)
            .with_context(|| format!("creating {}", dest.display()))?,
    }
    let dest = std::fs::canonicalize(dest)?;
    let root = match root {
        Some(r) => std::fs::canonicalize(r)?,
        None => dest.clone(),
    };
    let base_rel = dest
        .strip_prefix(&root)
        .map_err(|_| ArchiveError::InvalidDestination {
            path: dest.clone(),
            reason: "destination is outside the confinement root",
        })?
        .to_path_buf();

    let mut ctx = UnpackContext {
        root,
        base_rel,
        options,
        whiteouts,
        bytes: 0,
        dir_times: Vec::new(),
        unpacked: HashSet::new(),
    };

    let mut archive = tar::Archive::new(src);
    for entry in archive.entries().context("reading archive")? {
        let mut entry = entry.map_err(map_format_err)?;
        ctx.process_entry(&mut entry)?;
    }

    // Directory mtimes are restored only now; materializing children
    // above kept bumping them.  A later entry may have replaced or
    // deleted the directory, so re-check before touching it.
    for (path, mtime) in &ctx.dir_times {
        match std::fs::symlink_metadata(path) {
            Ok(m) if m.is_dir() => lutimes(path, *mtime, 0)?,
            _ => {}
        }
    }
    Ok(ctx.bytes)
}

fn map_format_err(e: std::io::Error) -> anyhow::Error {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof | ErrorKind::InvalidInput => {
            ArchiveError::Format(e.to_string()).into()
        }
        _ => e.into(),
    }
}

/// Strip root/prefix components so a path can be joined below another.
fn as_relative(p: &Path) -> PathBuf {
    p.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect()
}

struct UnpackContext<'a> {
    /// Confinement root for all path resolution.
    root: PathBuf,
    /// Destination directory, relative to `root`.
    base_rel: PathBuf,
    options: &'a TarOptions,
    whiteouts: bool,
    bytes: u64,
    dir_times: Vec<(PathBuf, i64)>,
    /// Paths materialized by this stream, spared by opaque markers.
    unpacked: HashSet<PathBuf>,
}

impl UnpackContext<'_> {
    fn resolve(&self, rel: &Path) -> Result<PathBuf> {
        scoped_join(&self.root, &self.base_rel.join(rel))
    }

    fn process_entry(&mut self, entry: &mut tar::Entry<impl Read>) -> Result<()> {
        let etype = entry.header().entry_type();
        if etype == tar::EntryType::XGlobalHeader {
            // PAX session metadata; must not create anything on disk.
            trace!("skipping pax global header");
            return Ok(());
        }

        let name = {
            let path = entry.path().map_err(map_format_err)?;
            path.to_str()
                .ok_or_else(|| ArchiveError::Format(format!("non-UTF8 entry name {path:?}")))?
                .to_string()
        };
        let rel = lexical_relpath(&name)?;
        if rel.as_str().is_empty() {
            // The archive root; the destination already exists.
            return Ok(());
        }

        if self.whiteouts {
            let base = rel.file_name().expect("non-empty relative path");
            if let Some(wh) = Whiteout::parse(base) {
                return self.apply_whiteout(&rel, wh);
            }
        }

        let target = self.resolve(rel.as_std_path())?;
        self.create_parents(&target)?;

        // Copy the header fields we need up front; reading the entry body
        // below borrows the entry mutably.
        let hdr = entry.header();
        let mode = hdr.mode().map_err(map_format_err)? & 0o7777;
        let size = hdr.size().map_err(map_format_err)?;
        let mtime = hdr.mtime().map_err(map_format_err)?.min(i64::MAX as u64) as i64;
        let header_uid: u32 = hdr.uid().map_err(map_format_err)?.try_into().context("uid")?;
        let header_gid: u32 = hdr.gid().map_err(map_format_err)?.try_into().context("gid")?;
        let dev_major = hdr.device_major().ok().flatten().unwrap_or(0);
        let dev_minor = hdr.device_minor().ok().flatten().unwrap_or(0);
        let link_name = entry
            .link_name()
            .map_err(map_format_err)?
            .map(|c| c.into_owned());
        let xattrs = pax_to_xattrs(entry)?;

        self.handle_existing(&target, etype)?;

        let materialized = match etype {
            tar::EntryType::Directory => {
                if std::fs::symlink_metadata(&target).is_err() {
                    std::fs::create_dir(&target)
                        .with_context(|| format!("mkdir {}", target.display()))?;
                }
                self.dir_times.push((target.clone(), mtime));
                true
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut f = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&target)
                    .with_context(|| format!("creating {}", target.display()))?;
                std::io::copy(entry, &mut f)
                    .with_context(|| format!("writing {}", target.display()))?;
                self.bytes += size;
                true
            }
            tar::EntryType::Symlink => {
                let link_target = link_name.as_deref().ok_or_else(|| {
                    ArchiveError::Format(format!("symlink entry {name} without target"))
                })?;
                // The target is stored verbatim and never resolved here.
                std::os::unix::fs::symlink(link_target, &target)
                    .with_context(|| format!("symlink {}", target.display()))?;
                true
            }
            tar::EntryType::Link => {
                let link_target = link_name.as_deref().ok_or_else(|| {
                    ArchiveError::Format(format!("hardlink entry {name} without target"))
                })?;
                self.create_hardlink(&name, link_target, &target)?;
                true
            }
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                self.mknod(etype, &target, mode, dev_major, dev_minor)?
            }
            tar::EntryType::XHeader | tar::EntryType::GNULongName | tar::EntryType::GNULongLink => {
                // Metadata for neighboring entries; the reader has already
                // folded these in.
                false
            }
            other => {
                warn!("skipping unsupported entry type {other:?} for {name}");
                false
            }
        };
        if !materialized {
            return Ok(());
        }

        if !self.options.no_lchown {
            let (uid, gid) = if let Some(c) = &self.options.chown_opts {
                (c.uid, c.gid)
            } else {
                self.options.id_map.to_host(header_uid, header_gid)?
            };
            std::os::unix::fs::lchown(&target, Some(uid), Some(gid))
                .with_context(|| format!("lchown {}", target.display()))?;
        }
        for (xname, value) in &xattrs {
            set_xattr(&target, xname, value)?;
        }
        // chmod after chown; changing ownership clears setuid bits.
        if etype != tar::EntryType::Symlink {
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod {}", target.display()))?;
        }
        if etype != tar::EntryType::Directory {
            lutimes(&target, mtime, 0)?;
        }
        self.unpacked.insert(target);
        Ok(())
    }

    /// Synthesize missing parents with the implied directory mode.
    /// Parents that already exist are never modified.
    fn create_parents(&mut self, target: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut cur = target.parent();
        while let Some(dir) = cur {
            if !dir.starts_with(&self.root) || dir == self.root {
                break;
            }
            if std::fs::symlink_metadata(dir).is_ok() {
                break;
            }
            missing.push(dir.to_path_buf());
            cur = dir.parent();
        }
        for dir in missing.iter().rev() {
            std::fs::create_dir(dir).with_context(|| format!("mkdir {}", dir.display()))?;
            std::fs::set_permissions(
                dir,
                std::fs::Permissions::from_mode(self.options.implied_dir_mode()),
            )?;
            // Implied directories belong to the mapped root, not to the
            // entry that forced their creation.
            if let Some(c) = &self.options.chown_opts {
                std::os::unix::fs::lchown(dir, Some(c.uid), Some(c.gid))?;
            } else if !self.options.id_map.is_empty() {
                let (uid, gid) = self.options.id_map.root_pair();
                std::os::unix::fs::lchown(dir, Some(uid), Some(gid))?;
            }
        }
        Ok(())
    }

    /// Clear the way for an incoming entry, honoring the
    /// directory-vs-non-directory overwrite policy.
    fn handle_existing(&self, target: &Path, etype: tar::EntryType) -> Result<()> {
        let Ok(existing) = std::fs::symlink_metadata(target) else {
            return Ok(());
        };
        let entry_is_dir = etype == tar::EntryType::Directory;
        if self.options.no_overwrite_dir_nondir {
            if existing.is_dir() && !entry_is_dir {
                return Err(ArchiveError::InvalidDestination {
                    path: target.to_path_buf(),
                    reason: "refusing to replace directory with non-directory",
                }
                .into());
            }
            if !existing.is_dir() && entry_is_dir {
                return Err(ArchiveError::InvalidDestination {
                    path: target.to_path_buf(),
                    reason: "refusing to replace non-directory with directory",
                }
                .into());
            }
        }
        if existing.is_dir() && entry_is_dir {
            return Ok(());
        }
        if existing.is_dir() {
            std::fs::remove_dir_all(target)?;
        } else {
            std::fs::remove_file(target)?;
        }
        Ok(())
    }

    fn create_hardlink(&self, name: &str, link_target: &Path, target: &Path) -> Result<()> {
        let invalid = |reason| ArchiveError::InvalidHardlink {
            name: name.to_string(),
            target: link_target.display().to_string(),
            reason,
        };
        let source = self.resolve(&as_relative(link_target))?;
        // The source must be a regular file that exists right now; in
        // particular a symlink source would let later writes through the
        // link escape the destination.
        let lmeta =
            std::fs::symlink_metadata(&source).map_err(|_| invalid("link source does not exist"))?;
        if lmeta.file_type().is_symlink() {
            return Err(invalid("link source is a symlink").into());
        }
        if !lmeta.is_file() {
            return Err(invalid("link source is not a regular file").into());
        }
        std::fs::hard_link(&source, target)
            .with_context(|| format!("hardlink {} -> {}", target.display(), source.display()))?;
        Ok(())
    }

    fn mknod(
        &self,
        etype: tar::EntryType,
        target: &Path,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> Result<bool> {
        let ftype = match etype {
            tar::EntryType::Char => FileType::CharacterDevice,
            tar::EntryType::Block => FileType::BlockDevice,
            _ => FileType::Fifo,
        };
        let dev = rustix::fs::makedev(major, minor);
        match rustix::fs::mknodat(CWD, target, ftype, Mode::from_raw_mode(mode), dev) {
            Ok(()) => Ok(true),
            // Device nodes cannot be recreated inside a user namespace.
            Err(rustix::io::Errno::PERM) if !self.options.id_map.is_empty() => {
                debug!("skipping device node {} (unprivileged)", target.display());
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("mknod {}", target.display())),
        }
    }

    fn apply_whiteout(&mut self, rel: &Utf8Path, wh: Whiteout<'_>) -> Result<()> {
        match wh {
            // Reserved marker names carry layer metadata only.
            Whiteout::Meta => Ok(()),
            Whiteout::OpaqueDir => {
                let parent = rel.parent().unwrap_or(Utf8Path::new(""));
                let dir = self.resolve(parent.as_std_path())?;
                self.clear_opaque(&dir)
            }
            Whiteout::Sibling(victim) => {
                let marker = self.resolve(rel.as_std_path())?;
                let parent = marker.parent().expect("resolved path has a parent");
                let victim_path = parent.join(victim);
                if let Ok(m) = std::fs::symlink_metadata(&victim_path) {
                    trace!("whiteout removes {}", victim_path.display());
                    if m.is_dir() {
                        std::fs::remove_dir_all(&victim_path)?;
                    } else {
                        std::fs::remove_file(&victim_path)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Remove everything under `dir` that this stream did not itself
    /// create, making the directory opaque with respect to lower layers.
    fn clear_opaque(&self, dir: &Path) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(it) => it,
            Err(_) => return Ok(()),
        };
        for child in entries {
            let child = child?;
            let path = child.path();
            if self.unpacked.contains(&path) {
                if child.file_type()?.is_dir() {
                    self.clear_opaque(&path)?;
                }
            } else if child.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
