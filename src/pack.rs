//! Produce layer tarballs from directory trees.
//!
//! The walker runs on a blocking task and feeds the caller through a
//! bounded channel, so the caller just sees an ordinary read-to-EOF byte
//! stream.  Dropping the stream before EOF closes the channel, which
//! terminates the walker on its next write.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use anyhow::anyhow;
use camino::Utf8PathBuf;
use fn_error_context::context;
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};
use walkdir::WalkDir;

use crate::compression::{Compression, Compressor};
use crate::entry::{canonical_tar_name, populate_header, read_xattrs, xattrs_to_pax};
use crate::error::ArchiveError;
use crate::idmap::{ChownOpts, IdentityMapping};
use crate::Result;

/// Options controlling how archives are produced and materialized.
#[derive(Debug, Clone, Default)]
pub struct TarOptions {
    /// Compression applied around the produced tar stream; detected from
    /// magic bytes when consuming.
    pub compression: Compression,
    /// When non-empty, only these paths (relative to the source root) and
    /// their descendants are packed.
    pub include_files: Vec<String>,
    /// Gitignore-style patterns matched against relative paths; matching
    /// entries are excluded unless re-admitted by a `!` pattern.
    pub exclude_patterns: Vec<String>,
    /// Prefix renames applied to entry names at pack time: an entry whose
    /// relative path starts with a key is emitted with that prefix
    /// replaced by the mapped value.
    pub rebase_names: BTreeMap<String, String>,
    /// Forced ownership for every entry; wins over `id_map` and over the
    /// source metadata.
    pub chown_opts: Option<ChownOpts>,
    /// ID translation applied to entry ownership.
    pub id_map: IdentityMapping,
    /// Skip ownership restoration entirely when materializing.
    pub no_lchown: bool,
    /// Refuse to replace a directory with a non-directory (and the
    /// converse) when materializing.
    pub no_overwrite_dir_nondir: bool,
    /// Mode for directories synthesized because an entry appeared without
    /// its parents; defaults to `0o755`.
    pub implied_directory_mode: Option<u32>,
}

impl TarOptions {
    pub(crate) fn implied_dir_mode(&self) -> u32 {
        self.implied_directory_mode.unwrap_or(0o755)
    }
}

/// A produced archive byte stream; read to EOF to drain it.
///
/// Errors from the background walker surface on the read that would
/// otherwise cross them.  Dropping the stream cancels the walker.
#[derive(Debug)]
pub struct TarStream {
    rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl AsyncRead for TarStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.chunk.len() {
                let n = buf.remaining().min(this.chunk.len() - this.pos);
                buf.put_slice(&this.chunk[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => {
                    this.chunk = chunk;
                    this.pos = 0;
                }
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// The write half of a [`TarStream`]; lives on the walker task.
pub(crate) struct ChannelWriter {
    tx: mpsc::Sender<std::io::Result<Vec<u8>>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(buf.to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream was dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Spawn `produce` on a blocking task, returning the stream it writes to.
pub(crate) fn spawn_stream<F>(produce: F) -> TarStream
where
    F: FnOnce(ChannelWriter) -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(8);
    let errtx = tx.clone();
    let _task = tokio::task::spawn_blocking(move || {
        if let Err(e) = produce(ChannelWriter { tx }) {
            debug!("archive production failed: {e:#}");
            // A send failure here means the consumer went away first, in
            // which case there is nobody left to tell.
            let _ = errtx.blocking_send(Err(std::io::Error::other(format!("{e:#}"))));
        }
    });
    TarStream {
        rx,
        chunk: Vec::new(),
        pos: 0,
    }
}

/// Pack `path` with default options and the given compression.
pub fn tar(path: &Path, compression: Compression) -> Result<TarStream> {
    tar_with_options(
        path,
        &TarOptions {
            compression,
            ..Default::default()
        },
    )
}

/// Pack the file or directory tree at `path` into a tar stream.
///
/// Must be called within a Tokio runtime; the filesystem walk happens on
/// a blocking task while the returned stream is consumed.
#[instrument(skip(options))]
pub fn tar_with_options(path: &Path, options: &TarOptions) -> Result<TarStream> {
    // Fail obvious misuse before handing out a stream.
    if std::fs::symlink_metadata(path).is_err() {
        return Err(ArchiveError::InvalidSource {
            path: path.to_path_buf(),
        }
        .into());
    }
    let path = path.to_path_buf();
    let options = options.clone();
    Ok(spawn_stream(move |out| pack_into(&path, &options, out)))
}

/// Synchronous core of the packer: walk `src_path` and write the
/// (optionally compressed) archive into `dest`.
#[context("Packing {}", src_path.display())]
pub fn pack_into(src_path: &Path, options: &TarOptions, dest: impl Write) -> Result<()> {
    let meta = std::fs::symlink_metadata(src_path).map_err(|_| ArchiveError::InvalidSource {
        path: src_path.to_path_buf(),
    })?;
    let out = Compressor::new(dest, options.compression)?;
    let mut appender = TarAppender::new(out, options);

    if meta.is_dir() {
        pack_directory(src_path, options, &mut appender)?;
    } else {
        let name = src_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid source file name {:?}", src_path))?;
        let name = rebase_name(&options.rebase_names, name).unwrap_or_else(|| name.to_string());
        appender.add_entry(src_path, &name)?;
    }

    let out = appender.finish()?;
    out.finish()?.flush()?;
    Ok(())
}

fn pack_directory<W: Write>(
    src: &Path,
    options: &TarOptions,
    appender: &mut TarAppender<W>,
) -> Result<()> {
    let matcher = PatternMatcher::new(&options.exclude_patterns)?;
    let includes: Vec<&str> = if options.include_files.is_empty() {
        vec![""]
    } else {
        options.include_files.iter().map(|s| s.as_str()).collect()
    };
    let mut emitted: HashSet<String> = HashSet::new();

    for include in includes {
        let walk_root = if include.is_empty() {
            src.to_path_buf()
        } else {
            src.join(include)
        };
        let mut it = WalkDir::new(&walk_root).sort_by_file_name().into_iter();
        while let Some(dent) = it.next() {
            let dent = match dent {
                Ok(d) => d,
                // The source tree may be mutating underneath us; a node
                // that vanished between listing and stat is not fatal.
                Err(e) => {
                    warn!("cannot stat source entry: {e}");
                    continue;
                }
            };
            let rel = dent
                .path()
                .strip_prefix(src)
                .expect("walk stays under the source root");
            if rel.as_os_str().is_empty() {
                continue;
            }
            let rel = rel
                .to_str()
                .ok_or_else(|| anyhow!("invalid non-UTF8 path {:?}", dent.path()))?;
            let is_dir = dent.file_type().is_dir();
            // The include root itself bypasses the exclusion patterns.
            if rel != include && matcher.is_excluded(rel, is_dir) {
                trace!("excluding {rel}");
                if is_dir {
                    // Children can only survive if a `!` pattern could
                    // re-admit them.
                    if !matcher.has_rescue_patterns() {
                        it.skip_current_dir();
                    }
                }
                continue;
            }
            if !emitted.insert(rel.to_string()) {
                continue;
            }
            let name = rebase_name(&options.rebase_names, rel).unwrap_or_else(|| rel.to_string());
            if let Err(e) = appender.add_entry(dent.path(), &name) {
                if !entry_error_is_skippable(&e) {
                    return Err(e);
                }
                warn!("skipping {}: {e:#}", dent.path().display());
            }
        }
    }
    Ok(())
}

/// Losing a race against concurrent source mutation only costs us that
/// entry; nothing has been written for it yet at the point these arise.
fn entry_error_is_skippable(e: &anyhow::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.downcast_ref::<std::io::Error>().map(|e| e.kind()),
        Some(ErrorKind::NotFound | ErrorKind::PermissionDenied)
    )
}

fn rebase_name(rebases: &BTreeMap<String, String>, rel: &str) -> Option<String> {
    for (prefix, replacement) in rebases {
        if rel == prefix {
            return Some(replacement.clone());
        }
        if let Some(rest) = rel.strip_prefix(prefix.as_str()) {
            if let Some(rest) = rest.strip_prefix('/') {
                return Some(format!("{replacement}/{rest}"));
            }
        }
    }
    None
}

struct PatternMatcher {
    entries: Vec<MatchEntry>,
    rescues: bool,
}

impl PatternMatcher {
    fn new(patterns: &[String]) -> Result<Self> {
        let mut entries = Vec::with_capacity(patterns.len());
        let mut rescues = false;
        for pattern in patterns {
            let (ty, pattern) = match pattern.strip_prefix('!') {
                Some(p) => {
                    rescues = true;
                    (MatchType::Include, p)
                }
                None => (MatchType::Exclude, pattern.as_str()),
            };
            entries.push(MatchEntry::parse_pattern(
                pattern,
                PatternFlag::PATH_NAME,
                ty,
            )?);
        }
        Ok(Self { entries, rescues })
    }

    fn has_rescue_patterns(&self) -> bool {
        self.rescues
    }

    fn is_excluded(&self, rel: &str, is_dir: bool) -> bool {
        let file_mode = if is_dir { 0o040000 } else { 0o100000 };
        self.entries.as_slice().matches(rel.as_bytes(), Some(file_mode)) == Some(MatchType::Exclude)
    }
}

/// Streams entries into a `tar::Builder`, deduplicating hardlinks by
/// `(device, inode)`: the first occurrence in walk order becomes the full
/// entry, later ones become link entries pointing back at it.
pub(crate) struct TarAppender<W: Write> {
    builder: tar::Builder<W>,
    hardlinks: HashMap<(u64, u64), Utf8PathBuf>,
    chown_opts: Option<ChownOpts>,
    id_map: IdentityMapping,
}

impl<W: Write> TarAppender<W> {
    pub(crate) fn new(out: W, options: &TarOptions) -> Self {
        Self {
            builder: tar::Builder::new(out),
            hardlinks: HashMap::new(),
            chown_opts: options.chown_opts,
            id_map: options.id_map.clone(),
        }
    }

    /// Append the filesystem node at `disk_path` under the logical name
    /// `name` (relative, forward slashes).
    pub(crate) fn add_entry(&mut self, disk_path: &Path, name: &str) -> Result<()> {
        let meta = std::fs::symlink_metadata(disk_path)?;
        let ft = meta.file_type();
        if ft.is_socket() {
            debug!("skipping socket {}", disk_path.display());
            return Ok(());
        }
        let name = Utf8PathBuf::from(canonical_tar_name(name, ft.is_dir()));

        let mut h = tar::Header::new_gnu();
        populate_header(&mut h, &meta);
        let (uid, gid) = match self.chown_opts {
            Some(c) => (c.uid, c.gid),
            None => self.id_map.to_container(meta.uid(), meta.gid())?,
        };
        h.set_uid(uid.into());
        h.set_gid(gid.into());

        if ft.is_file() && meta.nlink() > 1 {
            let key = (meta.dev(), meta.ino());
            if let Some(first) = self.hardlinks.get(&key) {
                h.set_entry_type(tar::EntryType::Link);
                h.set_size(0);
                self.builder.append_link(&mut h, &name, first)?;
                return Ok(());
            }
            self.hardlinks.insert(key, name.clone());
        }

        let xattrs = if ft.is_file() || ft.is_dir() || ft.is_symlink() {
            read_xattrs(disk_path)?
        } else {
            Vec::new()
        };
        if !xattrs.is_empty() {
            let pax = xattrs_to_pax(&xattrs);
            self.builder
                .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))?;
        }

        if ft.is_dir() {
            h.set_entry_type(tar::EntryType::Directory);
            self.builder.append_data(&mut h, &name, std::io::empty())?;
        } else if ft.is_symlink() {
            let target = std::fs::read_link(disk_path)?;
            h.set_entry_type(tar::EntryType::Symlink);
            self.builder.append_link(&mut h, &name, &target)?;
        } else if ft.is_file() {
            h.set_entry_type(tar::EntryType::Regular);
            h.set_size(meta.len());
            let src = File::open(disk_path)?;
            self.builder.append_data(&mut h, &name, src)?;
        } else if ft.is_char_device() || ft.is_block_device() {
            h.set_entry_type(if ft.is_char_device() {
                tar::EntryType::Char
            } else {
                tar::EntryType::Block
            });
            h.set_device_major(rustix::fs::major(meta.rdev()))?;
            h.set_device_minor(rustix::fs::minor(meta.rdev()))?;
            self.builder.append_data(&mut h, &name, std::io::empty())?;
        } else if ft.is_fifo() {
            h.set_entry_type(tar::EntryType::Fifo);
            self.builder.append_data(&mut h, &name, std::io::empty())?;
        } else {
            debug!("skipping unsupported file type at {}", disk_path.display());
        }
        Ok(())
    }

    /// Append a zero-length marker entry, as used for whiteouts in
    /// exported layers.
    pub(crate) fn append_marker(&mut self, name: &str, mtime: u64) -> Result<()> {
        let mut h = tar::Header::new_gnu();
        h.set_entry_type(tar::EntryType::Regular);
        h.set_size(0);
        h.set_mode(0o600);
        h.set_mtime(mtime);
        h.set_uid(0);
        h.set_gid(0);
        self.builder
            .append_data(&mut h, name, std::io::empty())?;
        Ok(())
    }

    /// Write the archive trailer and return the underlying writer.
    pub(crate) fn finish(self) -> Result<W> {
        Ok(self.builder.into_inner()?)
    }
}
