//! Spool a stream into anonymous temporary storage for replay.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::Context as _;

use crate::Result;

/// An archive buffered in an unlinked temporary file.
///
/// Useful when a producer must be drained promptly (e.g. to release a
/// connection) while the consumer wants to read at its own pace.  The
/// backing file is already unlinked, so it is reclaimed exactly once no
/// matter how often [`TempArchive::close`] is called or when the value
/// is dropped.
pub struct TempArchive {
    inner: Option<File>,
    size: u64,
}

impl TempArchive {
    /// Drain `src` into a fresh temporary file under `dir` (or the
    /// system temporary directory) and return a reader over the copy.
    pub fn new(mut src: impl Read, dir: Option<&Path>) -> Result<Self> {
        let mut f = match dir {
            Some(d) => tempfile::tempfile_in(d),
            None => tempfile::tempfile(),
        }
        .context("creating temporary archive file")?;
        let size = std::io::copy(&mut src, &mut f).context("spooling archive")?;
        f.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner: Some(f),
            size,
        })
    }

    /// Total number of spooled bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Release the backing file.  Safe to call any number of times.
    pub fn close(&mut self) -> Result<()> {
        self.inner.take();
        Ok(())
    }
}

impl Read for TempArchive {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            Some(f) => f.read(buf),
            None => Ok(0),
        }
    }
}
