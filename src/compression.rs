//! Compressed byte-stream detection and wrapping.

use std::io::{Chain, Cursor, Read, Write};
use std::path::Path;

use anyhow::Context;

use crate::error::ArchiveError;
use crate::Result;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// The compression applied around a tar stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// No compression; the raw tar stream.
    #[default]
    None,
    /// gzip (RFC 1952).
    Gzip,
    /// bzip2.
    Bzip2,
    /// xz / LZMA2.
    Xz,
    /// zstandard.
    Zstd,
}

impl Compression {
    /// Identify a compression format from the leading bytes of a stream.
    /// Anything unrecognized is treated as an uncompressed stream.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if magic.starts_with(BZIP2_MAGIC) {
            Compression::Bzip2
        } else if magic.starts_with(XZ_MAGIC) {
            Compression::Xz
        } else if magic.starts_with(ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// The conventional file extension, without a leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "tar",
            Compression::Gzip => "tar.gz",
            Compression::Bzip2 => "tar.bz2",
            Compression::Xz => "tar.xz",
            Compression::Zstd => "tar.zst",
        }
    }
}

/// A reader re-joined with the bytes that were consumed to sniff it.
type Rejoined<R> = Chain<Cursor<Vec<u8>>, R>;

fn rejoin<R: Read>(mut src: R) -> std::io::Result<(Compression, Rejoined<R>)> {
    // Sniff just enough bytes for the longest magic, then put them back
    // in front so the decoder sees the original byte order.
    let mut head = [0u8; 6];
    let mut filled = 0;
    while filled < head.len() {
        let n = src.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let head = head[..filled].to_vec();
    let compression = Compression::detect(&head);
    Ok((compression, Cursor::new(head).chain(src)))
}

/// Wrap `src` with a decompressor chosen by sniffing its magic bytes.
/// Streams in an unrecognized format pass through unchanged.
pub(crate) fn decompress_stream<'a, R: Read + 'a>(src: R) -> Result<Box<dyn Read + 'a>> {
    let (compression, src) = rejoin(src)?;
    tracing::trace!("detected input compression: {compression:?}");
    let r: Box<dyn Read> = match compression {
        Compression::None => Box::new(src),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(src)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(src)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(src)),
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::new(src)
                .map_err(|e| ArchiveError::Compression(e.to_string()))?,
        ),
    };
    Ok(r)
}

/// A compressing writer which must be finalized with
/// [`Compressor::finish`] so codec trailers reach the inner writer.
pub(crate) enum Compressor<W: Write> {
    None(W),
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Xz(xz2::write::XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Compressor<W> {
    pub(crate) fn new(dest: W, compression: Compression) -> Result<Self> {
        Ok(match compression {
            Compression::None => Compressor::None(dest),
            Compression::Gzip => Compressor::Gzip(flate2::write::GzEncoder::new(
                dest,
                flate2::Compression::default(),
            )),
            Compression::Bzip2 => Compressor::Bzip2(bzip2::write::BzEncoder::new(
                dest,
                bzip2::Compression::default(),
            )),
            Compression::Xz => Compressor::Xz(xz2::write::XzEncoder::new(dest, 6)),
            Compression::Zstd => Compressor::Zstd(
                zstd::stream::write::Encoder::new(dest, 0)
                    .map_err(|e| ArchiveError::Compression(e.to_string()))?,
            ),
        })
    }

    pub(crate) fn finish(self) -> std::io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::Gzip(w) => w.finish(),
            Compressor::Bzip2(w) => w.finish(),
            Compressor::Xz(w) => w.finish(),
            Compressor::Zstd(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Compressor::None(w) => w.write(buf),
            Compressor::Gzip(w) => w.write(buf),
            Compressor::Bzip2(w) => w.write(buf),
            Compressor::Xz(w) => w.write(buf),
            Compressor::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Compressor::None(w) => w.flush(),
            Compressor::Gzip(w) => w.flush(),
            Compressor::Bzip2(w) => w.flush(),
            Compressor::Xz(w) => w.flush(),
            Compressor::Zstd(w) => w.flush(),
        }
    }
}

/// Whether `path` names a (possibly compressed) tar archive, decided by
/// successfully reading its first entry header.
pub fn is_archive_path(path: impl AsRef<Path>) -> bool {
    fn inner(path: &Path) -> Result<bool> {
        let f = std::fs::File::open(path).context("opening archive")?;
        let src = decompress_stream(f)?;
        let mut archive = ::tar::Archive::new(src);
        let mut entries = archive.entries()?;
        Ok(matches!(entries.next(), Some(Ok(_))))
    }
    inner(path.as_ref()).unwrap_or(false)
}
