//! Typed errors for safety violations and malformed input.
//!
//! Most functions in this crate return [`crate::Result`]; the variants
//! here are the failures callers are expected to distinguish, and can be
//! recovered from an `anyhow::Error` chain via
//! [`anyhow::Error::downcast_ref`].

use std::path::PathBuf;

/// An error materializing or producing an archive.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ArchiveError {
    /// An entry name (or a path derived from one) would resolve outside
    /// the extraction root.
    #[error("archive entry {name:?} is outside of the destination root")]
    Breakout {
        /// The offending entry name as stored in the archive.
        name: String,
    },
    /// A hardlink entry failed validation: the link source must exist,
    /// must be a regular file, and both ends must live inside the
    /// destination root.
    #[error("invalid hardlink {name:?} -> {target:?}: {reason}")]
    InvalidHardlink {
        /// The hardlink entry name.
        name: String,
        /// The link target as stored in the archive.
        target: String,
        /// Which validation failed.
        reason: &'static str,
    },
    /// Symlink expansion exceeded the bounded budget while resolving a
    /// path, which indicates a link loop (or a hostile archive).
    #[error("too many symlinks resolving {path:?}")]
    TooManySymlinks {
        /// The path that was being resolved.
        path: PathBuf,
    },
    /// The destination exists but has the wrong type for the requested
    /// operation.
    #[error("invalid destination {path:?}: {reason}")]
    InvalidDestination {
        /// The destination path.
        path: PathBuf,
        /// Why it cannot be used.
        reason: &'static str,
    },
    /// The source does not exist or cannot be read.
    #[error("invalid source {path:?}")]
    InvalidSource {
        /// The source path.
        path: PathBuf,
    },
    /// The tar stream itself is malformed.
    #[error("malformed archive: {0}")]
    Format(String),
    /// A compressed stream could not be decoded.
    #[error("decompression failed: {0}")]
    Compression(String),
}
