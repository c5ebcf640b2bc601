//! # Container image layer archives
//!
//! This crate serializes directory trees into tar streams following the
//! conventions used by container image layers, and materializes such
//! streams back onto disk.  That includes whiteout markers for deletions,
//! opaque directory markers, hardlink preservation, extended attributes,
//! device nodes, and user-namespace ID remapping, together with change
//! detection between two directory trees and export/apply of the
//! resulting layer deltas.
//!
//! Extraction is hardened against hostile archives: entry paths are
//! confined to the destination root, symlinks are resolved inside a
//! bounded scope, and hardlinks may only point at regular files that
//! themselves live inside the destination.

#![deny(missing_docs)]
// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

/// Our generic catchall fatal error, expected to be converted
/// to a string to output to a terminal or logs.
pub type Result<T> = anyhow::Result<T>;

pub mod apply;
pub mod changes;
pub mod compression;
mod entry;
pub mod error;
pub mod export;
pub mod idmap;
pub mod pack;
pub mod rewrite;
mod safepath;
pub mod tmparchive;
pub mod unpack;
mod whiteout;

pub use apply::{apply_layer, apply_layer_async};
pub use changes::{changes, changes_dirs, Change, ChangeKind};
pub use compression::{is_archive_path, Compression};
pub use error::ArchiveError;
pub use export::export_changes;
pub use idmap::{ChownOpts, IdMap, IdentityMapping};
pub use pack::{tar, tar_with_options, TarOptions, TarStream};
pub use rewrite::{replace_file_tar_wrapper, TarModifier};
pub use tmparchive::TempArchive;
pub use unpack::{untar, untar_uncompressed, untar_with_root};
