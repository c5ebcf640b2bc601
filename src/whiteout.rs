//! Whiteout naming conventions for layered filesystems.

/// Prefix marking a sibling as deleted in this layer: a file named
/// `.wh.foo` in a directory deletes the sibling `foo`.
pub(crate) const WHITEOUT_PREFIX: &str = ".wh.";

/// Prefix reserved for implementation markers; entries with this prefix
/// carry layer metadata and are never materialized.
pub(crate) const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Marker making the containing directory opaque: contents inherited
/// from lower layers are discarded before this layer's own entries.
pub(crate) const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

/// Classification of an entry basename under the whiteout conventions.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Whiteout<'a> {
    /// `.wh..wh..opq`: the parent directory is opaque.
    OpaqueDir,
    /// Other `.wh..wh.*` names: internal metadata, skip.
    Meta,
    /// `.wh.<name>`: delete the sibling `<name>`.
    Sibling(&'a str),
}

impl<'a> Whiteout<'a> {
    /// Classify `basename` if it is a whiteout marker.
    pub(crate) fn parse(basename: &'a str) -> Option<Self> {
        if basename == WHITEOUT_OPAQUE_DIR {
            Some(Whiteout::OpaqueDir)
        } else if basename.starts_with(WHITEOUT_META_PREFIX) {
            Some(Whiteout::Meta)
        } else {
            basename.strip_prefix(WHITEOUT_PREFIX).map(Whiteout::Sibling)
        }
    }
}

/// The whiteout name deleting `basename`.
pub(crate) fn whiteout_name(basename: &str) -> String {
    format!("{WHITEOUT_PREFIX}{basename}")
}
