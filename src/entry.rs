//! Mapping between on-disk file metadata and tar header fields.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::Context;
use rustix::fs::{AtFlags, Timespec, Timestamps, XattrFlags, CWD};

use crate::Result;

/// PAX record key prefix carrying extended attributes, as written by star
/// and GNU tar.  The capability xattr rides on this as
/// `SCHILY.xattr.security.capability`.
pub(crate) const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

/// Canonicalize a logical entry name: forward-slash separators, no
/// leading slash, directories carrying a trailing slash.
pub(crate) fn canonical_tar_name(name: &str, is_dir: bool) -> String {
    let name = name.trim_start_matches('/');
    if is_dir && !name.ends_with('/') {
        format!("{name}/")
    } else {
        name.to_string()
    }
}

/// Permission bits recorded for an entry.  On Unix sources these are
/// preserved verbatim, including setuid/setgid/sticky.
pub(crate) fn chmod_tar_entry(perm: u32) -> u32 {
    perm & 0o7777
}

/// Fill the ownership-independent header fields from `meta`.
pub(crate) fn populate_header(h: &mut tar::Header, meta: &Metadata) {
    h.set_mode(chmod_tar_entry(meta.mode()));
    // Clamp pre-epoch timestamps; the ustar mtime field is unsigned.
    h.set_mtime(meta.mtime().max(0) as u64);
    h.set_size(0);
}

/// List and fetch the extended attributes of `path` without following a
/// final symlink.  Filesystems without xattr support yield an empty list.
pub(crate) fn read_xattrs(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let names = match xattr_call(|buf| rustix::fs::llistxattr(path, buf)) {
        Ok(names) => names,
        Err(rustix::io::Errno::OPNOTSUPP) => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("llistxattr {path:?}")),
    };
    let mut ret = Vec::new();
    for name in names.split(|&b| b == 0).filter(|n| !n.is_empty()) {
        let name = std::str::from_utf8(name).context("non-UTF8 xattr name")?;
        match xattr_call(|buf| rustix::fs::lgetxattr(path, name, buf)) {
            Ok(value) => ret.push((name.to_string(), value)),
            // The attribute vanished between list and fetch
            Err(rustix::io::Errno::NODATA) => continue,
            Err(e) => return Err(e).with_context(|| format!("lgetxattr {name} on {path:?}")),
        }
    }
    Ok(ret)
}

/// Set one extended attribute, not following a final symlink.
pub(crate) fn set_xattr(path: &Path, name: &str, value: &[u8]) -> Result<()> {
    rustix::fs::lsetxattr(path, name, value, XattrFlags::empty())
        .with_context(|| format!("lsetxattr {name} on {path:?}"))
}

/// Probe-then-fetch pattern for the variable-size xattr syscalls,
/// retrying when the value grows between the two calls.
fn xattr_call(
    mut f: impl FnMut(&mut [u8]) -> rustix::io::Result<usize>,
) -> rustix::io::Result<Vec<u8>> {
    loop {
        let size = f(&mut [])?;
        let mut buf = vec![0u8; size];
        match f(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(rustix::io::Errno::RANGE) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Convert an xattr list into the PAX records announcing them for the
/// following entry.
pub(crate) fn xattrs_to_pax(xattrs: &[(String, Vec<u8>)]) -> Vec<(String, Vec<u8>)> {
    xattrs
        .iter()
        .map(|(name, value)| (format!("{PAX_SCHILY_XATTR}{name}"), value.clone()))
        .collect()
}

/// Extract the xattrs carried by an entry's PAX records, if any.
pub(crate) fn pax_to_xattrs<R: std::io::Read>(
    entry: &mut tar::Entry<R>,
) -> Result<Vec<(String, Vec<u8>)>> {
    let mut ret = Vec::new();
    if let Some(records) = entry.pax_extensions()? {
        for record in records {
            let record = record?;
            let Ok(key) = record.key() else { continue };
            if let Some(name) = key.strip_prefix(PAX_SCHILY_XATTR) {
                ret.push((name.to_string(), record.value_bytes().to_vec()));
            }
        }
    }
    Ok(ret)
}

/// Set access and modification times without following a final symlink.
pub(crate) fn lutimes(path: &Path, secs: i64, nsecs: i64) -> Result<()> {
    let ts = Timespec {
        tv_sec: secs,
        tv_nsec: nsecs,
    };
    rustix::fs::utimensat(
        CWD,
        path,
        &Timestamps {
            last_access: ts,
            last_modification: ts,
        },
        AtFlags::SYMLINK_NOFOLLOW,
    )
    .with_context(|| format!("utimensat {path:?}"))
}
