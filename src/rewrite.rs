//! Rewrite entries while copying a tar stream.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::anyhow;
use fn_error_context::context;

use crate::Result;

/// Rewrites one entry of a tar stream.
///
/// Invoked with the entry's header and content when the entry exists in
/// the source stream, or with neither when it is being created fresh.
/// Returning `None` drops the entry from the output.
pub type TarModifier =
    Box<dyn FnMut(&str, Option<&tar::Header>, Option<Vec<u8>>) -> Result<Option<(tar::Header, Vec<u8>)>> + Send>;

/// Copy the tar stream from `src` to `dest`, passing entries named in
/// `modifiers` through their modifier.  Modifiers whose entry never
/// appears in `src` run at the end with no input, appending new entries.
#[context("Rewriting tar stream")]
pub fn replace_file_tar_wrapper(
    src: impl Read,
    dest: impl Write,
    mut modifiers: BTreeMap<String, TarModifier>,
) -> Result<()> {
    let mut archive = tar::Archive::new(src);
    let mut builder = tar::Builder::new(dest);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = {
            let path = entry.path()?;
            path.to_str()
                .ok_or_else(|| anyhow!("invalid non-UTF8 entry name {path:?}"))?
                .trim_end_matches('/')
                .to_string()
        };
        if let Some(mut modifier) = modifiers.remove(&name) {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            let header = entry.header().clone();
            if let Some((mut h, data)) = modifier(&name, Some(&header), Some(content))? {
                h.set_size(data.len() as u64);
                builder.append_data(&mut h, &name, data.as_slice())?;
            }
            continue;
        }
        copy_entry(entry, &mut builder)?;
    }

    // Remaining modifiers create entries that had no counterpart.
    for (name, mut modifier) in modifiers {
        if let Some((mut h, data)) = modifier(&name, None, None)? {
            h.set_size(data.len() as u64);
            builder.append_data(&mut h, &name, data.as_slice())?;
        }
    }
    builder.into_inner()?.flush()?;
    Ok(())
}

/// Copy a tar entry to a new tar archive unchanged, including its PAX
/// extension records.
pub(crate) fn copy_entry(
    mut entry: tar::Entry<impl Read>,
    dest: &mut tar::Builder<impl Write>,
) -> Result<()> {
    // Make copies of both the header and path, since that's required for
    // the append APIs.
    let path = (*entry.path()?).to_owned();
    let mut header = entry.header().clone();
    if let Some(records) = entry.pax_extensions()? {
        let records = records
            .map(|r| {
                let r = r?;
                Ok((r.key()?, r.value_bytes()))
            })
            .collect::<Result<Vec<_>>>()?;
        dest.append_pax_extensions(records.as_slice().iter().copied())?;
    }

    // Use the entry link_name() rather than the header one, as only the
    // former handles the long-name extensions.
    match entry.header().entry_type() {
        tar::EntryType::Link | tar::EntryType::Symlink => {
            let target = entry
                .link_name()?
                .ok_or_else(|| anyhow!("link entry without a target"))?
                .into_owned();
            dest.append_link(&mut header, path, target)
        }
        _ => dest.append_data(&mut header, path, entry),
    }
    .map_err(Into::into)
}
