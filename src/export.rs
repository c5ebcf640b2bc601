//! Export a change list as a layer tar stream.

use std::io::Write;
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use fn_error_context::context;
use tracing::instrument;

use crate::changes::{Change, ChangeKind};
use crate::idmap::IdentityMapping;
use crate::pack::{spawn_stream, TarAppender, TarOptions, TarStream};
use crate::whiteout::whiteout_name;
use crate::Result;

/// Produce a layer stream for `changes` against the tree at `dir`:
/// additions and modifications become regular entries read from `dir`,
/// deletions become whiteout markers.
///
/// The change list is sorted by path before emission, so the produced
/// headers are deterministic for a given set of changes regardless of
/// input order.  Must be called within a Tokio runtime.
#[instrument(skip(changes, id_map))]
pub fn export_changes(
    dir: &Path,
    changes: Vec<Change>,
    id_map: &IdentityMapping,
) -> Result<TarStream> {
    let dir = dir.to_path_buf();
    let id_map = id_map.clone();
    Ok(spawn_stream(move |out| {
        export_into(&dir, changes, &id_map, out)
    }))
}

/// Synchronous core of the exporter.
#[context("Exporting changes of {}", dir.display())]
pub(crate) fn export_into(
    dir: &Path,
    mut changes: Vec<Change>,
    id_map: &IdentityMapping,
    out: impl Write,
) -> Result<()> {
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    let options = TarOptions {
        id_map: id_map.clone(),
        ..Default::default()
    };
    let mut appender = TarAppender::new(out, &options);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    for change in changes {
        let rel = relative_change_path(&change)?;
        match change.kind {
            ChangeKind::Delete => {
                let (parent, base) = match rel.rsplit_once('/') {
                    Some((p, b)) => (Some(p), b),
                    None => (None, rel.as_str()),
                };
                let marker = match parent {
                    Some(parent) => format!("{parent}/{}", whiteout_name(base)),
                    None => whiteout_name(base),
                };
                appender.append_marker(&marker, now)?;
            }
            ChangeKind::Add | ChangeKind::Modify => {
                appender.add_entry(&dir.join(&rel), &rel)?;
            }
        }
    }
    appender.finish()?.flush()?;
    Ok(())
}

fn relative_change_path(change: &Change) -> Result<String> {
    let rel: std::path::PathBuf = change
        .path
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    let rel = rel
        .to_str()
        .ok_or_else(|| anyhow!("invalid non-UTF8 change path {:?}", change.path))?;
    if rel.is_empty() {
        return Err(anyhow!("empty change path {:?}", change.path));
    }
    Ok(rel.to_string())
}
