//! Apply layer streams onto an existing tree with whiteout semantics.

use std::io::Read;
use std::path::Path;

use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;
use tracing::instrument;

use crate::compression::decompress_stream;
use crate::pack::TarOptions;
use crate::unpack::unpack;
use crate::Result;

/// Materialize the (possibly compressed) layer stream onto `dest`,
/// interpreting whiteout markers as deletions instead of creating them.
/// Returns the cumulative size of regular file content written.
#[instrument(skip(layer, options))]
pub fn apply_layer(dest: &Path, layer: impl Read, options: &TarOptions) -> Result<u64> {
    let src = decompress_stream(layer)?;
    unpack(src, dest, None, options, true)
}

/// Asynchronous wrapper for [`apply_layer`]; the blocking extraction runs
/// on a dedicated task.
pub async fn apply_layer_async(
    dest: &Path,
    layer: impl AsyncRead + Send + Unpin + 'static,
    options: &TarOptions,
) -> Result<u64> {
    let dest = dest.to_path_buf();
    let options = options.clone();
    spawn_blocking_flatten(move || {
        let layer = SyncIoBridge::new(layer);
        apply_layer(&dest, layer, &options)
    })
    .await
}

/// Run blocking archive work on a dedicated task, folding a panicked or
/// cancelled task into the same error chain as an extraction failure.
async fn spawn_blocking_flatten<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join_err) => Err(anyhow::anyhow!(join_err)),
    }
}
