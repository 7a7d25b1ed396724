//! Build output packaging

use std::io::Cursor;
use std::path::Path;

use tracing::debug;

use crate::errors::PlatformError;

const ZSTD_LEVEL: i32 = 3;

pub const CONTENT_TYPE: &str = "application/zstd";

/// Pack the contents of `dir` into a zstd-compressed tarball.
pub async fn pack_dir(dir: &Path) -> Result<Vec<u8>, PlatformError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || pack_dir_sync(&dir))
        .await
        .map_err(|e| PlatformError::Internal(format!("Packaging task failed: {}", e)))?
}

fn pack_dir_sync(dir: &Path) -> Result<Vec<u8>, PlatformError> {
    if !dir.is_dir() {
        return Err(PlatformError::ValidationError(format!(
            "Build output directory {} does not exist",
            dir.display()
        )));
    }

    let encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;
    let bytes = encoder.finish()?;

    debug!(size = bytes.len(), "Packed {}", dir.display());
    Ok(bytes)
}

/// Unpack a tarball produced by [`pack_dir`] into `dest`.
pub async fn unpack(bytes: Vec<u8>, dest: &Path) -> Result<(), PlatformError> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let decoder = zstd::Decoder::new(Cursor::new(bytes))?;
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(&dest)?;
        Ok(())
    })
    .await
    .map_err(|e| PlatformError::Internal(format!("Unpacking task failed: {}", e)))?
}
