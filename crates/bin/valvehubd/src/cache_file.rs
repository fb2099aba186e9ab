//! JSON persistence of the cached status between runs.

use std::path::Path;

use valvehub_domain::cache::CachedStatus;

#[derive(Debug, thiserror::Error)]
pub enum CacheFileError {
    #[error("failed to access cache file")]
    Io(#[from] std::io::Error),

    #[error("cache file is not valid JSON")]
    Json(#[from] serde_json::Error),
}

/// Read a saved cache. A missing file is an empty cache.
///
/// # Errors
///
/// Returns [`CacheFileError`] if the file exists but cannot be read or
/// parsed.
pub async fn load(path: &Path) -> Result<Option<CachedStatus>, CacheFileError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// # Errors
///
/// Returns [`CacheFileError::Io`] if the file cannot be written.
pub async fn save(path: &Path, cache: &CachedStatus) -> Result<(), CacheFileError> {
    let json = serde_json::to_vec_pretty(cache)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
