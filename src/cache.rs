//! Save and restore of [`ScannerState`] across restarts.
//!
//! The file is plain JSON, rewritten wholesale on every save through a
//! sibling temp file and a rename.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::types::ScannerState;

/// Read a snapshot. A missing file yields an empty state.
pub async fn load(path: impl AsRef<Path>) -> Result<ScannerState> {
    let path = path.as_ref();
    let bytes = match fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ScannerState::default()),
        Err(source) => {
            return Err(Error::CacheLoad {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| Error::CacheLoad {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })
}

/// Load a snapshot, logging and falling back to an empty state on failure.
pub async fn restore_or_empty(path: impl AsRef<Path>) -> ScannerState {
    let path = path.as_ref();
    match load(path).await {
        Ok(state) => {
            info!(
                path = %path.display(),
                addresses = state.results.len(),
                "restored state from cache"
            );
            state
        }
        Err(e) => {
            error!("failed to load portscan cache: {e}");
            ScannerState::default()
        }
    }
}

/// Write a snapshot, replacing any previous file at `path`.
pub async fn save(path: impl AsRef<Path>, state: &ScannerState) -> Result<()> {
    let path = path.as_ref();
    let save_err = |source: io::Error| Error::CacheSave {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| save_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(save_err)?;
    }
    let tmp = temp_path(path);
    fs::write(&tmp, &json).await.map_err(save_err)?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(save_err(e));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "portscan-cache".into());
    name.push(".tmp");
    path.with_file_name(name)
}
