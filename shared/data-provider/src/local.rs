use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

use crate::download_model_repo_sync;

#[derive(Error, Debug)]
pub enum ResolveRepoError {
    #[error("failed to list model directory {0}: {1}")]
    ReadDir(PathBuf, io::Error),

    #[error("model directory {0} is empty")]
    EmptyDir(PathBuf),

    #[error("failed to download {0} from the hub: {1}")]
    Download(String, hf_hub::api::sync::ApiError),
}

/// Lists the regular files directly inside `dir`, sorted by name.
pub fn list_repo_dir(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, ResolveRepoError> {
    let dir = dir.as_ref();
    let entries =
        std::fs::read_dir(dir).map_err(|e| ResolveRepoError::ReadDir(dir.to_owned(), e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| ResolveRepoError::ReadDir(dir.to_owned(), e))?
            .path();
        if path.is_file() {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(ResolveRepoError::EmptyDir(dir.to_owned()));
    }
    files.sort();
    Ok(files)
}

/// A local directory is used as-is, anything else is treated as a hub repo id
/// and fetched into `cache`.
pub fn resolve_repo_files(
    name_or_path: &str,
    cache: Option<PathBuf>,
    progress_bar: bool,
) -> Result<Vec<PathBuf>, ResolveRepoError> {
    let path = Path::new(name_or_path);
    if path.is_dir() {
        let files = list_repo_dir(path)?;
        info!("Using {} files from {}", files.len(), path.display());
        Ok(files)
    } else {
        download_model_repo_sync(name_or_path, None, cache, None, progress_bar)
            .map_err(|e| ResolveRepoError::Download(name_or_path.to_owned(), e))
    }
}
