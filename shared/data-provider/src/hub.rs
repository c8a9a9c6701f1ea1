use hf_hub::{
    api::sync::{ApiBuilder, ApiError},
    Cache, Repo, RepoType,
};
use std::path::PathBuf;
use tracing::{debug, info};

/// Weights are fetched as safetensors only; configs and tokenizers are json.
const MODEL_FILE_SUFFIXES: [&str; 2] = [".safetensors", ".json"];

fn is_model_file(filename: &str) -> bool {
    MODEL_FILE_SUFFIXES
        .iter()
        .any(|suffix| filename.ends_with(suffix))
}

/// Downloads the safetensors and json files of a model (or adapter) repo,
/// returning their paths in the local cache.
pub fn download_model_repo_sync(
    repo_id: &str,
    revision: Option<String>,
    cache: Option<PathBuf>,
    token: Option<String>,
    progress_bar: bool,
) -> Result<Vec<PathBuf>, ApiError> {
    let cache = cache.map(Cache::new).unwrap_or_default();
    let repo = match revision {
        Some(revision) => Repo::with_revision(repo_id.to_owned(), RepoType::Model, revision),
        None => Repo::model(repo_id.to_owned()),
    };
    let api = ApiBuilder::new()
        .with_cache_dir(cache.path().clone())
        .with_token(token.or_else(|| cache.token()))
        .with_progress(progress_bar)
        .build()?
        .repo(repo);

    let mut filenames = api
        .info()?
        .siblings
        .into_iter()
        .map(|sibling| sibling.rfilename)
        .filter(|filename| is_model_file(filename))
        .collect::<Vec<_>>();
    filenames.sort();
    info!("Fetching {} files of {repo_id}", filenames.len());
    debug!("Files: {filenames:?}");
    filenames.iter().map(|filename| api.get(filename)).collect()
}
