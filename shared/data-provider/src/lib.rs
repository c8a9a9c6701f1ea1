mod hub;
mod local;

pub use hub::download_model_repo_sync;
pub use local::{list_repo_dir, resolve_repo_files, ResolveRepoError};
