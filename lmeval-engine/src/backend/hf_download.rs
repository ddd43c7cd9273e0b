//! HuggingFace model download utilities
//!
//! Downloads GGUF weights and tokenizers from HuggingFace Hub and caches them
//! locally (~/.cache/huggingface/hub/).

use crate::error::{EvalError, Result};
use hf_hub::{Repo, RepoType, api::sync::ApiBuilder};
use std::path::PathBuf;

/// Default revision used when none is given.
pub const DEFAULT_REVISION: &str = "main";

/// Download `filename` from a HuggingFace model repository at `revision`.
///
/// Returns the local path to the cached file.
///
/// # Environment Variables
/// * `HF_TOKEN` - HuggingFace API token (required for private repositories)
pub fn download_file(repo_id: &str, revision: &str, filename: &str) -> Result<PathBuf> {
    if repo_id.is_empty() {
        return Err(EvalError::Download("repository id is empty".into()));
    }

    let mut builder = ApiBuilder::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    let api = builder
        .build()
        .map_err(|e| EvalError::Download(e.into()))?;

    let repo = api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    tracing::info!("Downloading {} from {}@{}...", filename, repo_id, revision);

    let path = repo
        .get(filename)
        .map_err(|e| EvalError::Download(e.into()))?;

    tracing::info!("Downloaded to {:?}", path);

    Ok(path)
}

/// Get the local path to `tokenizer.json` for a repository, downloading if necessary.
pub fn get_tokenizer_path(repo_id: &str, revision: &str) -> Result<PathBuf> {
    download_file(repo_id, revision, "tokenizer.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_repo_id_rejected() {
        let result = download_file("", DEFAULT_REVISION, "model.gguf");
        assert!(matches!(result, Err(EvalError::Download(_))));
    }
}
