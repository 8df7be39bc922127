//! The git source provider.
//!
//! Identical to the local provider, preceded by a content-addressed shallow
//! clone into the cache directory. The cache key is the first 16 hex chars
//! of the SHA-256 of the repository URL, so every run of the same repo
//! shares one clone.

use super::{local, PreparedSource, SourceProvider, SuiteSourceDescriptor};
use crate::{config::GitSourceConfig, util::run_cmd};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// The git source provider.
#[derive(Debug, Clone)]
pub(crate) struct GitSource {
    config: GitSourceConfig,
    filter: Option<String>,
    cache_root: PathBuf,
}

impl GitSource {
    /// Creates a provider that clones into `cache_root`.
    pub(crate) fn new(config: GitSourceConfig, filter: Option<String>, cache_root: PathBuf) -> Self {
        Self {
            config,
            filter,
            cache_root,
        }
    }

    /// The content-addressed clone path for this repository.
    pub(crate) fn clone_path(&self) -> PathBuf {
        self.cache_root.join("git").join(repo_cache_key(&self.config.repo))
    }

    /// Clones or updates the cached checkout at the configured ref.
    async fn sync_repo(&self) -> Result<PathBuf> {
        let clone_path = self.clone_path();

        if !clone_path.exists() {
            info!(target: "source", "cloning {} into {}", self.config.repo, clone_path.display());
            run_cmd(
                Command::new("git")
                    .arg("clone")
                    .arg("--depth")
                    .arg("1")
                    .arg("--no-checkout")
                    .arg(&self.config.repo)
                    .arg(&clone_path),
                "git clone",
            )
            .await?;
        } else {
            debug!(target: "source", "reusing cached clone at {}", clone_path.display());
        }

        run_cmd(
            Command::new("git")
                .arg("fetch")
                .arg("--depth")
                .arg("1")
                .arg("origin")
                .arg(&self.config.reference)
                .current_dir(&clone_path),
            "git fetch",
        )
        .await?;
        run_cmd(
            Command::new("git")
                .arg("checkout")
                .arg("--force")
                .arg("FETCH_HEAD")
                .current_dir(&clone_path),
            "git checkout",
        )
        .await?;

        Ok(clone_path)
    }
}

#[async_trait::async_trait]
impl SourceProvider for GitSource {
    async fn prepare(&mut self) -> Result<PreparedSource> {
        let clone_path = self.sync_repo().await?;
        local::prepare_from_directory(
            &clone_path,
            &self.config.pre_run_steps,
            &self.config.steps,
            self.filter.as_deref(),
        )
    }

    fn cleanup(&mut self) -> Result<()> {
        // The clone is a shared content-addressed cache; it outlives runs.
        Ok(())
    }

    fn source_info(&self) -> SuiteSourceDescriptor {
        SuiteSourceDescriptor::Git {
            repo: self.config.repo.clone(),
            reference: self.config.reference.clone(),
        }
    }
}

/// The cache key for a repository URL.
fn repo_cache_key(repo_url: &str) -> String {
    let digest = Sha256::digest(repo_url.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_and_url_sensitive() {
        let a = repo_cache_key("https://github.com/ethpandaops/suites.git");
        let b = repo_cache_key("https://github.com/ethpandaops/suites.git");
        let c = repo_cache_key("https://github.com/ethpandaops/other.git");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn clone_path_is_under_the_cache_root() {
        let provider = GitSource::new(
            GitSourceConfig {
                repo: "https://github.com/ethpandaops/suites.git".into(),
                reference: "main".into(),
                ..Default::default()
            },
            None,
            PathBuf::from("/tmp/cache"),
        );
        let path = provider.clone_path();
        assert!(path.starts_with("/tmp/cache/git"));
    }
}
