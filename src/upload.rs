//! The results upload capability.
//!
//! The archival service is external; the runner only needs to hand it the
//! run directory and the touched suite directories. Upload failures always
//! degrade to warnings: the local tree stays authoritative.

use crate::config::UploadConfig;
use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing::{debug, info};

/// The upload capability consumed by the supervisor.
#[async_trait::async_trait]
pub(crate) trait UploadAdapter: Send + Sync {
    /// Verifies the target is reachable before any upload.
    async fn preflight(&self) -> Result<()>;

    /// Uploads one run directory.
    async fn upload(&self, local_dir: &Path) -> Result<()>;

    /// Uploads one suite directory.
    async fn upload_suite_dir(&self, local_suite_dir: &Path) -> Result<()>;
}

/// Uploads files one-by-one to an HTTP object store, keyed by their path
/// relative to the results root.
#[derive(Debug, Clone)]
pub(crate) struct HttpUploader {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpUploader {
    /// Creates an uploader for the configured target.
    pub(crate) fn new(config: &UploadConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    async fn upload_tree(&self, root: &Path) -> Result<()> {
        let base = root
            .parent()
            .and_then(|p| p.parent())
            .unwrap_or_else(|| Path::new(""));
        for entry in walkdir::WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let key = entry.path().strip_prefix(base)?.display().to_string();
            let mut request = self
                .http
                .put(format!("{}/{key}", self.endpoint))
                .body(tokio::fs::read(entry.path()).await?);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            request.send().await?.error_for_status()?;
            debug!(target: "upload", "uploaded {key}");
        }
        info!(target: "upload", "uploaded {}", root.display());
        Ok(())
    }
}

#[async_trait::async_trait]
impl UploadAdapter for HttpUploader {
    async fn preflight(&self) -> Result<()> {
        let response = self.http.head(&self.endpoint).send().await?;
        if response.status().is_server_error() {
            return Err(eyre!("upload target unhealthy: HTTP {}", response.status()));
        }
        Ok(())
    }

    async fn upload(&self, local_dir: &Path) -> Result<()> {
        self.upload_tree(local_dir).await
    }

    async fn upload_suite_dir(&self, local_suite_dir: &Path) -> Result<()> {
        self.upload_tree(local_suite_dir).await
    }
}
