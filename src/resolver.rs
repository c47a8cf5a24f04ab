//! Source Resolver (C2): maps a user-supplied [`Source`] to a local
//! readable path, honoring the remote-loading policy.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use url::Url;

use crate::error::QueryError;
use crate::model::Source;

/// Resolves sources to local paths and tracks process-private temporary
/// files created for remote (`http`/`https`) sources.
///
/// Temporary files survive a recovery re-initialization (§4.2) so that
/// remote-sourced documents remain valid; they are only deleted on
/// [`SourceResolver::dispose`].
#[derive(Clone)]
pub struct SourceResolver {
    allow_remote_source_loading: bool,
    temp_dir: PathBuf,
    temp_files: Arc<Mutex<Vec<PathBuf>>>,
    http_client: reqwest::Client,
}

impl SourceResolver {
    #[must_use]
    pub fn new(allow_remote_source_loading: bool, temp_dir: PathBuf) -> Self {
        Self {
            allow_remote_source_loading,
            temp_dir,
            temp_files: Arc::new(Mutex::new(Vec::new())),
            http_client: reqwest::Client::new(),
        }
    }

    /// Resolve a source to a local path, fetching it first if it is a
    /// remote URL and remote loading is allowed.
    pub async fn resolve(&self, source: &Source) -> Result<String, QueryError> {
        let raw = source.as_str();

        if let Some(path) = raw.strip_prefix("file://") {
            return Ok(path.to_owned());
        }

        if let Ok(parsed) = Url::parse(raw) {
            if parsed.scheme() == "http" || parsed.scheme() == "https" {
                if !self.allow_remote_source_loading {
                    return Err(QueryError::InvalidInput(
                        "Remote source loading is disabled".to_owned(),
                    ));
                }
                return self.fetch_remote(raw).await;
            }
        }

        Ok(raw.to_owned())
    }

    async fn fetch_remote(&self, url: &str) -> Result<String, QueryError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| QueryError::TransientEngine(format!("failed to fetch {url}: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| QueryError::TransientEngine(format!("failed to read {url}: {e}")))?;

        // A random suffix prevents collisions under concurrent opens of
        // the same URL (§4.2).
        let file_name = format!("gdx-remote-{}.gdx", uuid::Uuid::new_v4());
        let path = self.temp_dir.join(file_name);
        tokio::fs::write(&path, &bytes).await?;

        self.temp_files.lock().await.push(path.clone());
        Ok(path.to_string_lossy().into_owned())
    }

    /// Remove all tracked temporary files. Called on server shutdown,
    /// unless the shutdown is caused by a recovery reset (§5).
    pub async fn dispose(&self) {
        let mut temp_files = self.temp_files.lock().await;
        for path in temp_files.drain(..) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), %err, "failed to remove temp file");
            }
        }
    }
}
