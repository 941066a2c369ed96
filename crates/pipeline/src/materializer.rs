use std::{path::PathBuf, time::Duration};

use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::{error::MaterializationError, now_ms, store::Store};

/// Public prefix under which materialized files are served.
pub const VIDEOS_ROUTE: &str = "/videos";

/// Downloads finished videos and keeps a local copy that outlives the
/// provider's expiring URLs.
#[derive(Clone)]
pub struct Materializer {
    store: Store,
    videos_dir: PathBuf,
    http_client: reqwest::Client,
}

impl Materializer {
    pub fn new(store: Store, videos_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            videos_dir: videos_dir.into(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Fetches `remote_url`, writes it once to disk and records the local
    /// reference on the task. Returns the reference (`/videos/<file>`).
    pub async fn materialize(&self, task_id: &str, remote_url: &str) -> Result<String, MaterializationError> {
        let mut response = self
            .http_client
            .get(remote_url)
            .timeout(Duration::from_secs(300))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MaterializationError::Status(response.status()));
        }

        tokio::fs::create_dir_all(&self.videos_dir).await?;
        let filename = format!("{task_id}_{}.mp4", now_ms());
        let path = self.videos_dir.join(&filename);

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let written = async {
            let mut bytes = 0usize;
            while let Some(chunk) = response.chunk().await? {
                bytes += chunk.len();
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok::<_, MaterializationError>(bytes)
        }
        .await;

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(err);
            }
        };

        let local_path = format!("{VIDEOS_ROUTE}/{filename}");
        self.store.set_local_path(task_id, &local_path).await?;
        info!(task_id, bytes, local_path = %local_path, "materialized video");
        Ok(local_path)
    }

    /// Deletes a file previously returned by [`Materializer::materialize`].
    /// Missing files are not an error.
    pub async fn remove(&self, local_path: &str) -> std::io::Result<()> {
        let name = local_path
            .strip_prefix(VIDEOS_ROUTE)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty() && !name.contains(['/', '\\']) && !name.contains(".."))
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{local_path:?} is not a materialized video"),
                )
            })?;

        match tokio::fs::remove_file(self.videos_dir.join(name)).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
