use crate::config::DownloadConfig;
use crate::error::PipelineError;
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

const MAX_USER_ID_LEN: usize = 128;

/// A validated analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub image_url: Url,
    pub user_id: String,
}

impl AnalysisRequest {
    pub fn parse(
        image_url: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Self, PipelineError> {
        let image_url = non_empty(image_url)
            .ok_or_else(|| PipelineError::InvalidRequest("imageUrl is required".into()))?;
        let user_id = non_empty(user_id)
            .ok_or_else(|| PipelineError::InvalidRequest("userId is required".into()))?;

        let image_url = Url::parse(image_url)
            .map_err(|e| PipelineError::InvalidRequest(format!("imageUrl is not a URL: {}", e)))?;
        if !matches!(image_url.scheme(), "http" | "https") {
            return Err(PipelineError::InvalidRequest(format!(
                "imageUrl must use http or https, got `{}`",
                image_url.scheme()
            )));
        }

        // The user id names a scratch directory, so it has to be one plain path segment.
        let is_safe_segment = user_id.len() <= MAX_USER_ID_LEN
            && user_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !is_safe_segment {
            return Err(PipelineError::InvalidRequest(
                "userId contains unsupported characters".into(),
            ));
        }

        Ok(Self {
            image_url,
            user_id: user_id.to_string(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// The input and output image paths of one invocation. Both files are
/// removed when the value is dropped; removal failures are only logged.
#[derive(Debug)]
pub struct ScratchFiles {
    input: PathBuf,
    output: PathBuf,
}

impl ScratchFiles {
    /// Creates `<root>/<user_id>` if needed and reserves fresh file names in it.
    pub async fn create(root: &Path, user_id: &str) -> Result<Self, PipelineError> {
        let dir = root.join(user_id);
        tokio::fs::create_dir_all(&dir).await?;

        let id = Uuid::new_v4();
        Ok(Self {
            input: dir.join(format!("input_{}.jpg", id)),
            output: dir.join(format!("output_{}.jpg", id)),
        })
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in [&self.input, &self.output] {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed scratch file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to remove scratch file {}: {}", path.display(), e)
                }
            }
        }
    }
}

/// Fetches images from object storage by URL.
#[derive(Clone)]
pub struct ImageDownloader {
    client: Client,
    max_bytes: u64,
}

impl ImageDownloader {
    pub fn new(config: &DownloadConfig) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(config.get_timeout())
            .build()
            .map_err(|e| {
                PipelineError::UnexpectedFailure(format!("failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }

    /// Downloads `url` and writes the bytes unchanged to `destination`.
    ///
    /// Bodies over `max_bytes` are refused, up front when the server sends a
    /// length and otherwise as soon as the running total passes the limit.
    #[instrument(skip(self, url, destination), fields(url = %url))]
    pub async fn download_to(&self, url: &Url, destination: &Path) -> Result<u64, PipelineError> {
        let mut response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!("Image download returned status {}", status);
            return Err(PipelineError::DownloadFailed {
                status: status.as_u16(),
            });
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                tracing::error!("Image is {} bytes, limit is {}", length, self.max_bytes);
                return Err(PipelineError::ImageTooLarge {
                    limit: self.max_bytes,
                });
            }
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            written += chunk.len() as u64;
            if written > self.max_bytes {
                tracing::error!("Image body passed the {} byte limit", self.max_bytes);
                return Err(PipelineError::ImageTooLarge {
                    limit: self.max_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        tracing::debug!("Staged {} bytes at {}", written, destination.display());

        Ok(written)
    }
}
