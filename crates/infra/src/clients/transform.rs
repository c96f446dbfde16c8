use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;

use super::object_store::Asset;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("transform endpoint returned {status}")]
    Status { status: u16 },
    #[error("transform transport error: {0}")]
    Transport(String),
    #[error("transform endpoint returned an empty image")]
    EmptyImage,
}

impl TransformError {
    /// The endpoint rejected the request itself; the same input will fail again.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransformError::Status { status } if matches!(status, 400 | 404 | 410 | 415 | 422))
    }
}

impl From<reqwest::Error> for TransformError {
    fn from(value: reqwest::Error) -> Self {
        TransformError::Transport(value.to_string())
    }
}

/// Derives a still image from a video URL.
#[async_trait]
pub trait TransformClient: Send + Sync {
    async fn thumbnail(&self, video_url: &str) -> Result<Asset, TransformError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransformRequest<'a> {
    url: &'a str,
    format: &'static str,
}

#[derive(Debug, Clone)]
pub struct HttpTransformClient {
    client: Client,
    endpoint: String,
}

impl HttpTransformClient {
    pub fn new(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl TransformClient for HttpTransformClient {
    async fn thumbnail(&self, video_url: &str) -> Result<Asset, TransformError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&TransformRequest {
                url: video_url,
                format: "jpeg",
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransformError::Status {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(TransformError::EmptyImage);
        }
        Ok(Asset {
            bytes,
            content_type,
        })
    }
}
