use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tracing::debug;

/// A fully retrieved object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub bytes: Bytes,
    pub content_type: String,
}

impl Asset {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("{method} {url} returned {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },
    #[error("transport error: {0}")]
    Transport(String),
    /// The origin announced more bytes than it delivered.
    #[error("incomplete body from {url}: expected {expected} bytes, got {actual}")]
    Incomplete {
        url: String,
        expected: u64,
        actual: u64,
    },
    #[error("object {key} is not readable after upload")]
    NotVisible { key: String },
    #[error("object {key} size mismatch: wrote {expected} bytes, store reports {actual}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
}

impl ObjectStoreError {
    /// Retrying cannot help: the source is gone or forbidden.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::Status {
                method: "GET",
                status: 403 | 404 | 410,
                ..
            }
        )
    }
}

impl From<reqwest::Error> for ObjectStoreError {
    fn from(value: reqwest::Error) -> Self {
        ObjectStoreError::Transport(value.to_string())
    }
}

/// Object-store-like service: `GET` from any URL, `PUT`/`HEAD` under our keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download the complete object at `url`. A body shorter than the announced
    /// length is an error, never a success.
    async fn fetch(&self, url: &str) -> Result<Asset, ObjectStoreError>;

    /// Write `asset` at `key`, overwriting whatever is there.
    async fn put(&self, key: &str, asset: &Asset) -> Result<(), ObjectStoreError>;

    /// Existence check; `None` when the store does not serve the key.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError>;

    /// URL consumers use to read `key`.
    fn public_url(&self, key: &str) -> String;

    /// Write, then confirm the store actually serves the full object.
    async fn put_verified(&self, key: &str, asset: &Asset) -> Result<String, ObjectStoreError> {
        self.put(key, asset).await?;
        match self.head(key).await? {
            Some(meta) if meta.size == asset.len() => Ok(self.public_url(key)),
            Some(meta) => Err(ObjectStoreError::SizeMismatch {
                key: key.to_string(),
                expected: asset.len(),
                actual: meta.size,
            }),
            None => Err(ObjectStoreError::NotVisible {
                key: key.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    public_base_url: String,
    token: Option<String>,
}

impl HttpObjectStore {
    /// `endpoint` is where objects are written (`{endpoint}/{key}`);
    /// `public_base_url` is where they are read from afterwards.
    pub fn new(client: Client, endpoint: &str, public_base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(&self, url: &str) -> Result<Asset, ObjectStoreError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ObjectStoreError::Status {
                method: "GET",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let announced = response.content_length();
        let bytes = response.bytes().await?;

        if let Some(expected) = announced {
            if bytes.len() as u64 != expected {
                return Err(ObjectStoreError::Incomplete {
                    url: url.to_string(),
                    expected,
                    actual: bytes.len() as u64,
                });
            }
        }
        debug!(url, size = bytes.len(), "asset downloaded");
        Ok(Asset {
            bytes,
            content_type,
        })
    }

    async fn put(&self, key: &str, asset: &Asset) -> Result<(), ObjectStoreError> {
        let url = self.object_url(key);
        let response = self
            .authorize(self.client.put(&url))
            .header(CONTENT_TYPE, asset.content_type.as_str())
            .body(asset.bytes.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ObjectStoreError::Status {
                method: "PUT",
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        let url = self.object_url(key);
        let response = self.authorize(self.client.head(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let size = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                Ok(Some(ObjectMeta { size }))
            }
            status => Err(ObjectStoreError::Status {
                method: "HEAD",
                url,
                status: status.as_u16(),
            }),
        }
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key.trim_start_matches('/'))
    }
}
