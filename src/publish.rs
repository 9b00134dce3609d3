use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{HttpFailure, PublishError, UploadError};
use crate::model::{MediaHandle, PublishReceipt, Visibility};

const MEDIA_FETCH_TIMEOUT: Duration = Duration::from_secs(3);
const API_TIMEOUT: Duration = Duration::from_secs(60);
const MEDIA_FETCH_USER_AGENT: &str = "Mozilla/5.0 (X11)";
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Download `url` and register it as an attachment on the destination.
    async fn upload_media(&self, url: &str) -> Result<MediaHandle, UploadError>;

    /// Create one post referencing `media` in order.
    async fn publish(
        &self,
        text: &str,
        media: &[MediaHandle],
        visibility: Visibility,
        language: &str,
    ) -> Result<PublishReceipt, PublishError>;
}

/// Authenticated session against one Mastodon-compatible instance.
#[derive(Clone)]
pub struct MastodonClient {
    http: Client,
    media_http: Client,
    base_url: Url,
    access_token: String,
}

impl fmt::Debug for MastodonClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MastodonClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl MastodonClient {
    pub fn new(base_url: &str, access_token: String) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid Mastodon instance URL")?;
        let http = Client::builder()
            .user_agent(concat!("tweet-relay/", env!("CARGO_PKG_VERSION")))
            .timeout(API_TIMEOUT)
            .build()
            .context("failed to build Mastodon HTTP client")?;
        let media_http = Client::builder()
            .user_agent(MEDIA_FETCH_USER_AGENT)
            .timeout(MEDIA_FETCH_TIMEOUT)
            .build()
            .context("failed to build media HTTP client")?;
        Ok(Self {
            http,
            media_http,
            base_url,
            access_token,
        })
    }

    pub fn build_status_request(&self, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("api/v1/statuses")
            .context("invalid Mastodon base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.access_token)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .build()
            .context("failed to build status request")
    }

    async fn fetch_media(&self, url: &str) -> Result<(Vec<u8>, String), UploadError> {
        let fetch_err = |message: String| UploadError::Fetch {
            url: url.to_string(),
            message,
        };
        let res = self
            .media_http
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !res.status().is_success() {
            return Err(fetch_err(format!("status {}", res.status())));
        }
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(FALLBACK_CONTENT_TYPE)
            .to_string();
        let bytes = res.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
        Ok((bytes.to_vec(), content_type))
    }
}

#[async_trait]
impl Publisher for MastodonClient {
    #[instrument(skip(self))]
    async fn upload_media(&self, url: &str) -> Result<MediaHandle, UploadError> {
        let (bytes, content_type) = self.fetch_media(url).await?;
        debug!(size = bytes.len(), %content_type, "media fetched");

        let register_err = |kind: HttpFailure, message: String| UploadError::Register { kind, message };
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(media_file_name(url))
            .mime_str(&content_type)
            .map_err(|e| register_err(HttpFailure::Decode, e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let endpoint = self
            .base_url
            .join("api/v2/media")
            .map_err(|e| register_err(HttpFailure::Transport, e.to_string()))?;
        let res = self
            .http
            .post(endpoint)
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| register_err(HttpFailure::Transport, e.to_string()))?;

        // 202 means the attachment is still processing but already usable by id.
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(register_err(
                classify_status(status),
                format!("mastodon error {}: {}", status, body),
            ));
        }
        let payload: MediaAttachmentResponse = res
            .json()
            .await
            .map_err(|e| register_err(HttpFailure::Decode, e.to_string()))?;
        Ok(MediaHandle(payload.id))
    }

    #[instrument(skip(self, text, media), fields(media_count = media.len()))]
    async fn publish(
        &self,
        text: &str,
        media: &[MediaHandle],
        visibility: Visibility,
        language: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let body = build_status_body(text, media, visibility, language);
        let request = self
            .build_status_request(&body)
            .map_err(|e| PublishError::new(HttpFailure::Transport, format!("{:#}", e)))?;
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| PublishError::new(HttpFailure::Transport, e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let kind = classify_status(status);
            if kind == HttpFailure::RateLimited {
                warn!("rate limited by Mastodon");
            }
            return Err(PublishError::new(
                kind,
                format!("mastodon error {}: {}", status, body),
            ));
        }

        let payload: StatusResponse = res
            .json()
            .await
            .map_err(|e| PublishError::new(HttpFailure::Decode, e.to_string()))?;
        Ok(PublishReceipt {
            id: payload.id,
            url: payload.url,
        })
    }
}

pub fn build_status_body(
    text: &str,
    media: &[MediaHandle],
    visibility: Visibility,
    language: &str,
) -> Value {
    let media_ids: Vec<&str> = media.iter().map(|m| m.0.as_str()).collect();
    json!({
        "status": text,
        "media_ids": media_ids,
        "visibility": visibility.as_str(),
        "language": language,
    })
}

/// Last path segment of the media URL, used as the upload's file name.
fn media_file_name(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "media".to_string())
}

fn classify_status(status: StatusCode) -> HttpFailure {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HttpFailure::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => HttpFailure::RateLimited,
        _ => HttpFailure::Status,
    }
}

#[derive(Deserialize)]
struct MediaAttachmentResponse {
    id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    id: String,
    url: Option<String>,
}
