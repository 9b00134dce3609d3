use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::{MAX_BATCH_SIZE, MIN_BATCH_SIZE};
use crate::error::{HttpFailure, SourceError};
use crate::model::{Batch, PostId};
use crate::source::model::{TimelineResp, UserLookupResp};

pub mod model;

const TWITTER_API_BASE: &str = "https://api.twitter.com/";
const TWEET_FIELDS: &str = "id,created_at,text,author_id,attachments,entities,conversation_id";
const MEDIA_FIELDS: &str = "media_key,type,url,preview_image_url,alt_text";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch original (non-reply, non-repost) posts of `handle` newer than
    /// `cursor`, oldest first. No retries happen here.
    async fn fetch_batch(&self, handle: &str, cursor: Option<PostId>)
        -> Result<Batch, SourceError>;
}

#[derive(Clone)]
pub struct TwitterClient {
    http: Client,
    base_url: Url,
    bearer_token: String,
    batch_size: u32,
}

impl fmt::Debug for TwitterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitterClient")
            .field("base_url", &self.base_url)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl TwitterClient {
    pub fn new(bearer_token: String, batch_size: u32) -> Result<Self> {
        let base_url = Url::parse(TWITTER_API_BASE).context("invalid Twitter API URL")?;
        Self::with_base_url(bearer_token, batch_size, base_url)
    }

    pub fn with_base_url(bearer_token: String, batch_size: u32, base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("tweet-relay/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build Twitter HTTP client")?;
        Ok(Self {
            http,
            base_url,
            bearer_token,
            batch_size: batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
        })
    }

    pub fn build_user_lookup_request(&self, handle: &str) -> Result<reqwest::Request> {
        let url = self
            .base_url
            .join(&format!("2/users/by/username/{}", handle))
            .context("invalid user lookup URL")?;
        self.http
            .get(url)
            .bearer_auth(&self.bearer_token)
            .build()
            .context("failed to build user lookup request")
    }

    pub fn build_timeline_request(
        &self,
        user_id: &str,
        cursor: Option<PostId>,
    ) -> Result<reqwest::Request> {
        let mut url = self
            .base_url
            .join(&format!("2/users/{}/tweets", user_id))
            .context("invalid timeline URL")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("max_results", &self.batch_size.to_string())
                .append_pair("exclude", "replies,retweets")
                .append_pair("expansions", "attachments.media_keys")
                .append_pair("tweet.fields", TWEET_FIELDS)
                .append_pair("media.fields", MEDIA_FIELDS);
            if let Some(since) = cursor {
                query.append_pair("since_id", &since.to_string());
            }
        }
        self.http
            .get(url)
            .bearer_auth(&self.bearer_token)
            .build()
            .context("failed to build timeline request")
    }

    async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response, SourceError> {
        debug!(url = %request.url(), "sending twitter request");
        self.http
            .execute(request)
            .await
            .map_err(|e| SourceError::fetch(HttpFailure::Transport, e.to_string()))
    }

    /// Resolve a handle to the numeric account id used by the timeline API.
    #[instrument(skip(self))]
    pub async fn resolve_user_id(&self, handle: &str) -> Result<String, SourceError> {
        let request = self
            .build_user_lookup_request(handle)
            .map_err(|e| SourceError::fetch(HttpFailure::Transport, format!("{:#}", e)))?;
        let res = self.send(request).await?;
        if matches!(res.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Err(SourceError::AccountNotFound(handle.to_string()));
        }
        let resp: UserLookupResp = read_json(res).await?;
        match resp.data {
            Some(user) => Ok(user.id),
            None => {
                if let Some(e) = resp.errors.first() {
                    debug!(title = ?e.title, detail = ?e.detail, "user lookup returned errors");
                }
                Err(SourceError::AccountNotFound(handle.to_string()))
            }
        }
    }
}

async fn read_json<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, SourceError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        let kind = classify_status(status);
        if kind == HttpFailure::RateLimited {
            warn!("rate limited by Twitter");
        }
        return Err(SourceError::fetch(
            kind,
            format!("twitter error {}: {}", status, body),
        ));
    }
    res.json::<T>()
        .await
        .map_err(|e| SourceError::fetch(HttpFailure::Decode, e.to_string()))
}

fn classify_status(status: StatusCode) -> HttpFailure {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HttpFailure::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => HttpFailure::RateLimited,
        _ => HttpFailure::Status,
    }
}

#[async_trait]
impl SourceClient for TwitterClient {
    #[instrument(skip(self))]
    async fn fetch_batch(
        &self,
        handle: &str,
        cursor: Option<PostId>,
    ) -> Result<Batch, SourceError> {
        let user_id = self.resolve_user_id(handle).await?;
        let request = self
            .build_timeline_request(&user_id, cursor)
            .map_err(|e| SourceError::fetch(HttpFailure::Transport, format!("{:#}", e)))?;
        let resp: TimelineResp = read_json(self.send(request).await?).await?;
        debug!(result_count = resp.meta.result_count, "timeline page received");
        Ok(resp.into_batch(cursor))
    }
}
