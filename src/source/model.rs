//! Twitter API v2 wire types and their conversion into [`SourcePost`]s.
use crate::model::{Batch, LinkEntity, MediaKind, MediaRef, PostId, SourcePost};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Deserialize, Debug)]
pub struct UserLookupResp {
    pub data: Option<UserData>,
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

#[derive(Deserialize, Debug)]
pub struct UserData {
    pub id: String,
    pub username: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ApiError {
    pub title: Option<String>,
    pub detail: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct TimelineResp {
    #[serde(default)]
    pub data: Vec<Tweet>,
    #[serde(default)]
    pub includes: Includes,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Deserialize, Debug)]
pub struct Tweet {
    pub id: PostId,
    pub text: String,
    #[serde(default)]
    pub attachments: Option<Attachments>,
    #[serde(default)]
    pub entities: Option<Entities>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Attachments {
    #[serde(default)]
    pub media_keys: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Entities {
    #[serde(default)]
    pub urls: Vec<UrlEntity>,
}

#[derive(Deserialize, Debug)]
pub struct UrlEntity {
    pub url: String,
    pub expanded_url: Option<String>,
    pub media_key: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Includes {
    #[serde(default)]
    pub media: Vec<Media>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Media {
    pub media_key: String,
    #[serde(rename = "type")]
    pub typ: Option<String>,
    pub url: Option<String>,
    pub preview_image_url: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Meta {
    pub newest_id: Option<PostId>,
    #[serde(default)]
    pub result_count: u32,
}

impl Media {
    /// Classify and pick the URL to forward: the still preview for videos,
    /// the direct URL for everything else.
    pub fn to_media_ref(&self) -> MediaRef {
        let kind = self.typ.as_deref().map(MediaKind::from_api_type);
        let resolved_url = match kind {
            Some(MediaKind::Video) => self.preview_image_url.clone(),
            Some(_) => self.url.clone(),
            None => None,
        };
        MediaRef {
            key: self.media_key.clone(),
            kind,
            resolved_url: resolved_url.filter(|u| !u.trim().is_empty()),
        }
    }
}

impl TimelineResp {
    /// Turn a timeline page into a batch ordered oldest first.
    /// With no posts the cursor passed in is returned unchanged.
    pub fn into_batch(self, cursor: Option<PostId>) -> Batch {
        let media: HashMap<&str, &Media> = self
            .includes
            .media
            .iter()
            .map(|m| (m.media_key.as_str(), m))
            .collect();

        let mut posts: Vec<SourcePost> = self
            .data
            .iter()
            .map(|tweet| {
                let media_refs = tweet
                    .attachments
                    .as_ref()
                    .map(|a| a.media_keys.as_slice())
                    .unwrap_or_default()
                    .iter()
                    .map(|key| match media.get(key.as_str()) {
                        Some(m) => m.to_media_ref(),
                        // Referenced but not expanded by the API.
                        None => MediaRef {
                            key: key.clone(),
                            kind: None,
                            resolved_url: None,
                        },
                    })
                    .collect();
                let links = tweet
                    .entities
                    .as_ref()
                    .map(|e| e.urls.as_slice())
                    .unwrap_or_default()
                    .iter()
                    .map(|u| LinkEntity {
                        short_url: u.url.clone(),
                        expanded_url: u.expanded_url.clone(),
                        media_key: u.media_key.clone(),
                    })
                    .collect();
                SourcePost {
                    id: tweet.id,
                    text: tweet.text.clone(),
                    links,
                    media: media_refs,
                }
            })
            .collect();
        posts.sort_by_key(|p| p.id);

        let newest = posts.last().map(|p| p.id);
        let new_cursor = match (self.meta.newest_id.or(newest), cursor) {
            (Some(id), Some(c)) => Some(id.max(c)),
            (Some(id), None) => Some(id),
            (None, c) => c,
        };
        Batch { posts, new_cursor }
    }
}
