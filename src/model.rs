use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Source post identifier. Twitter ids are snowflakes, so numeric order is
/// chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PostId(pub u64);

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PostId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(PostId)
    }
}

impl TryFrom<String> for PostId {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PostId> for String {
    fn from(id: PostId) -> Self {
        id.to_string()
    }
}

/// Persisted watermark per handle.
pub type CursorTable = BTreeMap<String, PostId>;

/// A tracked source account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub handle: String,
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    /// Map a Twitter `media.type` value onto our coarse kinds.
    pub fn from_api_type(kind: &str) -> Self {
        match kind {
            "photo" => MediaKind::Image,
            "video" | "animated_gif" => MediaKind::Video,
            _ => MediaKind::Other,
        }
    }
}

/// One media attachment of a source post. `resolved_url` is always a still
/// image for `Video`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub key: String,
    pub kind: Option<MediaKind>,
    pub resolved_url: Option<String>,
}

/// An inline link entity as returned by the source API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntity {
    pub short_url: String,
    pub expanded_url: Option<String>,
    pub media_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePost {
    pub id: PostId,
    pub text: String,
    pub links: Vec<LinkEntity>,
    pub media: Vec<MediaRef>,
}

/// Result of one `fetch_batch` call. Posts are oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub posts: Vec<SourcePost>,
    pub new_cursor: Option<PostId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedPost {
    pub origin_handle: String,
    pub text: String,
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
            Visibility::Direct => "direct",
        }
    }
}

/// Destination-side id of an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub id: String,
    pub url: Option<String>,
}
