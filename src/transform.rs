//! Turns a fetched source post into the text and media list we publish.
use crate::error::MediaResolutionError;
use crate::model::{MediaRef, SourcePost, TransformedPost};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::warn;

static TRAILING_WS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)[ \t]+$").expect("valid trailing whitespace regex"));

/// Attribution line prepended to every forwarded post.
pub fn attribution(origin_handle: &str) -> String {
    format!("From @{}", origin_handle)
}

pub fn transform(post: &SourcePost, origin_handle: &str) -> TransformedPost {
    let body = rewrite_text(post);
    let header = attribution(origin_handle);
    let text = if body.is_empty() {
        header
    } else {
        format!("{}\n\n{}", header, body)
    };

    let media_urls = post
        .media
        .iter()
        .filter_map(|media| match resolve_media(media) {
            Ok(url) => Some(url.to_string()),
            Err(err) => {
                warn!(post_id = %post.id, %err, "dropping unresolvable attachment");
                None
            }
        })
        .collect();

    TransformedPost {
        origin_handle: origin_handle.to_string(),
        text,
        media_urls,
    }
}

/// Links to attached media are removed (the media is uploaded instead);
/// every other wrapped link is replaced by its expanded form. An attachment
/// that cannot be resolved is not uploaded, so its link is expanded too.
pub fn rewrite_text(post: &SourcePost) -> String {
    let attached: HashSet<&str> = post
        .media
        .iter()
        .filter(|m| resolve_media(m).is_ok())
        .map(|m| m.key.as_str())
        .collect();
    let mut text = unescape_entities(&post.text);

    for link in &post.links {
        if link.short_url.is_empty() {
            continue;
        }
        let points_at_attachment = link
            .media_key
            .as_deref()
            .map(|key| attached.contains(key))
            .unwrap_or(false);
        if points_at_attachment {
            text = remove_link(&text, &link.short_url);
        } else if let Some(expanded) = link.expanded_url.as_deref().filter(|u| !u.is_empty()) {
            text = text.replace(&link.short_url, expanded);
        }
    }

    TRAILING_WS.replace_all(&text, "").trim().to_string()
}

/// The URL to upload for an attachment, or why there is none.
pub fn resolve_media(media: &MediaRef) -> Result<&str, MediaResolutionError> {
    if media.kind.is_none() {
        return Err(MediaResolutionError::MissingKind(media.key.clone()));
    }
    media
        .resolved_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| MediaResolutionError::MissingUrl(media.key.clone()))
}

/// Drop every occurrence of `short_url` together with one neighbouring space,
/// preferring the one before it.
fn remove_link(text: &str, short_url: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(short_url) {
        let before = &rest[..pos];
        let mut after = &rest[pos + short_url.len()..];
        match before.strip_suffix(' ') {
            Some(trimmed) => out.push_str(trimmed),
            None => {
                out.push_str(before);
                after = after.strip_prefix(' ').unwrap_or(after);
            }
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

// The v2 API escapes these three in post text.
fn unescape_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
