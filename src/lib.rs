//! Mirrors original posts of tracked Twitter accounts to a Mastodon account.
//!
//! The pipeline per account is `source` (fetch newer than the stored cursor)
//! → `transform` (rewrite text, resolve media) → `publish` (upload + post)
//! → `state` (persist the new cursor), driven by [`relay::Relay`].

pub mod config;
pub mod error;
pub mod model;
pub mod publish;
pub mod relay;
pub mod source;
pub mod state;
pub mod transform;
