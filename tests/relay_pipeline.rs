use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tweet_relay::error::{HttpFailure, PublishError, SourceError, StorageError, UploadError};
use tweet_relay::model::{
    Account, Batch, CursorTable, LinkEntity, MediaHandle, MediaKind, MediaRef, PostId,
    PublishReceipt, SourcePost, Visibility,
};
use tweet_relay::publish::Publisher;
use tweet_relay::relay::{AccountOutcome, Pacing, Relay};
use tweet_relay::source::SourceClient;
use tweet_relay::state::CursorStore;

const NO_DELAY: Pacing = Pacing {
    account_delay: Duration::ZERO,
    cycle_delay: Duration::ZERO,
};

/// Serves a fixed post list per handle with the timeline API's `since_id`
/// semantics: at most `batch_size` of the newest posts above the cursor.
#[derive(Clone)]
struct FakeTimeline {
    posts: Arc<Mutex<HashMap<String, Vec<SourcePost>>>>,
    failures: Arc<Mutex<HashMap<String, VecDeque<SourceError>>>>,
    calls: Arc<Mutex<Vec<(String, Option<PostId>)>>>,
    batch_size: usize,
}

impl FakeTimeline {
    fn new() -> Self {
        Self {
            posts: Arc::default(),
            failures: Arc::default(),
            calls: Arc::default(),
            batch_size: 5,
        }
    }

    async fn add(&self, handle: &str, posts: Vec<SourcePost>) {
        self.posts
            .lock()
            .await
            .entry(handle.to_string())
            .or_default()
            .extend(posts);
    }

    async fn fail_next(&self, handle: &str, err: SourceError) {
        self.failures
            .lock()
            .await
            .entry(handle.to_string())
            .or_default()
            .push_back(err);
    }

    async fn calls(&self) -> Vec<(String, Option<PostId>)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl SourceClient for FakeTimeline {
    async fn fetch_batch(
        &self,
        handle: &str,
        cursor: Option<PostId>,
    ) -> Result<Batch, SourceError> {
        self.calls.lock().await.push((handle.to_string(), cursor));
        if let Some(err) = self
            .failures
            .lock()
            .await
            .get_mut(handle)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let guard = self.posts.lock().await;
        let Some(all) = guard.get(handle) else {
            return Err(SourceError::AccountNotFound(handle.to_string()));
        };
        let mut newer: Vec<SourcePost> = all
            .iter()
            .filter(|p| cursor.map_or(true, |c| p.id > c))
            .cloned()
            .collect();
        newer.sort_by_key(|p| p.id);
        let skip = newer.len().saturating_sub(self.batch_size);
        let posts: Vec<SourcePost> = newer.into_iter().skip(skip).collect();
        let new_cursor = posts.last().map(|p| p.id).or(cursor);
        Ok(Batch { posts, new_cursor })
    }
}

#[derive(Debug, Clone)]
struct PublishCall {
    text: String,
    media: Vec<MediaHandle>,
    visibility: Visibility,
    language: String,
}

#[derive(Clone, Default)]
struct RecordingPublisher {
    results: Arc<Mutex<VecDeque<Result<(), PublishError>>>>,
    failing_uploads: Arc<Mutex<HashSet<String>>>,
    uploads: Arc<Mutex<Vec<String>>>,
    attempts: Arc<Mutex<Vec<PublishCall>>>,
    published: Arc<Mutex<Vec<PublishCall>>>,
}

impl RecordingPublisher {
    fn with_results(results: Vec<Result<(), PublishError>>) -> Self {
        Self {
            results: Arc::new(Mutex::new(VecDeque::from(results))),
            ..Default::default()
        }
    }

    async fn fail_upload(&self, url: &str) {
        self.failing_uploads.lock().await.insert(url.to_string());
    }

    async fn published(&self) -> Vec<PublishCall> {
        self.published.lock().await.clone()
    }

    async fn attempts(&self) -> Vec<PublishCall> {
        self.attempts.lock().await.clone()
    }

    async fn uploads(&self) -> Vec<String> {
        self.uploads.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn upload_media(&self, url: &str) -> Result<MediaHandle, UploadError> {
        if self.failing_uploads.lock().await.contains(url) {
            return Err(UploadError::Fetch {
                url: url.to_string(),
                message: "timed out".into(),
            });
        }
        let mut uploads = self.uploads.lock().await;
        uploads.push(url.to_string());
        Ok(MediaHandle(format!("media-{}", uploads.len())))
    }

    async fn publish(
        &self,
        text: &str,
        media: &[MediaHandle],
        visibility: Visibility,
        language: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let call = PublishCall {
            text: text.to_string(),
            media: media.to_vec(),
            visibility,
            language: language.to_string(),
        };
        self.attempts.lock().await.push(call.clone());
        let next = self.results.lock().await.pop_front().unwrap_or(Ok(()));
        next?;
        let mut published = self.published.lock().await;
        published.push(call);
        Ok(PublishReceipt {
            id: format!("status-{}", published.len()),
            url: None,
        })
    }
}

#[derive(Clone, Default)]
struct MemoryStore {
    table: Arc<Mutex<CursorTable>>,
    saves: Arc<Mutex<usize>>,
    fail_saves: Arc<Mutex<bool>>,
}

impl MemoryStore {
    async fn seeded(entries: &[(&str, u64)]) -> Self {
        let store = Self::default();
        {
            let mut table = store.table.lock().await;
            for (handle, id) in entries {
                table.insert(handle.to_string(), PostId(*id));
            }
        }
        store
    }

    async fn cursor(&self, handle: &str) -> Option<PostId> {
        self.table.lock().await.get(handle).copied()
    }

    async fn saves(&self) -> usize {
        *self.saves.lock().await
    }

    async fn set_failing(&self, failing: bool) {
        *self.fail_saves.lock().await = failing;
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load(&self) -> Result<CursorTable, StorageError> {
        Ok(self.table.lock().await.clone())
    }

    async fn save(&self, cursors: &CursorTable) -> Result<(), StorageError> {
        if *self.fail_saves.lock().await {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        *self.table.lock().await = cursors.clone();
        *self.saves.lock().await += 1;
        Ok(())
    }
}

fn account(handle: &str, language: &str) -> Account {
    Account {
        handle: handle.into(),
        language: language.into(),
    }
}

fn image_url(id: u64) -> String {
    format!("https://pbs.example/{}.jpg", id)
}

/// A post whose text ends with the wrapped link to its single photo.
fn photo_post(id: u64) -> SourcePost {
    let short = format!("https://t.co/m{}", id);
    SourcePost {
        id: PostId(id),
        text: format!("post {} {}", id, short),
        links: vec![LinkEntity {
            short_url: short,
            expanded_url: Some(format!("https://x.com/alice/status/{}/photo/1", id)),
            media_key: Some(format!("3_{}", id)),
        }],
        media: vec![MediaRef {
            key: format!("3_{}", id),
            kind: Some(MediaKind::Image),
            resolved_url: Some(image_url(id)),
        }],
    }
}

fn text_post(id: u64) -> SourcePost {
    SourcePost {
        id: PostId(id),
        text: format!("post {}", id),
        links: vec![],
        media: vec![],
    }
}

#[tokio::test]
async fn alice_batch_is_forwarded_in_order_and_committed() {
    let accounts = vec![account("alice", "en")];
    let source = FakeTimeline::new();
    source
        .add("alice", vec![photo_post(99), photo_post(100), photo_post(102), photo_post(101)])
        .await;
    let publisher = RecordingPublisher::default();
    let store = MemoryStore::seeded(&[("alice", 100)]).await;

    let cursors = store.load().await.unwrap();
    let mut relay = Relay::new(&accounts, &source, &publisher, &store, cursors, NO_DELAY);
    let report = relay.run_cycle().await;

    assert_eq!(
        report.outcome("alice"),
        Some(&AccountOutcome::Committed {
            forwarded: 2,
            cursor: Some(PostId(102)),
        })
    );
    assert_eq!(source.calls().await, vec![("alice".to_string(), Some(PostId(100)))]);

    let published = publisher.published().await;
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].text, "From @alice\n\npost 101");
    assert_eq!(published[1].text, "From @alice\n\npost 102");
    for call in &published {
        assert_eq!(call.media.len(), 1);
        assert_eq!(call.visibility, Visibility::Private);
        assert_eq!(call.language, "en");
    }
    assert_eq!(publisher.uploads().await, vec![image_url(101), image_url(102)]);

    assert_eq!(store.cursor("alice").await, Some(PostId(102)));
    assert_eq!(relay.cursors().get("alice"), Some(&PostId(102)));
}

#[tokio::test]
async fn second_cycle_forwards_nothing_new() {
    let accounts = vec![account("alice", "en")];
    let source = FakeTimeline::new();
    source.add("alice", vec![text_post(101), text_post(102)]).await;
    let publisher = RecordingPublisher::default();
    let store = MemoryStore::seeded(&[("alice", 100)]).await;

    let mut relay = Relay::new(&accounts, &source, &publisher, &store, store.load().await.unwrap(), NO_DELAY);
    relay.run_cycle().await;
    let second = relay.run_cycle().await;

    assert_eq!(
        second.outcome("alice"),
        Some(&AccountOutcome::Committed {
            forwarded: 0,
            cursor: Some(PostId(102)),
        })
    );
    assert_eq!(publisher.published().await.len(), 2);
    assert_eq!(source.calls().await[1], ("alice".to_string(), Some(PostId(102))));
    // An empty batch does not rewrite the store.
    assert_eq!(store.saves().await, 1);
}

#[tokio::test]
async fn publish_failure_keeps_cursor_and_replays_whole_batch() {
    let accounts = vec![account("alice", "en")];
    let source = FakeTimeline::new();
    source
        .add("alice", vec![text_post(101), text_post(102), text_post(103)])
        .await;
    let publisher = RecordingPublisher::with_results(vec![
        Ok(()),
        Err(PublishError::new(HttpFailure::RateLimited, "429")),
    ]);
    let store = MemoryStore::seeded(&[("alice", 100)]).await;

    let mut relay = Relay::new(&accounts, &source, &publisher, &store, store.load().await.unwrap(), NO_DELAY);
    let first = relay.run_cycle().await;
    assert_eq!(
        first.outcome("alice"),
        Some(&AccountOutcome::PublishFailed {
            published: 1,
            failed_post: PostId(102),
        })
    );
    assert_eq!(publisher.attempts().await.len(), 2);
    assert_eq!(store.cursor("alice").await, Some(PostId(100)));
    assert_eq!(store.saves().await, 0);
    assert_eq!(relay.cursors().get("alice"), Some(&PostId(100)));

    let second = relay.run_cycle().await;
    assert!(second.outcome("alice").unwrap().is_committed());
    assert_eq!(source.calls().await[1], ("alice".to_string(), Some(PostId(100))));

    let texts: Vec<String> = publisher
        .published()
        .await
        .into_iter()
        .map(|c| c.text)
        .collect();
    assert_eq!(
        texts,
        vec![
            "From @alice\n\npost 101",
            "From @alice\n\npost 101",
            "From @alice\n\npost 102",
            "From @alice\n\npost 103",
        ]
    );
    assert_eq!(store.cursor("alice").await, Some(PostId(103)));
}

#[tokio::test]
async fn failing_accounts_do_not_stop_the_cycle() {
    let accounts = vec![
        account("ghost", "en"),
        account("bob", "ja"),
        account("carol", "de"),
    ];
    let source = FakeTimeline::new();
    source.add("bob", vec![text_post(201)]).await;
    source.add("carol", vec![text_post(301)]).await;
    source
        .fail_next("bob", SourceError::fetch(HttpFailure::Transport, "connection reset"))
        .await;
    let publisher = RecordingPublisher::default();
    let store = MemoryStore::seeded(&[("bob", 200)]).await;

    let mut relay = Relay::new(&accounts, &source, &publisher, &store, store.load().await.unwrap(), NO_DELAY);
    let report = relay.run_cycle().await;

    let order: Vec<&str> = report.outcomes.iter().map(|(h, _)| h.as_str()).collect();
    assert_eq!(order, vec!["ghost", "bob", "carol"]);
    assert_eq!(report.outcome("ghost"), Some(&AccountOutcome::NotFound));
    assert_eq!(report.outcome("bob"), Some(&AccountOutcome::FetchFailed));
    assert!(report.outcome("carol").unwrap().is_committed());
    assert_eq!(report.committed(), 1);
    assert_eq!(report.failed(), 2);

    assert_eq!(store.cursor("ghost").await, None);
    assert_eq!(store.cursor("bob").await, Some(PostId(200)));
    assert_eq!(store.cursor("carol").await, Some(PostId(301)));

    let published = publisher.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].language, "de");

    // The transient failure clears on the next cycle.
    let report = relay.run_cycle().await;
    assert!(report.outcome("bob").unwrap().is_committed());
    assert_eq!(store.cursor("bob").await, Some(PostId(201)));
    let published = publisher.published().await;
    assert_eq!(published.last().unwrap().language, "ja");
}

#[tokio::test]
async fn failed_upload_posts_without_that_attachment() {
    let accounts = vec![account("alice", "en")];
    let mut post = photo_post(101);
    post.media.push(MediaRef {
        key: "3_extra".into(),
        kind: Some(MediaKind::Image),
        resolved_url: Some("https://pbs.example/extra.jpg".into()),
    });
    let source = FakeTimeline::new();
    source.add("alice", vec![post]).await;
    let publisher = RecordingPublisher::default();
    publisher.fail_upload(&image_url(101)).await;
    let store = MemoryStore::default();

    let mut relay = Relay::new(&accounts, &source, &publisher, &store, CursorTable::new(), NO_DELAY);
    let report = relay.run_cycle().await;

    assert!(report.outcome("alice").unwrap().is_committed());
    let published = publisher.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].media, vec![MediaHandle("media-1".into())]);
    assert_eq!(published[0].text, "From @alice\n\npost 101");
    assert_eq!(store.cursor("alice").await, Some(PostId(101)));
}

#[tokio::test]
async fn first_run_only_forwards_most_recent_window() {
    let accounts = vec![account("alice", "en")];
    let source = FakeTimeline::new();
    source.add("alice", (1..=8).map(text_post).collect()).await;
    let publisher = RecordingPublisher::default();
    let store = MemoryStore::default();

    let mut relay = Relay::new(&accounts, &source, &publisher, &store, CursorTable::new(), NO_DELAY);
    relay.run_cycle().await;

    assert_eq!(source.calls().await[0], ("alice".to_string(), None));
    let texts: Vec<String> = publisher.published().await.into_iter().map(|c| c.text).collect();
    assert_eq!(texts.len(), 5);
    assert_eq!(texts[0], "From @alice\n\npost 4");
    assert_eq!(texts[4], "From @alice\n\npost 8");
    assert_eq!(store.cursor("alice").await, Some(PostId(8)));
}

#[tokio::test]
async fn backlog_beyond_one_batch_is_skipped_for_good() {
    let accounts = vec![account("alice", "en")];
    let source = FakeTimeline::new();
    source.add("alice", (101..=108).map(text_post).collect()).await;
    let publisher = RecordingPublisher::default();
    let store = MemoryStore::seeded(&[("alice", 100)]).await;

    let mut relay = Relay::new(&accounts, &source, &publisher, &store, store.load().await.unwrap(), NO_DELAY);
    relay.run_cycle().await;
    relay.run_cycle().await;

    let texts: Vec<String> = publisher.published().await.into_iter().map(|c| c.text).collect();
    assert_eq!(texts.len(), 5);
    assert_eq!(texts[0], "From @alice\n\npost 104");
    for skipped in 101..=103 {
        let needle = format!("post {}", skipped);
        assert!(texts.iter().all(|t| !t.ends_with(&needle)));
    }
    assert_eq!(store.cursor("alice").await, Some(PostId(108)));
    assert_eq!(source.calls().await[1].1, Some(PostId(108)));
}

struct StaleSource;

#[async_trait]
impl SourceClient for StaleSource {
    async fn fetch_batch(
        &self,
        _handle: &str,
        _cursor: Option<PostId>,
    ) -> Result<Batch, SourceError> {
        Ok(Batch {
            posts: vec![],
            new_cursor: Some(PostId(50)),
        })
    }
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let accounts = vec![account("alice", "en")];
    let publisher = RecordingPublisher::default();
    let store = MemoryStore::seeded(&[("alice", 100)]).await;

    let mut relay = Relay::new(&accounts, &StaleSource, &publisher, &store, store.load().await.unwrap(), NO_DELAY);
    let report = relay.run_cycle().await;

    assert_eq!(
        report.outcome("alice"),
        Some(&AccountOutcome::Committed {
            forwarded: 0,
            cursor: Some(PostId(100)),
        })
    );
    assert_eq!(store.cursor("alice").await, Some(PostId(100)));
    assert_eq!(store.saves().await, 0);
}

/// Returns its posts without a watermark, whatever the cursor.
struct CursorlessSource;

#[async_trait]
impl SourceClient for CursorlessSource {
    async fn fetch_batch(
        &self,
        _handle: &str,
        cursor: Option<PostId>,
    ) -> Result<Batch, SourceError> {
        let posts = [text_post(101), text_post(103), text_post(102)]
            .into_iter()
            .filter(|p| cursor.map_or(true, |c| p.id > c))
            .collect();
        Ok(Batch {
            posts,
            new_cursor: None,
        })
    }
}

#[tokio::test]
async fn missing_batch_cursor_falls_back_to_newest_post() {
    let accounts = vec![account("alice", "en")];
    let publisher = RecordingPublisher::default();
    let store = MemoryStore::seeded(&[("alice", 100)]).await;

    let mut relay = Relay::new(&accounts, &CursorlessSource, &publisher, &store, store.load().await.unwrap(), NO_DELAY);
    let first = relay.run_cycle().await;
    assert_eq!(
        first.outcome("alice"),
        Some(&AccountOutcome::Committed {
            forwarded: 3,
            cursor: Some(PostId(103)),
        })
    );
    assert_eq!(store.cursor("alice").await, Some(PostId(103)));

    relay.run_cycle().await;
    assert_eq!(publisher.published().await.len(), 3);
}

#[tokio::test]
async fn store_failure_reverts_cursor_and_batch_is_replayed() {
    let accounts = vec![account("alice", "en")];
    let source = FakeTimeline::new();
    source.add("alice", vec![text_post(101)]).await;
    let publisher = RecordingPublisher::default();
    let store = MemoryStore::seeded(&[("alice", 100)]).await;
    store.set_failing(true).await;

    let mut relay = Relay::new(&accounts, &source, &publisher, &store, store.load().await.unwrap(), NO_DELAY);
    let report = relay.run_cycle().await;
    assert_eq!(
        report.outcome("alice"),
        Some(&AccountOutcome::StoreFailed { forwarded: 1 })
    );
    assert_eq!(relay.cursors().get("alice"), Some(&PostId(100)));

    store.set_failing(false).await;
    relay.run_cycle().await;
    assert_eq!(publisher.published().await.len(), 2);
    assert_eq!(store.cursor("alice").await, Some(PostId(101)));
}

#[tokio::test]
async fn run_forever_stops_when_shutdown_resolves() {
    let accounts = vec![account("alice", "en")];
    let source = FakeTimeline::new();
    source.add("alice", vec![text_post(101)]).await;
    let publisher = RecordingPublisher::default();
    let store = MemoryStore::default();
    let pacing = Pacing::from_secs(0, 3600);

    let mut relay = Relay::new(&accounts, &source, &publisher, &store, CursorTable::new(), pacing);
    tokio::time::timeout(Duration::from_secs(5), relay.run_forever(async {}))
        .await
        .expect("relay should stop instead of sleeping a full cycle");

    assert_eq!(publisher.published().await.len(), 1);
    assert_eq!(store.cursor("alice").await, Some(PostId(101)));
}
