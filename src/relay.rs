//! The poll loop: fetch, transform and publish every tracked account in turn,
//! committing each account's cursor only after its whole batch went out.
//!
//! Delivery is at-least-once. A publish failure (or a crash) before the
//! cursor is saved means the same batch is fetched again next cycle, so
//! posts that already went out in that batch are published a second time.
//! When an account produces more than one batch worth of posts between two
//! cycles, only the newest batch is returned by the source and the older
//! posts are never forwarded.
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::error::SourceError;
use crate::model::{Account, CursorTable, MediaHandle, PostId, Visibility};
use crate::publish::Publisher;
use crate::source::SourceClient;
use crate::state::CursorStore;
use crate::transform::transform;

/// Reposts are never public.
pub const REPOST_VISIBILITY: Visibility = Visibility::Private;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Pause between two accounts (destination API courtesy).
    pub account_delay: Duration,
    /// Pause between two full cycles (source API courtesy).
    pub cycle_delay: Duration,
}

impl Pacing {
    pub fn from_secs(account_delay: u64, cycle_delay: u64) -> Self {
        Self {
            account_delay: Duration::from_secs(account_delay),
            cycle_delay: Duration::from_secs(cycle_delay),
        }
    }
}

/// How one account's turn in a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountOutcome {
    /// Every post was attempted; `cursor` is what is now stored.
    Committed {
        forwarded: usize,
        cursor: Option<PostId>,
    },
    NotFound,
    FetchFailed,
    /// The batch was abandoned at `failed_post`; cursor left as it was.
    PublishFailed {
        published: usize,
        failed_post: PostId,
    },
    /// Posts went out but the cursor could not be persisted.
    StoreFailed { forwarded: usize },
}

impl AccountOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, AccountOutcome::Committed { .. })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcomes: Vec<(String, AccountOutcome)>,
}

impl CycleReport {
    pub fn committed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_committed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.committed()
    }

    pub fn forwarded(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                AccountOutcome::Committed { forwarded, .. } => *forwarded,
                AccountOutcome::StoreFailed { forwarded } => *forwarded,
                AccountOutcome::PublishFailed { published, .. } => *published,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome(&self, handle: &str) -> Option<&AccountOutcome> {
        self.outcomes
            .iter()
            .find(|(h, _)| h == handle)
            .map(|(_, o)| o)
    }
}

pub struct Relay<'a> {
    accounts: &'a [Account],
    source: &'a dyn SourceClient,
    publisher: &'a dyn Publisher,
    store: &'a dyn CursorStore,
    pacing: Pacing,
    cursors: CursorTable,
}

impl<'a> Relay<'a> {
    /// `cursors` is the table loaded from `store` at startup.
    pub fn new(
        accounts: &'a [Account],
        source: &'a dyn SourceClient,
        publisher: &'a dyn Publisher,
        store: &'a dyn CursorStore,
        cursors: CursorTable,
        pacing: Pacing,
    ) -> Self {
        Self {
            accounts,
            source,
            publisher,
            store,
            pacing,
            cursors,
        }
    }

    pub fn cursors(&self) -> &CursorTable {
        &self.cursors
    }

    /// One pass over every account, in configuration order.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let never = std::future::pending::<()>();
        tokio::pin!(never);
        let (report, _) = self.cycle(never.as_mut()).await;
        report
    }

    /// Cycle until `shutdown` resolves. Shutdown is only observed while
    /// pausing, never in the middle of an account's batch.
    pub async fn run_forever<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let (report, stopped) = self.cycle(shutdown.as_mut()).await;
            info!(
                accounts = report.outcomes.len(),
                committed = report.committed(),
                failed = report.failed(),
                forwarded = report.forwarded(),
                "cycle finished"
            );
            if stopped {
                break;
            }
            info!(
                secs = self.pacing.cycle_delay.as_secs(),
                "waiting for next cycle"
            );
            tokio::select! {
                _ = shutdown.as_mut() => break,
                _ = tokio::time::sleep(self.pacing.cycle_delay) => {}
            }
        }
        info!("shutdown requested; relay stopped");
    }

    async fn cycle<F>(&mut self, mut shutdown: Pin<&mut F>) -> (CycleReport, bool)
    where
        F: Future<Output = ()>,
    {
        let mut report = CycleReport::default();
        let accounts = self.accounts;
        for (i, account) in accounts.iter().enumerate() {
            if i > 0 && !self.pacing.account_delay.is_zero() {
                tokio::select! {
                    _ = shutdown.as_mut() => return (report, true),
                    _ = tokio::time::sleep(self.pacing.account_delay) => {}
                }
            }
            let outcome = self.process_account(account).await;
            report.outcomes.push((account.handle.clone(), outcome));
        }
        (report, false)
    }

    /// Idle → Fetching → Transforming → Publishing → Committing for one account.
    /// Never fails: every error is logged and reported as an outcome.
    #[instrument(skip_all, fields(handle = %account.handle))]
    pub async fn process_account(&mut self, account: &Account) -> AccountOutcome {
        let before = self.cursors.get(&account.handle).copied();
        info!(cursor = ?before, "started crawling");

        let batch = match self.source.fetch_batch(&account.handle, before).await {
            Ok(batch) => batch,
            Err(SourceError::AccountNotFound(_)) => {
                warn!("source account not found; nothing to forward this cycle");
                return AccountOutcome::NotFound;
            }
            Err(err) => {
                warn!(?err, "fetch failed; cursor left untouched");
                return AccountOutcome::FetchFailed;
            }
        };

        let mut published = 0;
        for post in &batch.posts {
            let out = transform(post, &account.handle);
            let media = self.upload_all(&out.media_urls, post.id).await;
            match self
                .publisher
                .publish(&out.text, &media, REPOST_VISIBILITY, &account.language)
                .await
            {
                Ok(receipt) => {
                    published += 1;
                    debug!(post_id = %post.id, status_id = %receipt.id, media = media.len(), "post forwarded");
                }
                Err(err) => {
                    error!(
                        post_id = %post.id,
                        published,
                        ?err,
                        "publish failed; abandoning batch without advancing cursor"
                    );
                    return AccountOutcome::PublishFailed {
                        published,
                        failed_post: post.id,
                    };
                }
            }
        }

        let newest = batch
            .new_cursor
            .or_else(|| batch.posts.iter().map(|p| p.id).max());
        let next = match (newest, before) {
            (Some(new), Some(old)) => {
                if new < old {
                    warn!(%new, %old, "source returned an older cursor; keeping stored one");
                }
                Some(new.max(old))
            }
            (new, old) => new.or(old),
        };

        if next == before {
            info!(forwarded = published, "done crawling; cursor unchanged");
            return AccountOutcome::Committed {
                forwarded: published,
                cursor: before,
            };
        }

        if let Some(id) = next {
            self.cursors.insert(account.handle.clone(), id);
        }
        if let Err(err) = self.store.save(&self.cursors).await {
            error!(?err, "failed to persist cursor; batch will be fetched again");
            match before {
                Some(old) => self.cursors.insert(account.handle.clone(), old),
                None => self.cursors.remove(&account.handle),
            };
            return AccountOutcome::StoreFailed {
                forwarded: published,
            };
        }

        info!(forwarded = published, cursor = ?next, "done crawling");
        AccountOutcome::Committed {
            forwarded: published,
            cursor: next,
        }
    }

    /// Best effort: a failed upload drops that attachment only.
    async fn upload_all(&self, urls: &[String], post_id: PostId) -> Vec<MediaHandle> {
        let mut handles = Vec::with_capacity(urls.len());
        for url in urls {
            match self.publisher.upload_media(url).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(%post_id, %url, ?err, "media upload failed; posting without it")
                }
            }
        }
        handles
    }
}
