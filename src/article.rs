//! The consumed article capability and the engine's per-article work item.
//!
//! The engine never reads source files or encodes bodies itself; producers
//! hand it values implementing [`PostArticle`]. Payload bytes may be
//! released to save memory while an article sits in the check pipeline and
//! re-fetched through [`PostArticle::reload`] if a repost becomes necessary.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Error;

/// One encoded unit of content to be posted and (optionally) verified.
///
/// Implementations must be safe to share between the check pipeline and the
/// retention cache: `release`/`reload` and `data` may race and should be
/// internally synchronized.
#[async_trait]
pub trait PostArticle: Send + Sync {
    /// Encoded size of the article body in bytes
    fn size(&self) -> u64;

    /// Current payload bytes, or `None` once released
    fn data(&self) -> Option<Arc<[u8]>>;

    /// Re-fetch the payload after it was released
    async fn reload(&self) -> Result<(), Error>;

    /// Free the payload bytes early to reclaim memory
    fn release(&self);
}

/// Terminal result of one article's lifecycle, delivered exactly once
#[derive(Clone, Debug)]
pub struct ArticleOutcome {
    /// Whether the article was posted (and, if configured, verified)
    pub successful: bool,
    /// Message-id assigned by the server on the last successful post
    pub message_id: Option<String>,
    /// Description of the tolerated failure, when `successful` is false
    pub error: Option<String>,
}

/// Receiver half of an article's completion notification
///
/// Returned by [`Uploader::add_post`](crate::Uploader::add_post); resolves
/// when the article reaches a terminal state. Dropped receivers are fine —
/// completion delivery is best-effort, the run-level counters are
/// authoritative.
pub type OutcomeReceiver = oneshot::Receiver<ArticleOutcome>;

/// Work item driven through the post → check → retry pipeline.
///
/// Owned exclusively by whichever queue or worker currently holds it; the
/// retention cache only keeps a clone of the body `Arc` so eviction can
/// release bytes without touching the job.
pub(crate) struct PostJob {
    /// The producer-supplied article body
    pub(crate) article: Arc<dyn PostArticle>,
    /// Message-id assigned after a successful post
    pub(crate) message_id: Option<String>,
    /// Number of times this article has been posted
    pub(crate) post_tries: u32,
    /// Consecutive failed verification attempts since the last post
    pub(crate) check_failures: u32,
    /// Number of tolerated errors recorded against this article
    pub(crate) error_count: u32,
    /// Terminal success flag
    pub(crate) successful: bool,
    /// Retention cache slot holding this article's body, if any
    pub(crate) cache_handle: Option<crate::retention_cache::CacheHandle>,
    /// Completion notification, consumed by finalization
    pub(crate) done_tx: Option<oneshot::Sender<ArticleOutcome>>,
    /// Last tolerated-failure description, surfaced in the outcome
    pub(crate) last_error: Option<String>,
}

impl PostJob {
    pub(crate) fn new(article: Arc<dyn PostArticle>) -> (Self, OutcomeReceiver) {
        let (done_tx, done_rx) = oneshot::channel();
        let job = Self {
            article,
            message_id: None,
            post_tries: 0,
            check_failures: 0,
            error_count: 0,
            successful: false,
            cache_handle: None,
            done_tx: Some(done_tx),
            last_error: None,
        };
        (job, done_rx)
    }
}

impl std::fmt::Debug for PostJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostJob")
            .field("message_id", &self.message_id)
            .field("size", &self.article.size())
            .field("post_tries", &self.post_tries)
            .field("check_failures", &self.check_failures)
            .field("error_count", &self.error_count)
            .field("successful", &self.successful)
            .finish_non_exhaustive()
    }
}
