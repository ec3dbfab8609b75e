//! Re-fetches article payloads that were evicted before a repost.
//!
//! A single worker serializes reloads so a burst of evicted reposts cannot
//! re-read everything at once. Each queued job holds a reservation in the
//! article queue, so the payload goes straight back to a posting worker
//! without competing with fresh input.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::error::{Error, Result};

use super::Engine;

pub(super) async fn run(engine: Arc<Engine>) -> Result<()> {
    loop {
        let job = tokio::select! {
            biased;
            _ = engine.cancel.cancelled() => return Ok(()),
            job = engine.reload_queue.pop() => job,
        };
        let Some(job) = job else { return Ok(()) };
        if let Err(err) = job.article.reload().await {
            return Err(Error::Reload(err.to_string()));
        }
        engine.counters.articles_re_read.fetch_add(1, Ordering::SeqCst);
        debug!(
            message_id = job.message_id.as_deref().unwrap_or("<none>"),
            "article payload re-read for reposting"
        );
        engine.post_queue.fulfill(job);
    }
}
