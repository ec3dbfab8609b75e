//! Terminal accounting: per-article retirement and end-of-run detection.

use std::sync::atomic::Ordering;

use tracing::{debug, error};

use crate::article::{ArticleOutcome, PostJob};
use crate::types::Event;

use super::Engine;

impl Engine {
    /// Retires one article.
    ///
    /// Frees the retained payload, counts the article as terminally
    /// checked, delivers its outcome exactly once, and ends the run if this
    /// was the last article outstanding. `job.successful` and
    /// `job.last_error` must already reflect the terminal state.
    pub(crate) fn finalize(&self, mut job: PostJob) {
        self.unretain(&mut job);
        job.article.release();
        self.counters.articles_checked.fetch_add(1, Ordering::SeqCst);
        debug!(
            message_id = job.message_id.as_deref().unwrap_or("<none>"),
            successful = job.successful,
            "article finalized"
        );
        if let Some(tx) = job.done_tx.take() {
            // the submitter may have dropped its receiver
            let _ = tx.send(ArticleOutcome {
                successful: job.successful,
                message_id: job.message_id.clone(),
                error: job.last_error.clone(),
            });
        }
        self.check_completion();
    }

    /// Retires one article as a tolerated failure
    pub(crate) fn finalize_errored(&self, mut job: PostJob, desc: String) {
        self.mark_post_error(&mut job, desc.clone());
        job.successful = false;
        self.emit(Event::ArticleFailed {
            message_id: job.message_id.clone(),
            error: desc,
        });
        self.finalize(job);
    }

    /// Ends the run once input is closed and every article is terminal.
    ///
    /// Idempotent; called from every finalization and from `finished()` so
    /// a run whose last article retires before the producer signals the end
    /// of input still terminates.
    pub(crate) fn check_completion(&self) {
        if !self.input_finished.load(Ordering::SeqCst) {
            return;
        }
        let read = self.counters.articles_read.load(Ordering::SeqCst);
        let checked = self.counters.articles_checked.load(Ordering::SeqCst);
        if checked < read {
            return;
        }
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        // a non-empty queue here means an article was double-counted
        // somewhere; log it and wind down anyway
        if !self.post_queue.is_empty() || !self.check_queue.is_empty() {
            error!(
                post_queued = self.post_queue.len(),
                check_queued = self.check_queue.len(),
                "articles left queued at completion"
            );
        }
        self.post_queue.finished();
        self.check_queue.finished();
        self.reload_queue.finished();
    }
}
