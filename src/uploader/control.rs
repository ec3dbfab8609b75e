//! Run lifecycle controls: end-of-input, cancellation, and waiting.

use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::types::{Event, UploadReport};

use super::Uploader;

impl Uploader {
    /// Signals that no more articles will be submitted.
    ///
    /// The run completes once every already-submitted article reaches a
    /// terminal state. Safe to call more than once.
    pub fn finished(&self) {
        let engine = &self.engine;
        if engine.input_finished.swap(true, Ordering::SeqCst) {
            return;
        }
        // with reposting possible, the article queue must stay open for
        // articles coming back from failed checks; completion closes it
        if engine.num_check_conns == 0 || engine.config.check.post_retries == 0 {
            engine.post_queue.finished();
        }
        engine.check_completion();
    }

    /// Aborts the run.
    ///
    /// In-flight work is dropped, queued articles are discarded, and
    /// [`wait`](Uploader::wait) resolves with [`Error::Cancelled`]. A run
    /// that already completed is unaffected.
    pub fn cancel(&self, reason: impl Into<String>) {
        let engine = &self.engine;
        if engine.ended.load(Ordering::SeqCst) || engine.is_cancelled() {
            return;
        }
        engine.emit(Event::Cancelled);
        engine.fail(Error::Cancelled(reason.into()));
    }

    /// Waits for the run to end and returns the final report.
    ///
    /// Resolves with the first run-fatal error if the pipeline aborted.
    /// May be called at most once; later calls fail.
    pub async fn wait(&self) -> Result<UploadReport> {
        let rx = self
            .done_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match rx {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(Error::Internal("engine task dropped".to_string()))),
            None => Err(Error::Internal("wait() may only be called once".to_string())),
        }
    }
}
