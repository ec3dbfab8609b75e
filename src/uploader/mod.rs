//! The upload engine.
//!
//! An [`Uploader`] owns a pipeline of worker tasks over the queueing
//! primitives in this crate: posting workers drain the article queue and
//! submit to the wire, checking workers verify posted articles after a
//! settle delay, and a reload worker re-fetches payloads whose bytes were
//! evicted before a repost. Articles flow between them as jobs that live in
//! exactly one queue or worker at a time.

mod check_worker;
mod completion;
mod control;
mod post_worker;
mod reload;
mod stats;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::article::{OutcomeReceiver, PostArticle, PostJob};
use crate::bounded_queue::BoundedQueue;
use crate::config::UploadConfig;
use crate::connection::Connector;
use crate::delayed_queue::DelayedQueue;
use crate::error::{Error, Result, SkipSet};
use crate::rate_limiter::RateLimiter;
use crate::retention_cache::{CacheHandle, RetentionCache};
use crate::types::{Event, UploadReport, UploadStats};

use self::stats::{Counters, UploadTimeTracker};

/// Buffered events per subscriber; slow subscribers lag rather than block
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Orchestrates a single upload run.
///
/// Construction validates the configuration and spawns the worker pools.
/// Articles are submitted with [`add_post`](Uploader::add_post); once the
/// producer has no more, it calls [`finished`](Uploader::finished) and
/// awaits [`wait`](Uploader::wait) for the final report.
pub struct Uploader {
    engine: Arc<Engine>,
    done_rx: Mutex<Option<oneshot::Receiver<Result<UploadReport>>>>,
}

impl Uploader {
    /// Validates `config` and starts the worker pools.
    ///
    /// `connectors` supplies the wire implementation, one per entry in
    /// `config.servers` in the same order; each posting and checking slot
    /// opens its own session from its server's connector.
    pub fn new(config: UploadConfig, connectors: Vec<Arc<dyn Connector>>) -> Result<Self> {
        config.validate()?;
        if connectors.len() != config.servers.len() {
            return Err(Error::Config {
                message: format!(
                    "expected one connector per server ({}), got {}",
                    config.servers.len(),
                    connectors.len()
                ),
                key: Some("servers".to_string()),
            });
        }

        let engine = Arc::new(Engine::new(config));
        let mut workers = JoinSet::new();
        for (server_idx, connector) in connectors.iter().enumerate() {
            let server = &engine.config.servers[server_idx];
            for slot in 0..server.post_connections {
                workers.spawn(post_worker::run(
                    Arc::clone(&engine),
                    server_idx,
                    slot,
                    Arc::clone(connector),
                ));
            }
            if engine.num_check_conns > 0 {
                for slot in 0..server.check_connections {
                    workers.spawn(check_worker::run(
                        Arc::clone(&engine),
                        server_idx,
                        slot,
                        Arc::clone(connector),
                    ));
                }
            }
        }
        workers.spawn(reload::run(Arc::clone(&engine)));

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(supervise(Arc::clone(&engine), workers, done_tx));

        Ok(Self {
            engine,
            done_rx: Mutex::new(Some(done_rx)),
        })
    }

    /// Submits one article for posting.
    ///
    /// Suspends while the article queue is at capacity. The returned
    /// receiver resolves exactly once with the article's terminal outcome;
    /// dropping it is fine and does not affect the upload.
    pub async fn add_post(&self, article: Arc<dyn PostArticle>) -> Result<OutcomeReceiver> {
        if self.engine.is_cancelled() {
            return Err(Error::Cancelled("upload has been aborted".to_string()));
        }
        if self.engine.input_finished.load(Ordering::SeqCst) {
            return Err(Error::Internal(
                "article submitted after finished()".to_string(),
            ));
        }
        self.engine.counters.articles_read.fetch_add(1, Ordering::SeqCst);
        let (job, outcome_rx) = PostJob::new(article);
        self.engine.post_queue.push(job).await;
        Ok(outcome_rx)
    }

    /// Subscribes to run events. Every call gets an independent receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.engine.event_tx.subscribe()
    }

    /// Point-in-time snapshot of the run counters
    pub fn stats(&self) -> UploadStats {
        self.engine.counters.snapshot()
    }

    /// Wall time so far during which at least one post was in flight.
    ///
    /// Useful as the denominator for raw network upload speed; idle gaps
    /// (input starvation, check-only phases) are not counted.
    pub fn upload_time(&self) -> std::time::Duration {
        self.engine.upload_time.value()
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("stats", &self.engine.counters.snapshot())
            .finish_non_exhaustive()
    }
}

/// Waits for every worker to settle, then resolves the run outcome
async fn supervise(
    engine: Arc<Engine>,
    mut workers: JoinSet<Result<()>>,
    done_tx: oneshot::Sender<Result<UploadReport>>,
) {
    while let Some(joined) = workers.join_next().await {
        let result = joined
            .unwrap_or_else(|err| Err(Error::Internal(format!("worker task failed: {err}"))));
        if let Err(err) = result {
            engine.fail(err);
        }
    }
    let outcome = match engine.take_fatal() {
        Some(err) => Err(err),
        None => {
            engine.emit(Event::Complete);
            Ok(engine.report())
        }
    };
    let _ = done_tx.send(outcome);
}

/// Payload retention between post and successful check.
///
/// When post retries are disabled there is nothing to repost, so bodies are
/// released the moment they are posted instead of being cached.
pub(crate) enum CheckCache {
    Disabled,
    Active(RetentionCache<Arc<dyn PostArticle>>),
}

/// Shared state behind every worker task
pub(crate) struct Engine {
    pub(crate) config: UploadConfig,
    pub(crate) skip: SkipSet,
    /// Connections able to check, counting reused posting connections
    pub(crate) num_check_conns: usize,
    pub(crate) post_queue: BoundedQueue<PostJob>,
    pub(crate) check_queue: DelayedQueue<PostJob>,
    pub(crate) reload_queue: BoundedQueue<PostJob>,
    pub(crate) check_cache: CheckCache,
    /// One per server, index-aligned with `config.servers`
    pub(crate) limiters: Vec<RateLimiter>,
    pub(crate) counters: Counters,
    pub(crate) upload_time: UploadTimeTracker,
    event_tx: broadcast::Sender<Event>,
    pub(crate) cancel: CancellationToken,
    cancelled: AtomicBool,
    input_finished: AtomicBool,
    /// Set exactly once when every article reached a terminal state
    ended: AtomicBool,
    fatal: Mutex<Option<Error>>,
    pub(crate) active_post_conns: AtomicUsize,
    pub(crate) active_check_conns: AtomicUsize,
    warned_check_full: AtomicBool,
    warned_input_slow: AtomicBool,
    started_at: DateTime<Utc>,
}

impl Engine {
    fn new(config: UploadConfig) -> Self {
        let skip = config.skip_errors.to_skip_set();
        let num_check_conns = config.num_check_connections();
        let post_queue = BoundedQueue::new(config.effective_queue_buffer());
        let check_queue = DelayedQueue::new(config.check.queue_buffer);
        // reservations are the only way into the reload queue, so it
        // carries no capacity of its own
        let reload_queue = BoundedQueue::new(0);
        let check_cache = if num_check_conns == 0 || config.check.post_retries == 0 {
            CheckCache::Disabled
        } else {
            CheckCache::Active(RetentionCache::new(
                config.effective_cache_size(),
                |body: Arc<dyn PostArticle>| body.release(),
            ))
        };
        let limiters = config
            .servers
            .iter()
            .map(|s| match &s.throttle {
                Some(t) => RateLimiter::new(t.bytes, t.period),
                None => RateLimiter::new(0, std::time::Duration::ZERO),
            })
            .collect();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let active_post_conns = AtomicUsize::new(config.num_post_connections());
        let active_check_conns =
            AtomicUsize::new(config.servers.iter().map(|s| s.check_connections).sum());

        Self {
            skip,
            num_check_conns,
            post_queue,
            check_queue,
            reload_queue,
            check_cache,
            limiters,
            counters: Counters::default(),
            upload_time: UploadTimeTracker::default(),
            event_tx,
            cancel: CancellationToken::new(),
            cancelled: AtomicBool::new(false),
            input_finished: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            fatal: Mutex::new(None),
            active_post_conns,
            active_check_conns,
            warned_check_full: AtomicBool::new(false),
            warned_input_slow: AtomicBool::new(false),
            started_at: Utc::now(),
            config,
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Records the first run-fatal error and tears the pipeline down.
    ///
    /// Later fatal errors are usually knock-on effects of the teardown and
    /// are logged at debug only.
    pub(crate) fn fail(&self, err: Error) {
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
            if fatal.is_some() {
                debug!(error = %err, "suppressing subsequent fatal error");
                return;
            }
            *fatal = Some(err);
        }
        self.abort();
    }

    fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Unblocks every worker so the pipeline can wind down
    fn abort(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        for limiter in &self.limiters {
            limiter.cancel_all();
        }
        self.check_queue.flush_pending(true);
        self.post_queue.finished();
        self.check_queue.finished();
        self.reload_queue.finished();
    }

    /// Counts a tolerated article failure against the run-wide error limit
    pub(crate) fn mark_post_error(&self, job: &mut PostJob, desc: String) {
        match &job.message_id {
            Some(id) => error!(message_id = %id, "error posting article: {desc}; article skipped"),
            None => error!("error posting article: {desc}; article skipped"),
        }
        // each article counts once, no matter how many times it fails
        if job.error_count == 0 {
            let total = self.counters.article_errors.fetch_add(1, Ordering::SeqCst) + 1;
            if self.config.max_post_errors > 0 && total > self.config.max_post_errors {
                self.fail(Error::MaxErrorsExceeded);
            }
        }
        job.error_count += 1;
        job.last_error = Some(desc);
    }

    /// Books a job's departure from the check queue against the counters
    pub(crate) fn note_check_taken(&self, job: &PostJob) {
        if job.check_failures > 0 {
            dec(&self.counters.check_re_pending);
            self.counters.articles_rechecked.fetch_add(1, Ordering::SeqCst);
        } else {
            dec(&self.counters.check_pending);
        }
    }

    /// Retains a posted body for a possible repost; returns `None` when
    /// retention is disabled (the body is released instead)
    pub(crate) fn retain_body(&self, body: Arc<dyn PostArticle>) -> Option<CacheHandle> {
        match &self.check_cache {
            CheckCache::Disabled => {
                body.release();
                None
            }
            CheckCache::Active(cache) => match cache.try_insert(body, true) {
                Ok(handle) => Some(handle),
                // every entry is evictable, so a full cache always makes
                // room; reaching this arm is a bookkeeping bug
                Err(body) => {
                    error!("retention cache refused an evictable entry");
                    body.release();
                    None
                }
            },
        }
    }

    /// Drops a job's retention entry without releasing the payload, leaving
    /// the bytes available for a repost if they have not been evicted
    pub(crate) fn unretain(&self, job: &mut PostJob) {
        if let Some(handle) = job.cache_handle.take() {
            if let CheckCache::Active(cache) = &self.check_cache {
                cache.remove(handle);
            }
        }
    }

    fn report(&self) -> UploadReport {
        UploadReport {
            stats: self.counters.snapshot(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            upload_time: self.upload_time.value(),
        }
    }
}

fn dec(counter: &AtomicU64) {
    counter.fetch_sub(1, Ordering::SeqCst);
}

/// Runs `fut` unless the run aborts first
async fn with_cancel<F>(engine: &Engine, fut: F) -> Option<F::Output>
where
    F: std::future::Future,
{
    tokio::select! {
        biased;
        _ = engine.cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
