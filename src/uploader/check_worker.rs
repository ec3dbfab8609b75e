//! Checking workers: verify posted articles and drive recheck/repost.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::article::PostJob;
use crate::config::CheckConfig;
use crate::connection::{Connector, NntpConnection};
use crate::error::{ConnectionError, Error, ErrorKind, Result, SkipClass};
use crate::types::Event;

use super::{Engine, with_cancel};

/// Entry point for one dedicated checking slot
pub(super) async fn run(
    engine: Arc<Engine>,
    server_idx: usize,
    slot: usize,
    connector: Arc<dyn Connector>,
) -> Result<()> {
    let mut conn = connector.open();
    let result = check_loop(&engine, server_idx, slot, conn.as_mut()).await;
    conn.close().await;
    let remaining = engine.active_check_conns.fetch_sub(1, Ordering::SeqCst) - 1;
    match result {
        Err(Error::Connection(err))
            if err.kind == ErrorKind::ConnectFail
                && engine.skip.contains(SkipClass::ConnectFail) =>
        {
            warn!(server = server_idx, slot, error = %err, "checking connection lost");
            if remaining == 0 {
                Err(Error::NoCheckConnections)
            } else {
                Ok(())
            }
        }
        other => other,
    }
}

async fn check_loop(
    engine: &Engine,
    server_idx: usize,
    slot: usize,
    conn: &mut dyn NntpConnection,
) -> Result<()> {
    let mut connected = false;
    if !engine.config.lazy_connect {
        // nothing can be due before the first article's settle delay
        if with_cancel(engine, tokio::time::sleep(engine.config.check.delay))
            .await
            .is_none()
        {
            return Ok(());
        }
        if !ensure_connected(engine, server_idx, slot, conn, &mut connected).await? {
            return Ok(());
        }
    }

    loop {
        let job = tokio::select! {
            biased;
            _ = engine.cancel.cancelled() => return Ok(()),
            job = engine.check_queue.pop() => job,
        };
        let Some(job) = job else { return Ok(()) };
        engine.note_check_taken(&job);
        match ensure_connected(engine, server_idx, slot, conn, &mut connected).await {
            Ok(true) => check_post(engine, conn, job).await?,
            Ok(false) => return Ok(()),
            Err(err) => {
                // the session never came up; hand the article to another slot
                requeue_check(engine, job);
                return Err(err);
            }
        }
    }
}

/// Open the session on first use; `Ok(false)` means the run was aborted
async fn ensure_connected(
    engine: &Engine,
    server_idx: usize,
    slot: usize,
    conn: &mut dyn NntpConnection,
    connected: &mut bool,
) -> Result<bool> {
    if *connected {
        return Ok(true);
    }
    match with_cancel(engine, conn.connect()).await {
        None => Ok(false),
        Some(Ok(())) => {
            *connected = true;
            let server = &engine.config.servers[server_idx];
            debug!(server = %server.name, slot, "checking connection established");
            Ok(true)
        }
        Some(Err(err)) => Err(err.into()),
    }
}

/// Put an already-taken job back on the check queue, restoring the pending
/// counter consumed when it was taken
pub(super) fn requeue_check(engine: &Engine, job: PostJob) {
    if job.check_failures > 0 {
        engine.counters.check_re_pending.fetch_add(1, Ordering::SeqCst);
    } else {
        engine.counters.check_pending.fetch_add(1, Ordering::SeqCst);
    }
    engine.check_queue.force_push(Duration::ZERO, job);
}

/// Runs one verification attempt for a posted article and routes the
/// result: finalize on success, recheck while tries remain, repost once
/// checks are exhausted and retries allow it, otherwise fail the article
/// or the run.
///
/// Also called from posting workers that reuse their connection for checks.
pub(super) async fn check_post(
    engine: &Engine,
    conn: &mut dyn NntpConnection,
    mut job: PostJob,
) -> Result<()> {
    if engine.is_cancelled() {
        return Ok(());
    }
    let message_id = match job.message_id.clone() {
        Some(id) => id,
        None => {
            return Err(Error::Internal(
                "check scheduled for an unposted article".to_string(),
            ));
        }
    };

    engine.counters.check_active.fetch_add(1, Ordering::SeqCst);
    let result = with_cancel(engine, conn.stat(&message_id)).await;
    engine.counters.check_active.fetch_sub(1, Ordering::SeqCst);

    let Some(result) = result else {
        return Ok(());
    };
    if engine.is_cancelled() {
        return Ok(());
    }

    let found = match result {
        Ok(found) => found,
        Err(err) => return check_error(engine, job, err),
    };

    if found {
        debug!(message_id = %message_id, "article verified");
        job.successful = true;
        engine.emit(Event::ArticleVerified { message_id });
        engine.finalize(job);
        return Ok(());
    }

    job.check_failures += 1;
    engine.emit(Event::CheckMissing {
        message_id: message_id.clone(),
        failures: job.check_failures,
    });
    let check = &engine.config.check;

    if job.check_failures < check.tries {
        debug!(
            message_id = %message_id,
            failures = job.check_failures,
            "article not found yet; will recheck"
        );
        engine.counters.check_re_pending.fetch_add(1, Ordering::SeqCst);
        engine.check_queue.force_push(recheck_delay(check), job);
        return Ok(());
    }

    if job.post_tries <= check.post_retries {
        warn!(
            message_id = %message_id,
            post_tries = job.post_tries,
            "article could not be found after all checks; re-posting"
        );
        engine.counters.articles_posted.fetch_sub(1, Ordering::SeqCst);
        engine
            .counters
            .bytes_posted
            .fetch_sub(job.article.size(), Ordering::SeqCst);
        engine.counters.articles_re_posted.fetch_add(1, Ordering::SeqCst);
        engine.unretain(&mut job);
        engine.emit(Event::ArticleReposted { message_id });
        if job.article.data().is_some() {
            engine.post_queue.push_nowait(job);
        } else {
            // payload was evicted; hold a queue slot while it reloads
            engine.post_queue.reserve();
            engine.reload_queue.push_nowait(job);
        }
        return Ok(());
    }

    if engine.skip.contains(SkipClass::CheckMissing) {
        let desc = format!("article {message_id} could not be found on the server");
        engine.finalize_errored(job, desc);
        Ok(())
    } else {
        Err(Error::ArticleNotFound { message_id })
    }
}

/// Routes a failed verification request
fn check_error(engine: &Engine, job: PostJob, err: ConnectionError) -> Result<()> {
    match err.kind {
        ErrorKind::Timeout if engine.skip.contains(SkipClass::CheckTimeout) => {
            engine.finalize_errored(job, "post check timed out".to_string());
            Ok(())
        }
        ErrorKind::ConnectFail => {
            // connection is dead; hand the article to another checking slot
            // and let the caller decide whether losing this one is fatal
            requeue_check(engine, job);
            Err(Error::Connection(err))
        }
        ErrorKind::ConnectionEnded | ErrorKind::NotConnected => Err(Error::Connection(err)),
        _ if engine.skip.contains(SkipClass::CheckFail) => {
            let desc = format!("post check request failed ({})", err.message);
            engine.finalize_errored(job, desc);
            Ok(())
        }
        _ => Err(Error::Connection(err)),
    }
}

fn recheck_delay(check: &CheckConfig) -> Duration {
    if check.jitter {
        // spread rechecks out so bursts of misses do not re-query in
        // lockstep
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        check.recheck_delay.mul_f64(factor)
    } else {
        check.recheck_delay
    }
}
