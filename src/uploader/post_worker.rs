//! Posting workers: drain the article queue and submit to the wire.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::article::PostJob;
use crate::connection::{Connector, NntpConnection};
use crate::error::{Error, ErrorKind, Result, SkipClass};
use crate::types::Event;

use super::{Engine, check_worker, with_cancel};

/// How long the article queue must sit empty before we point the finger
/// at input generation
const INPUT_STALL_WARN_AFTER: Duration = Duration::from_secs(1);

/// Entry point for one posting slot
pub(super) async fn run(
    engine: Arc<Engine>,
    server_idx: usize,
    slot: usize,
    connector: Arc<dyn Connector>,
) -> Result<()> {
    let mut conn = connector.open();
    let result = post_loop(&engine, server_idx, slot, conn.as_mut()).await;
    conn.close().await;
    let remaining = engine.active_post_conns.fetch_sub(1, Ordering::SeqCst) - 1;
    match result {
        Err(Error::Connection(err))
            if err.kind == ErrorKind::ConnectFail
                && engine.skip.contains(SkipClass::ConnectFail) =>
        {
            warn!(server = server_idx, slot, error = %err, "posting connection lost");
            if remaining == 0 {
                Err(Error::NoPostConnections)
            } else {
                Ok(())
            }
        }
        other => other,
    }
}

async fn post_loop(
    engine: &Engine,
    server_idx: usize,
    slot: usize,
    conn: &mut dyn NntpConnection,
) -> Result<()> {
    let server = &engine.config.servers[server_idx];
    let mut connected = false;
    if !engine.config.lazy_connect
        && !ensure_connected(engine, server_idx, slot, conn, &mut connected).await?
    {
        return Ok(());
    }

    let mut posting = true;
    // reused posting connections drain due checks ahead of new posts
    let mut checking = server.reuse_post_connections && engine.num_check_conns > 0;
    while posting || checking {
        let wait_started = Instant::now();
        tokio::select! {
            biased;
            _ = engine.cancel.cancelled() => return Ok(()),
            job = engine.check_queue.pop(), if checking => match job {
                Some(job) => {
                    engine.note_check_taken(&job);
                    match ensure_connected(engine, server_idx, slot, conn, &mut connected).await {
                        Ok(true) => check_worker::check_post(engine, conn, job).await?,
                        Ok(false) => return Ok(()),
                        Err(err) => {
                            // the session never came up; hand the article to
                            // another slot
                            check_worker::requeue_check(engine, job);
                            return Err(err);
                        }
                    }
                }
                None => checking = false,
            },
            job = engine.post_queue.pop(), if posting => match job {
                Some(job) => {
                    note_input_wait(engine, wait_started.elapsed());
                    match ensure_connected(engine, server_idx, slot, conn, &mut connected).await {
                        Ok(true) => post_one(engine, server_idx, conn, job).await?,
                        Ok(false) => return Ok(()),
                        Err(err) => {
                            engine.post_queue.push_nowait(job);
                            return Err(err);
                        }
                    }
                }
                None => posting = false,
            },
        }
    }
    Ok(())
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
            debug!(server = %server.name, slot, "posting connection established");
            Ok(true)
        }
        Some(Err(err)) => Err(err.into()),
    }
}

fn note_input_wait(engine: &Engine, waited: Duration) {
    if waited >= INPUT_STALL_WARN_AFTER
        && !engine.input_finished.load(Ordering::SeqCst)
        && !engine.warned_input_slow.swap(true, Ordering::SeqCst)
    {
        info!("upload idled waiting for articles; input generation may be the bottleneck");
    }
}

async fn post_one(
    engine: &Engine,
    server_idx: usize,
    conn: &mut dyn NntpConnection,
    mut job: PostJob,
) -> Result<()> {
    let size = job.article.size();
    let grant = engine.limiters[server_idx].pass(size);
    if grant.throttled() {
        trace!(bytes = size, "post held back by rate limit");
    }
    if !grant.wait().await {
        // run aborted while throttled
        return Ok(());
    }

    engine.counters.post_active.fetch_add(1, Ordering::SeqCst);
    engine.upload_time.start();
    let result = with_cancel(engine, conn.post(job.article.as_ref())).await;
    engine.upload_time.end();
    engine.counters.post_active.fetch_sub(1, Ordering::SeqCst);

    let Some(result) = result else {
        return Ok(());
    };
    if engine.is_cancelled() {
        return Ok(());
    }

    match result {
        Ok(message_id) => {
            engine.counters.articles_posted.fetch_add(1, Ordering::SeqCst);
            engine.counters.bytes_posted.fetch_add(size, Ordering::SeqCst);
            job.post_tries += 1;
            trace!(message_id = %message_id, bytes = size, "article posted");
            engine.emit(Event::ArticlePosted {
                message_id: message_id.clone(),
                bytes: size,
            });
            job.message_id = Some(message_id.clone());
            if engine.num_check_conns > 0 {
                job.check_failures = 0;
                job.cache_handle = engine.retain_body(Arc::clone(&job.article));
                engine.counters.check_pending.fetch_add(1, Ordering::SeqCst);
                engine.emit(Event::CheckScheduled { message_id });
                if engine.check_queue.is_full()
                    && !engine.warned_check_full.swap(true, Ordering::SeqCst)
                {
                    warn!("check queue is full; upload throttled until pending checks drain");
                }
                engine.check_queue.push(engine.config.check.delay, job).await;
            } else {
                job.successful = true;
                engine.finalize(job);
            }
            Ok(())
        }
        Err(err) => {
            let tolerated = match err.kind {
                ErrorKind::Timeout if engine.skip.contains(SkipClass::PostTimeout) => {
                    Some("posting timed out".to_string())
                }
                ErrorKind::PostDenied | ErrorKind::BadResponse | ErrorKind::UnknownError
                    if engine.skip.contains(SkipClass::PostReject) =>
                {
                    Some(format!("post rejected ({})", err.message))
                }
                _ if err.is_post_failure() && engine.skip.contains(SkipClass::PostFail) => {
                    Some(format!("posting failed ({})", err.message))
                }
                _ => None,
            };
            match tolerated {
                Some(desc) => {
                    engine.finalize_errored(job, desc);
                    Ok(())
                }
                None => Err(err.into()),
            }
        }
    }
}
