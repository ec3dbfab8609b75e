// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::article::PostArticle;
use crate::config::UploadConfig;
use crate::connection::{Connector, NntpConnection};
use crate::error::{ConnectionError, Error, ErrorKind};
use crate::types::Event;

use super::Uploader;

struct MockArticle {
    size: u64,
    payload: Mutex<Option<Arc<[u8]>>>,
    reloads: AtomicU64,
    releases: AtomicU64,
}

impl MockArticle {
    fn new(size: u64) -> Arc<Self> {
        Arc::new(Self {
            size,
            payload: Mutex::new(Some(vec![0u8; size as usize].into())),
            reloads: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl PostArticle for MockArticle {
    fn size(&self) -> u64 {
        self.size
    }

    fn data(&self) -> Option<Arc<[u8]>> {
        self.payload.lock().unwrap().clone()
    }

    async fn reload(&self) -> Result<(), Error> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        *self.payload.lock().unwrap() = Some(vec![0u8; self.size as usize].into());
        Ok(())
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.payload.lock().unwrap().take();
    }
}

/// Scripted in-memory server shared by every connection of one connector.
///
/// `post_failures` and `stat_script` are consumed in call order; once a
/// script runs dry, posts succeed with a fresh message-id and stats report
/// the article present.
#[derive(Default)]
struct MockServer {
    posted: Mutex<Vec<String>>,
    next_id: AtomicU64,
    connects: AtomicU64,
    connect_failures: Mutex<VecDeque<ConnectionError>>,
    post_failures: Mutex<VecDeque<ConnectionError>>,
    stat_script: Mutex<VecDeque<bool>>,
    stats_seen: Mutex<Vec<String>>,
}

impl MockServer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_post_failures(&self, errs: impl IntoIterator<Item = ConnectionError>) {
        self.post_failures.lock().unwrap().extend(errs);
    }

    fn script_stats(&self, results: impl IntoIterator<Item = bool>) {
        self.stat_script.lock().unwrap().extend(results);
    }

    fn script_connect_failures(&self, errs: impl IntoIterator<Item = ConnectionError>) {
        self.connect_failures.lock().unwrap().extend(errs);
    }

    fn post_count(&self) -> usize {
        self.posted.lock().unwrap().len()
    }

    fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Connections refuse every command until `connect` has run on them
struct MockConnection {
    server: Arc<MockServer>,
    connected: bool,
}

impl MockConnection {
    fn session(&self) -> Result<(), ConnectionError> {
        if self.connected {
            Ok(())
        } else {
            Err(ConnectionError::new(ErrorKind::NotConnected, "no session"))
        }
    }
}

#[async_trait]
impl NntpConnection for MockConnection {
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        match self.server.connect_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => {
                self.connected = true;
                self.server.connects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn post(&mut self, _article: &dyn PostArticle) -> Result<String, ConnectionError> {
        self.session()?;
        if let Some(err) = self.server.post_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let n = self.server.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{n}@mock.test");
        self.server.posted.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn stat(&mut self, message_id: &str) -> Result<bool, ConnectionError> {
        self.session()?;
        self.server.stats_seen.lock().unwrap().push(message_id.to_string());
        Ok(self
            .server
            .stat_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(true))
    }

    async fn close(&mut self) {}
}

/// Connector wrapper so every opened connection talks to one shared server
struct SharedConnector(Arc<MockServer>);

impl Connector for SharedConnector {
    fn open(&self) -> Box<dyn NntpConnection> {
        Box::new(MockConnection {
            server: Arc::clone(&self.0),
            connected: false,
        })
    }
}

fn config(value: serde_json::Value) -> UploadConfig {
    serde_json::from_value(value).unwrap()
}

fn single_server_config() -> UploadConfig {
    config(json!({
        "servers": [{
            "name": "primary",
            "post_connections": 2,
            "check_connections": 1,
        }],
    }))
}

fn uploader(config: UploadConfig, server: &Arc<MockServer>) -> Uploader {
    Uploader::new(config, vec![Arc::new(SharedConnector(Arc::clone(server)))]).unwrap()
}

#[tokio::test(start_paused = true)]
async fn posts_and_verifies_all_articles() {
    let server = MockServer::new();
    let up = uploader(single_server_config(), &server);

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(up.add_post(MockArticle::new(1000)).await.unwrap());
    }
    up.finished();
    let report = up.wait().await.unwrap();

    assert_eq!(report.stats.articles_read, 5);
    assert_eq!(report.stats.articles_posted, 5);
    assert_eq!(report.stats.articles_checked, 5);
    assert_eq!(report.stats.bytes_posted, 5000);
    assert_eq!(report.stats.article_errors, 0);
    assert_eq!(report.stats.check_pending, 0);
    assert_eq!(server.post_count(), 5);

    for rx in outcomes {
        let outcome = rx.await.unwrap();
        assert!(outcome.successful);
        assert!(outcome.message_id.unwrap().ends_with("@mock.test"));
        assert!(outcome.error.is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn emits_lifecycle_events_in_order() {
    let server = MockServer::new();
    let up = uploader(single_server_config(), &server);
    let mut events = up.subscribe();

    let _rx = up.add_post(MockArticle::new(100)).await.unwrap();
    up.finished();
    up.wait().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen[0], Event::ArticlePosted { bytes: 100, .. }));
    assert!(matches!(seen[1], Event::CheckScheduled { .. }));
    assert!(matches!(seen[2], Event::ArticleVerified { .. }));
    assert!(matches!(seen.last(), Some(Event::Complete)));
}

#[tokio::test(start_paused = true)]
async fn missing_article_is_rechecked_before_success() {
    let server = MockServer::new();
    // first check misses, the recheck finds it
    server.script_stats([false, true]);
    let up = uploader(single_server_config(), &server);

    let rx = up.add_post(MockArticle::new(100)).await.unwrap();
    up.finished();
    let report = up.wait().await.unwrap();

    assert!(rx.await.unwrap().successful);
    assert_eq!(report.stats.articles_posted, 1);
    assert_eq!(report.stats.articles_rechecked, 1);
    assert_eq!(report.stats.articles_re_posted, 0);
    assert_eq!(report.stats.article_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_checks_trigger_repost() {
    let server = MockServer::new();
    // both checks of the first posting miss; the repost verifies
    server.script_stats([false, false]);
    let up = uploader(single_server_config(), &server);

    let rx = up.add_post(MockArticle::new(100)).await.unwrap();
    up.finished();
    let report = up.wait().await.unwrap();

    let outcome = rx.await.unwrap();
    assert!(outcome.successful);
    // the second posting's message-id wins
    assert_eq!(outcome.message_id.as_deref(), Some("1@mock.test"));
    assert_eq!(server.post_count(), 2);
    assert_eq!(report.stats.articles_posted, 1);
    assert_eq!(report.stats.articles_re_posted, 1);
    assert_eq!(report.stats.bytes_posted, 100);
    assert_eq!(report.stats.article_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn evicted_payload_is_reloaded_for_repost() {
    let server = MockServer::new();
    // first article misses its single check and must be reposted
    server.script_stats([false]);
    let cfg = config(json!({
        "servers": [{
            "name": "primary",
            "post_connections": 1,
            "check_connections": 1,
        }],
        "check": { "tries": 1, "post_retries": 1, "cache_size": 1 },
    }));
    let up = uploader(cfg, &server);

    let first = MockArticle::new(100);
    let rx1 = up.add_post(Arc::clone(&first) as Arc<dyn PostArticle>).await.unwrap();
    // caching the second article evicts and releases the first
    let rx2 = up.add_post(MockArticle::new(100)).await.unwrap();
    up.finished();
    let report = up.wait().await.unwrap();

    assert!(rx1.await.unwrap().successful);
    assert!(rx2.await.unwrap().successful);
    assert_eq!(first.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(report.stats.articles_re_read, 1);
    assert_eq!(report.stats.articles_re_posted, 1);
}

#[tokio::test(start_paused = true)]
async fn tolerated_post_rejection_skips_the_article() {
    let server = MockServer::new();
    server.script_post_failures([ConnectionError::new(
        ErrorKind::PostDenied,
        "441 posting not allowed",
    )]);
    let cfg = config(json!({
        "servers": [{ "name": "primary", "post_connections": 1, "check_connections": 1 }],
        "skip_errors": true,
    }));
    let up = uploader(cfg, &server);

    let rx_bad = up.add_post(MockArticle::new(100)).await.unwrap();
    let rx_ok = up.add_post(MockArticle::new(100)).await.unwrap();
    up.finished();
    let report = up.wait().await.unwrap();

    let bad = rx_bad.await.unwrap();
    assert!(!bad.successful);
    assert!(bad.message_id.is_none());
    assert!(bad.error.unwrap().contains("post rejected"));
    assert!(rx_ok.await.unwrap().successful);
    assert_eq!(report.stats.article_errors, 1);
    assert_eq!(report.stats.articles_checked, 2);
}

#[tokio::test(start_paused = true)]
async fn untolerated_post_rejection_aborts_the_run() {
    let server = MockServer::new();
    server.script_post_failures([ConnectionError::new(
        ErrorKind::PostDenied,
        "441 posting not allowed",
    )]);
    let up = uploader(single_server_config(), &server);

    let _rx = up.add_post(MockArticle::new(100)).await.unwrap();
    up.finished();
    let err = up.wait().await.unwrap_err();
    assert!(matches!(err, Error::Connection(ref c) if c.kind == ErrorKind::PostDenied));
}

#[tokio::test(start_paused = true)]
async fn error_limit_aborts_the_run() {
    let server = MockServer::new();
    server.script_post_failures(
        (0..3).map(|_| ConnectionError::new(ErrorKind::PostDenied, "441")),
    );
    let cfg = config(json!({
        "servers": [{ "name": "primary", "post_connections": 1, "check_connections": 1 }],
        "skip_errors": true,
        "max_post_errors": 2,
    }));
    let up = uploader(cfg, &server);

    for _ in 0..3 {
        if up.add_post(MockArticle::new(100)).await.is_err() {
            break;
        }
    }
    up.finished();
    let err = up.wait().await.unwrap_err();
    assert!(matches!(err, Error::MaxErrorsExceeded));
}

#[tokio::test(start_paused = true)]
async fn all_connections_failing_is_fatal() {
    let server = MockServer::new();
    server.script_connect_failures(
        (0..3).map(|_| ConnectionError::new(ErrorKind::ConnectFail, "refused")),
    );
    let cfg = config(json!({
        "servers": [{ "name": "primary", "post_connections": 2, "check_connections": 1 }],
        "skip_errors": ["connect-fail"],
    }));
    let up = uploader(cfg, &server);

    let err = up.wait().await.unwrap_err();
    assert!(matches!(
        err,
        Error::NoPostConnections | Error::NoCheckConnections
    ));
}

#[tokio::test(start_paused = true)]
async fn untolerated_connect_failure_is_fatal_with_no_progress() {
    let server = MockServer::new();
    server.script_connect_failures(
        (0..3).map(|_| ConnectionError::new(ErrorKind::ConnectFail, "refused")),
    );
    let up = uploader(single_server_config(), &server);

    let err = up.wait().await.unwrap_err();
    assert!(matches!(err, Error::Connection(ref c) if c.kind == ErrorKind::ConnectFail));
    assert_eq!(server.post_count(), 0);
    assert_eq!(up.stats().articles_posted, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_resolves_wait_with_cancelled() {
    let server = MockServer::new();
    let up = uploader(single_server_config(), &server);
    let mut events = up.subscribe();

    let _rx = up.add_post(MockArticle::new(100)).await.unwrap();
    // let the article reach the post/check pipeline before aborting
    loop {
        if matches!(events.recv().await.unwrap(), Event::CheckScheduled { .. }) {
            break;
        }
    }
    up.cancel("operator abort");
    let err = up.wait().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled(ref reason) if reason == "operator abort"));

    // no further input accepted
    assert!(up.add_post(MockArticle::new(10)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn empty_run_completes_after_finished() {
    let server = MockServer::new();
    let up = uploader(single_server_config(), &server);
    up.finished();
    let report = up.wait().await.unwrap();
    assert_eq!(report.stats.articles_read, 0);
    assert_eq!(report.stats.articles_checked, 0);
}

#[tokio::test(start_paused = true)]
async fn checking_disabled_finalizes_after_post() {
    let server = MockServer::new();
    let cfg = config(json!({
        "servers": [{ "name": "primary", "post_connections": 1 }],
        "check": { "tries": 0 },
    }));
    let up = uploader(cfg, &server);

    let rx = up.add_post(MockArticle::new(100)).await.unwrap();
    up.finished();
    let report = up.wait().await.unwrap();

    let outcome = rx.await.unwrap();
    assert!(outcome.successful);
    assert!(outcome.message_id.is_some());
    assert_eq!(report.stats.articles_checked, 1);
    assert!(server.stats_seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn lazy_connect_defers_sessions_until_articles_arrive() {
    let server = MockServer::new();
    let cfg = config(json!({
        "servers": [{ "name": "primary", "post_connections": 2, "check_connections": 1 }],
        "lazy_connect": true,
    }));
    let up = uploader(cfg, &server);

    up.finished();
    let report = up.wait().await.unwrap();
    assert_eq!(report.stats.articles_read, 0);
    // no work ever arrived, so no sessions were opened
    assert_eq!(server.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn lazy_connect_opens_sessions_before_first_use() {
    let server = MockServer::new();
    let cfg = config(json!({
        "servers": [{ "name": "primary", "post_connections": 1, "check_connections": 1 }],
        "lazy_connect": true,
    }));
    let up = uploader(cfg, &server);

    let rx = up.add_post(MockArticle::new(100)).await.unwrap();
    up.finished();
    let report = up.wait().await.unwrap();

    assert!(rx.await.unwrap().successful);
    assert_eq!(report.stats.articles_checked, 1);
    // the posting and checking slots each opened exactly one session
    assert_eq!(server.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn reused_posting_connections_run_checks() {
    let server = MockServer::new();
    let cfg = config(json!({
        "servers": [{
            "name": "primary",
            "post_connections": 1,
            "check_connections": 0,
            "reuse_post_connections": true,
        }],
        "check": { "post_retries": 0 },
    }));
    let up = uploader(cfg, &server);

    let rx = up.add_post(MockArticle::new(100)).await.unwrap();
    up.finished();
    let report = up.wait().await.unwrap();

    assert!(rx.await.unwrap().successful);
    assert_eq!(report.stats.articles_checked, 1);
    assert_eq!(server.stats_seen.lock().unwrap().len(), 1);
}
