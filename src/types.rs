//! Core types and events for usenet-ul

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Progress events broadcast by the engine
///
/// Delivery is lossy by design: events are dropped when no subscriber is
/// listening, and slow subscribers may lag. The counters in
/// [`UploadStats`] are authoritative.
#[derive(Clone, Debug)]
pub enum Event {
    /// An article was posted and assigned a message-id
    ArticlePosted {
        /// Server-assigned message-id
        message_id: String,
        /// Encoded article size in bytes
        bytes: u64,
    },
    /// A posted article was scheduled for verification
    CheckScheduled {
        /// Message-id awaiting verification
        message_id: String,
    },
    /// A verification query did not find the article (yet)
    CheckMissing {
        /// Message-id that came up missing
        message_id: String,
        /// Consecutive misses since the last post
        failures: u32,
    },
    /// An article exhausted its checks and was returned to the post queue
    ArticleReposted {
        /// Message-id of the failed posting attempt
        message_id: String,
    },
    /// An article was verified present on the server
    ArticleVerified {
        /// Verified message-id
        message_id: String,
    },
    /// An article finalized with a tolerated failure
    ArticleFailed {
        /// Message-id, if one was ever assigned
        message_id: Option<String>,
        /// Description of the failure
        error: String,
    },
    /// The run was cancelled
    Cancelled,
    /// All articles reached a terminal state
    Complete,
}

/// Snapshot of the engine's progress counters
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct UploadStats {
    /// Articles handed to the engine
    pub articles_read: u64,
    /// Articles whose payload had to be re-fetched for a repost
    pub articles_re_read: u64,
    /// Articles currently counted as posted
    pub articles_posted: u64,
    /// Posts repeated because verification never found the article
    pub articles_re_posted: u64,
    /// Bytes of article payload currently counted as posted
    pub bytes_posted: u64,
    /// Articles that reached a terminal state
    pub articles_checked: u64,
    /// Times an article had to be re-checked after a miss
    pub articles_rechecked: u64,
    /// Articles awaiting their first check
    pub check_pending: u64,
    /// Articles awaiting a re-check
    pub check_re_pending: u64,
    /// Posts currently in flight
    pub post_active: u64,
    /// Checks currently in flight
    pub check_active: u64,
    /// Articles finalized with a tolerated error
    pub article_errors: u64,
}

/// Final report returned by [`Uploader::wait`](crate::Uploader::wait)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadReport {
    /// Counters at completion
    pub stats: UploadStats,
    /// When the engine was constructed
    pub started_at: DateTime<Utc>,
    /// When the run completed
    pub finished_at: DateTime<Utc>,
    /// Wall time during which at least one post was in flight
    pub upload_time: Duration,
}
