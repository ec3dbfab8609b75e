//! The consumed connection capability.
//!
//! Wire-level NNTP is outside this crate: the engine drives whatever
//! implements [`NntpConnection`], and only sees failures through the
//! [`ErrorKind`](crate::error::ErrorKind) taxonomy. A [`Connector`] is
//! supplied per configured server and opens one connection per pool slot.

use async_trait::async_trait;

use crate::article::PostArticle;
use crate::error::ConnectionError;

/// One NNTP session, owned by a single worker at a time.
///
/// Operations suspend only the calling worker. Timeouts are the
/// implementation's responsibility and surface as
/// [`ErrorKind::Timeout`](crate::error::ErrorKind::Timeout).
#[async_trait]
pub trait NntpConnection: Send {
    /// Establish the session (connect, authenticate, select group)
    async fn connect(&mut self) -> Result<(), ConnectionError>;

    /// Post an article body; returns the server-assigned message-id
    async fn post(&mut self, article: &dyn PostArticle) -> Result<String, ConnectionError>;

    /// Query whether an article exists on the server (STAT)
    async fn stat(&mut self, message_id: &str) -> Result<bool, ConnectionError>;

    /// Close the session; errors during teardown are discarded
    async fn close(&mut self);
}

/// Factory for the connections of one configured server
pub trait Connector: Send + Sync {
    /// Open an unconnected session for one pool slot
    fn open(&self) -> Box<dyn NntpConnection>;
}
