//! # usenet-ul
//!
//! Highly configurable upload engine library for Usenet posting applications.
//!
//! ## Design Philosophy
//!
//! usenet-ul is designed to be:
//! - **Highly configurable** - Connection pools, retry policy, throttling
//!   and error tolerance are all tunable
//! - **Sensible defaults** - Works out of the box with zero configuration
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Transport-agnostic** - The wire protocol is supplied by the consumer
//!   through the [`NntpConnection`] trait
//!
//! The engine drives each submitted article through posting, delayed
//! verification, rechecks and reposts until it reaches a terminal state,
//! applying backpressure to the producer the whole way.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use usenet_ul::{Connector, UploadConfig, Uploader};
//!
//! async fn upload(
//!     config: UploadConfig,
//!     connector: Arc<dyn Connector>,
//!     articles: Vec<Arc<dyn usenet_ul::PostArticle>>,
//! ) -> Result<(), usenet_ul::Error> {
//!     let uploader = Uploader::new(config, vec![connector])?;
//!
//!     // Subscribe to events
//!     let mut events = uploader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     for article in articles {
//!         let _outcome = uploader.add_post(article).await?;
//!     }
//!     uploader.finished();
//!     let report = uploader.wait().await?;
//!     println!("posted {} bytes", report.stats.bytes_posted);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Article submission trait and per-article outcomes
pub mod article;
/// Bounded FIFO queue with reservations
pub mod bounded_queue;
/// Configuration types
pub mod config;
/// Wire-level connection traits supplied by the consumer
pub mod connection;
/// Delay queue for scheduled verification
pub mod delayed_queue;
/// Error types
pub mod error;
/// Token-bucket rate limiting with synchronous debit
pub mod rate_limiter;
/// Bounded payload retention between post and verification
pub mod retention_cache;
/// Core types, events and reports
pub mod types;
/// The upload engine (decomposed into focused submodules)
pub mod uploader;

// Re-export commonly used types
pub use article::{ArticleOutcome, OutcomeReceiver, PostArticle};
pub use bounded_queue::BoundedQueue;
pub use config::{
    CheckConfig, ServerConfig, SkipErrorsConfig, ThrottleConfig, UploadConfig,
};
pub use connection::{Connector, NntpConnection};
pub use delayed_queue::DelayedQueue;
pub use error::{ConnectionError, Error, ErrorKind, Result, SkipClass, SkipSet};
pub use rate_limiter::{Grant, RateLimiter};
pub use retention_cache::{CacheHandle, RetentionCache};
pub use types::{Event, UploadReport, UploadStats};
pub use uploader::Uploader;
