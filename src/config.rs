//! Configuration types for usenet-ul

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result, SkipClass, SkipSet};

/// Top-level upload engine configuration
///
/// Works out of the box via [`Default`]; every field has a serde default so
/// partial configuration files deserialize cleanly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Servers to upload to (one connection pool each)
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Post queue capacity before producers are backpressured
    /// (default: derived from the pool size, `min(conns/2 + 2, 25)`)
    #[serde(default)]
    pub article_queue_buffer: Option<usize>,

    /// Verification behavior
    #[serde(default)]
    pub check: CheckConfig,

    /// Failure classes to tolerate (skip and count) instead of aborting
    #[serde(default)]
    pub skip_errors: SkipErrorsConfig,

    /// Abort the run after this many skipped article errors (0 = unlimited)
    #[serde(default)]
    pub max_post_errors: u64,

    /// Defer connecting until a connection is first needed
    #[serde(default)]
    pub lazy_connect: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            article_queue_buffer: None,
            check: CheckConfig::default(),
            skip_errors: SkipErrorsConfig::default(),
            max_post_errors: 0,
            lazy_connect: false,
        }
    }
}

/// Per-server connection pool and throughput settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name used in logs
    #[serde(default)]
    pub name: String,

    /// Number of posting connections (default: 3)
    #[serde(default = "default_post_connections")]
    pub post_connections: usize,

    /// Number of dedicated checking connections (default: 0)
    #[serde(default)]
    pub check_connections: usize,

    /// Reuse posting connections for checking once posting idles,
    /// prioritizing a non-blocking drain of the check queue (default: false)
    #[serde(default)]
    pub reuse_post_connections: bool,

    /// Upload throughput limit for this server (None = unlimited)
    #[serde(default)]
    pub throttle: Option<ThrottleConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            post_connections: default_post_connections(),
            check_connections: 0,
            reuse_post_connections: false,
            throttle: None,
        }
    }
}

/// Token-bucket throughput limit: `bytes` per `period`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Burst size in bytes
    pub bytes: u64,

    /// Period over which `bytes` are replenished
    #[serde(with = "duration_ms_serde")]
    pub period: Duration,
}

/// Post-verification configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckConfig {
    /// How many times a missing article is re-checked before giving up
    /// (default: 2; 0 disables verification entirely)
    #[serde(default = "default_check_tries")]
    pub tries: u32,

    /// Delay between posting an article and its first check (default: 5s)
    #[serde(default = "default_check_delay", with = "duration_ms_serde")]
    pub delay: Duration,

    /// Delay before re-checking an article that came up missing
    /// (default: 30s)
    #[serde(default = "default_recheck_delay", with = "duration_ms_serde")]
    pub recheck_delay: Duration,

    /// How many times an article that failed every check is re-posted
    /// (default: 1; 0 releases payloads immediately after posting)
    #[serde(default = "default_post_retries")]
    pub post_retries: u32,

    /// Check queue capacity before posting is backpressured (default: 50)
    #[serde(default = "default_check_queue_buffer")]
    pub queue_buffer: usize,

    /// Retention cache capacity (default: derived from the pool size,
    /// `min(post_conns * 8, 100)`)
    #[serde(default)]
    pub cache_size: Option<usize>,

    /// Add random jitter (up to ±25%) to recheck delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            tries: default_check_tries(),
            delay: default_check_delay(),
            recheck_delay: default_recheck_delay(),
            post_retries: default_post_retries(),
            queue_buffer: default_check_queue_buffer(),
            cache_size: None,
            jitter: false,
        }
    }
}

/// Which failure classes to tolerate
///
/// Deserializes from either a boolean (`true` = tolerate everything) or an
/// explicit list of class names; unknown names are rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SkipErrorsConfig {
    /// Tolerate all classes (`true`) or none (`false`)
    All(bool),
    /// Tolerate exactly the listed classes
    Classes(Vec<SkipClass>),
}

impl Default for SkipErrorsConfig {
    fn default() -> Self {
        Self::All(false)
    }
}

impl SkipErrorsConfig {
    /// Compile into the fixed membership table used by the pipeline
    pub fn to_skip_set(&self) -> SkipSet {
        match self {
            SkipErrorsConfig::All(true) => SkipSet::all(),
            SkipErrorsConfig::All(false) => SkipSet::none(),
            SkipErrorsConfig::Classes(classes) => SkipSet::from_classes(classes),
        }
    }
}

impl UploadConfig {
    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config {
                message: "at least one server must be configured".to_string(),
                key: Some("servers".to_string()),
            });
        }
        for (i, server) in self.servers.iter().enumerate() {
            if server.post_connections == 0 {
                return Err(Error::Config {
                    message: format!("server {} has no posting connections", i),
                    key: Some(format!("servers[{}].post_connections", i)),
                });
            }
            if let Some(throttle) = &server.throttle {
                if throttle.bytes == 0 && !throttle.period.is_zero() {
                    return Err(Error::Config {
                        message: format!("server {} throttle admits zero bytes", i),
                        key: Some(format!("servers[{}].throttle.bytes", i)),
                    });
                }
            }
        }
        if self.check.tries > 0 && self.num_check_connections() == 0 {
            return Err(Error::Config {
                message: "checking is enabled but no connection can check; add \
                          check_connections or enable reuse_post_connections"
                    .to_string(),
                key: Some("check.tries".to_string()),
            });
        }
        Ok(())
    }

    /// Total posting connections across all servers
    pub fn num_post_connections(&self) -> usize {
        self.servers.iter().map(|s| s.post_connections).sum()
    }

    /// Total connections able to check, counting reused posting connections
    pub fn num_check_connections(&self) -> usize {
        if self.check.tries == 0 {
            return 0;
        }
        self.servers
            .iter()
            .map(|s| {
                s.check_connections
                    + if s.reuse_post_connections {
                        s.post_connections
                    } else {
                        0
                    }
            })
            .sum()
    }

    /// Post queue capacity, applying the pool-size heuristic when unset
    pub fn effective_queue_buffer(&self) -> usize {
        self.article_queue_buffer
            .unwrap_or_else(|| (self.num_post_connections() / 2 + 2).min(25))
    }

    /// Retention cache capacity, applying the pool-size heuristic when unset
    pub fn effective_cache_size(&self) -> usize {
        self.check
            .cache_size
            .unwrap_or_else(|| (self.num_post_connections() * 8).clamp(1, 100))
    }
}

fn default_post_connections() -> usize {
    3
}

fn default_check_tries() -> u32 {
    2
}

fn default_check_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_recheck_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_post_retries() -> u32 {
    1
}

fn default_check_queue_buffer() -> usize {
    50
}

/// Serialize Duration as milliseconds (check delays are sub-minute)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
