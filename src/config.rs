//! Synchronization configuration.
//!
//! Freshness windows, polling cadence, retry limits, and eviction timing are
//! configuration data, never call-site literals. Settings load from an
//! optional TOML file layered with `AGORA_SYNC_*` environment variables.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::SyncConfigError;
use crate::kind::ResourceKind;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_EXPIRE_AFTER_MS: u64 = 300_000;

const DEFAULT_BOUNTY_STALE_AFTER_MS: u64 = 30_000;
const DEFAULT_PROJECT_STALE_AFTER_MS: u64 = 60_000;
const DEFAULT_FORUM_POST_STALE_AFTER_MS: u64 = 15_000;
const DEFAULT_MEMBER_STALE_AFTER_MS: u64 = 120_000;
const DEFAULT_MEETING_NOTE_STALE_AFTER_MS: u64 = 180_000;

const DEFAULT_BOUNTY_POLL_INTERVAL_MS: u64 = 45_000;
const DEFAULT_FORUM_POST_POLL_INTERVAL_MS: u64 = 20_000;

/// Retry behavior for transient fetch failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// First backoff delay; doubles on each subsequent retry.
    pub base_backoff_ms: u64,
    /// Upper bound on any single backoff delay.
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetrySettings {
    /// Backoff before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        let delay = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

/// Per-kind freshness and refresh policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KindPolicy {
    /// Age after which a cached value is considered stale.
    pub stale_after_ms: u64,
    /// Disuse window after which an unsubscribed entry is evicted.
    pub expire_after_ms: u64,
    /// Background polling cadence while subscribed; 0 disables polling.
    pub poll_interval_ms: u64,
    /// Refetch stale entries when the application regains focus.
    pub refetch_on_focus: bool,
}

impl Default for KindPolicy {
    fn default() -> Self {
        Self {
            stale_after_ms: DEFAULT_PROJECT_STALE_AFTER_MS,
            expire_after_ms: DEFAULT_EXPIRE_AFTER_MS,
            poll_interval_ms: 0,
            refetch_on_focus: true,
        }
    }
}

impl KindPolicy {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_millis(self.expire_after_ms)
    }

    /// Polling cadence, or `None` when polling is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }
}

/// Top-level synchronization settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetrySettings,
    /// Cadence of the eviction sweeper.
    pub sweep_interval_ms: u64,
    pub bounty: KindPolicy,
    pub project: KindPolicy,
    pub forum_post: KindPolicy,
    pub member: KindPolicy,
    pub meeting_note: KindPolicy,
    pub logging: LoggingSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            bounty: KindPolicy {
                stale_after_ms: DEFAULT_BOUNTY_STALE_AFTER_MS,
                poll_interval_ms: DEFAULT_BOUNTY_POLL_INTERVAL_MS,
                ..KindPolicy::default()
            },
            project: KindPolicy {
                stale_after_ms: DEFAULT_PROJECT_STALE_AFTER_MS,
                ..KindPolicy::default()
            },
            forum_post: KindPolicy {
                stale_after_ms: DEFAULT_FORUM_POST_STALE_AFTER_MS,
                poll_interval_ms: DEFAULT_FORUM_POST_POLL_INTERVAL_MS,
                ..KindPolicy::default()
            },
            member: KindPolicy {
                stale_after_ms: DEFAULT_MEMBER_STALE_AFTER_MS,
                ..KindPolicy::default()
            },
            meeting_note: KindPolicy {
                stale_after_ms: DEFAULT_MEETING_NOTE_STALE_AFTER_MS,
                ..KindPolicy::default()
            },
            logging: LoggingSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Load settings from an optional TOML file layered with environment
    /// variables (`AGORA_SYNC_RETRY__MAX_RETRIES=5` style overrides).
    pub fn load(path: Option<&Path>) -> Result<Self, SyncConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("AGORA_SYNC").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Policy table lookup.
    pub fn policy(&self, kind: ResourceKind) -> &KindPolicy {
        match kind {
            ResourceKind::Bounty => &self.bounty,
            ResourceKind::Project => &self.project,
            ResourceKind::ForumPost => &self.forum_post,
            ResourceKind::Member => &self.member,
            ResourceKind::MeetingNote => &self.meeting_note,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
}

/// Logging settings consumed by [`crate::telemetry::init`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default tracing directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
