//! Engine configuration.
//!
//! Every knob has a default; `from_env` overlays `FOLDWISE_*` variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::event_store::DEFAULT_READ_BATCH_SIZE;

/// What a multi-projection does when its projector rejects an event.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldFailurePolicy {
    /// Stop at the failing event and retry it on every refresh.
    #[default]
    Halt,
    /// Record the event as poison, skip it now and forever, report a warning.
    SkipPoison,
}

impl FromStr for FoldFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "halt" => Ok(Self::Halt),
            "skip_poison" | "skip-poison" => Ok(Self::SkipPoison),
            other => Err(ConfigError::Invalid {
                key: "FOLDWISE_FOLD_FAILURE_POLICY",
                value: other.to_string(),
                reason: "expected `halt` or `skip_poison`".to_string(),
            }),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long after an event's timestamp it is considered safe.
    pub safe_window_ms: u64,
    /// Snapshots whose compressed size is above this go to the blob store.
    pub snapshot_offload_threshold_bytes: usize,
    /// Safe events folded since the last snapshot that force the next one.
    pub persist_batch_size: u64,
    /// Snapshot a safe advance smaller than a batch once this much time has
    /// passed since the last snapshot.
    pub persist_interval_ms: u64,
    /// Total attempts for a command whose append loses the version race.
    pub max_command_retries: u32,
    pub worker_idle_timeout_ms: u64,
    pub worker_inbox_capacity: usize,
    /// Upper bound for `wait_for_sortable_unique_id`.
    pub wait_timeout_ms: u64,
    pub wait_poll_interval_ms: u64,
    pub refresh_timeout_ms: u64,
    /// How long a projection cache is trusted without a notice.
    pub cache_ttl_ms: u64,
    pub read_batch_size: usize,
    pub fold_failure_policy: FoldFailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            safe_window_ms: 7_000,
            snapshot_offload_threshold_bytes: 1_000_000,
            persist_batch_size: 1,
            persist_interval_ms: 300_000,
            max_command_retries: 3,
            worker_idle_timeout_ms: 300_000,
            worker_inbox_capacity: 32,
            wait_timeout_ms: 30_000,
            wait_poll_interval_ms: 100,
            refresh_timeout_ms: 60_000,
            cache_ttl_ms: 1_000,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            fold_failure_policy: FoldFailurePolicy::Halt,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `FOLDWISE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        info!(
            safe_window_ms = config.safe_window_ms,
            offload_threshold = config.snapshot_offload_threshold_bytes,
            policy = ?config.fold_failure_policy,
            "engine config loaded"
        );
        Ok(config)
    }

    /// Defaults overlaid with whatever `lookup` returns for each `FOLDWISE_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        overlay(&lookup, "FOLDWISE_SAFE_WINDOW_MS", &mut config.safe_window_ms)?;
        overlay(
            &lookup,
            "FOLDWISE_SNAPSHOT_OFFLOAD_THRESHOLD_BYTES",
            &mut config.snapshot_offload_threshold_bytes,
        )?;
        overlay(&lookup, "FOLDWISE_PERSIST_BATCH_SIZE", &mut config.persist_batch_size)?;
        overlay(&lookup, "FOLDWISE_PERSIST_INTERVAL_MS", &mut config.persist_interval_ms)?;
        overlay(&lookup, "FOLDWISE_MAX_COMMAND_RETRIES", &mut config.max_command_retries)?;
        overlay(&lookup, "FOLDWISE_WORKER_IDLE_TIMEOUT_MS", &mut config.worker_idle_timeout_ms)?;
        overlay(&lookup, "FOLDWISE_WORKER_INBOX_CAPACITY", &mut config.worker_inbox_capacity)?;
        overlay(&lookup, "FOLDWISE_WAIT_TIMEOUT_MS", &mut config.wait_timeout_ms)?;
        overlay(&lookup, "FOLDWISE_WAIT_POLL_INTERVAL_MS", &mut config.wait_poll_interval_ms)?;
        overlay(&lookup, "FOLDWISE_REFRESH_TIMEOUT_MS", &mut config.refresh_timeout_ms)?;
        overlay(&lookup, "FOLDWISE_CACHE_TTL_MS", &mut config.cache_ttl_ms)?;
        overlay(&lookup, "FOLDWISE_READ_BATCH_SIZE", &mut config.read_batch_size)?;
        if let Some(raw) = lookup("FOLDWISE_FOLD_FAILURE_POLICY") {
            config.fold_failure_policy = raw.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("FOLDWISE_MAX_COMMAND_RETRIES", self.max_command_retries as u64),
            ("FOLDWISE_WORKER_INBOX_CAPACITY", self.worker_inbox_capacity as u64),
            ("FOLDWISE_READ_BATCH_SIZE", self.read_batch_size as u64),
            ("FOLDWISE_PERSIST_BATCH_SIZE", self.persist_batch_size),
            ("FOLDWISE_WAIT_POLL_INTERVAL_MS", self.wait_poll_interval_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn safe_window(&self) -> Duration {
        Duration::from_millis(self.safe_window_ms)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

fn overlay<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}
