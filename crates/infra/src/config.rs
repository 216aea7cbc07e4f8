//! Configuration loading and representation.
//!
//! Layering: defaults, then `DISPATCHQ_*` environment variables, then
//! whatever the caller overrides (CLI flags), then [`DispatchConfig::validate`].

use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

use dispatchq_core::{parse_timezone, IngestOptions, RetryPolicy, DEFAULT_MAX_ATTEMPTS};

use crate::scheduler::SchedulerConfig;

pub const ENV_PREFIX: &str = "DISPATCHQ_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("missing required setting {0}")]
    Missing(&'static str),
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Settings of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub timezone: Tz,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub submit_timeout: Duration,
    pub stale_after: Duration,
    pub publish_attempts: u32,
    /// Startup budget for reaching the broker
    pub reconnect_attempts: u32,
    pub queue_url: String,
    pub queue_name: String,
    /// Idle time before an unacked delivery goes to another consumer. Must
    /// outlast one submit timeout plus the longest backoff.
    pub redeliver_after: Duration,
    pub submit_url: Option<String>,
    pub dry_run: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Jakarta,
            workers: 3,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(300),
            submit_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(3600),
            publish_attempts: 5,
            reconnect_attempts: 5,
            queue_url: "redis://127.0.0.1:6379".to_string(),
            queue_name: "dispatchq:jobs".to_string(),
            redeliver_after: Duration::from_secs(600),
            submit_url: None,
            dry_run: false,
        }
    }
}

impl DispatchConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup` (full variable names).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(v) = get("TIMEZONE") {
            config.timezone = parse_timezone(&v)
                .map_err(|e| ConfigError::invalid("DISPATCHQ_TIMEZONE", &v, e.to_string()))?;
        }
        if let Some(v) = get("WORKERS") {
            config.workers = parse_number("DISPATCHQ_WORKERS", &v)?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            config.max_attempts = parse_number("DISPATCHQ_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("RETRY_BASE_MS") {
            config.retry_base = Duration::from_millis(parse_number("DISPATCHQ_RETRY_BASE_MS", &v)?);
        }
        if let Some(v) = get("RETRY_MAX_MS") {
            config.retry_max = Duration::from_millis(parse_number("DISPATCHQ_RETRY_MAX_MS", &v)?);
        }
        if let Some(v) = get("SUBMIT_TIMEOUT_MS") {
            config.submit_timeout =
                Duration::from_millis(parse_number("DISPATCHQ_SUBMIT_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("STALE_AFTER_SECS") {
            config.stale_after = Duration::from_secs(parse_number("DISPATCHQ_STALE_AFTER_SECS", &v)?);
        }
        if let Some(v) = get("PUBLISH_ATTEMPTS") {
            config.publish_attempts = parse_number("DISPATCHQ_PUBLISH_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("RECONNECT_ATTEMPTS") {
            config.reconnect_attempts = parse_number("DISPATCHQ_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("QUEUE_URL") {
            config.queue_url = v;
        }
        if let Some(v) = get("QUEUE_NAME") {
            config.queue_name = v;
        }
        if let Some(v) = get("REDELIVER_AFTER_MS") {
            config.redeliver_after =
                Duration::from_millis(parse_number("DISPATCHQ_REDELIVER_AFTER_MS", &v)?);
        }
        if let Some(v) = get("SUBMIT_URL") {
            config.submit_url = Some(v);
        }
        if let Some(v) = get("DRY_RUN") {
            config.dry_run = parse_bool("DISPATCHQ_DRY_RUN", &v)?;
        }

        Ok(config)
    }

    /// Reject settings no run can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "0", "at least one worker is required"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "0", "must be at least 1"));
        }
        if self.publish_attempts == 0 {
            return Err(ConfigError::invalid("publish_attempts", "0", "must be at least 1"));
        }
        if self.reconnect_attempts == 0 {
            return Err(ConfigError::invalid("reconnect_attempts", "0", "must be at least 1"));
        }
        if self.retry_max < self.retry_base {
            return Err(ConfigError::invalid(
                "retry_max",
                format!("{:?}", self.retry_max),
                "must not be below the retry base delay",
            ));
        }
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::Missing("queue_name"));
        }
        if self.redeliver_after <= self.retry_max + self.submit_timeout {
            return Err(ConfigError::invalid(
                "redeliver_after",
                format!("{:?}", self.redeliver_after),
                "must exceed the submit timeout plus the retry delay cap",
            ));
        }
        Ok(())
    }

    /// Validation for runs that submit: a target is required unless dry-run.
    pub fn validate_for_submission(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if !self.dry_run && self.submit_url.is_none() {
            return Err(ConfigError::Missing("DISPATCHQ_SUBMIT_URL (or dry run)"));
        }
        Ok(())
    }

    /// Backoff between job attempts.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.retry_base, self.retry_max)
    }

    pub fn publish_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.publish_attempts,
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
    }

    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.reconnect_attempts,
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            timezone: self.timezone,
            max_attempts: self.max_attempts,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            timezone: self.timezone,
            stale_after: self.stale_after,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, value, e.to_string()))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected true or false")),
    }
}
