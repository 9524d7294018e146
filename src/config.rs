//! Verifier configuration from the environment
//!
//! Every value has a default; see [`VerifierConfig::from_env`] for the
//! variable names. The configuration is built once and passed explicitly.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::poll::PollSpec;
use crate::tunnel::DEFAULT_SETUP_TIMEOUT;
use crate::verifier::StorageTarget;

pub const RETRY_INTERVAL_ENV: &str = "VERIFY_RETRY_INTERVAL_SECS";
pub const TIMEOUT_ENV: &str = "VERIFY_TIMEOUT_SECS";
pub const CLEANER_EXTRA_TIMEOUT_ENV: &str = "VERIFY_CLEANER_EXTRA_TIMEOUT_SECS";
pub const ES_NAMESPACE_ENV: &str = "ES_NAMESPACE";
pub const ES_SERVICE_NAME_ENV: &str = "ES_SERVICE_NAME";
pub const ES_SELECTOR_NAME_ENV: &str = "ES_SELECTOR_NAME";
pub const ES_PORT_ENV: &str = "ES_PORT";
pub const ES_SECRET_NAME_ENV: &str = "ES_SECRET_NAME";
pub const ES_SECURE_ENV: &str = "ES_SECURE";
pub const ES_INDEX_PREFIX_ENV: &str = "ES_INDEX_PREFIX";
pub const ES_EXPECT_PRESENT_ENV: &str = "ES_EXPECT_PRESENT";
pub const TUNNEL_SETUP_TIMEOUT_ENV: &str = "TUNNEL_SETUP_TIMEOUT_SECS";

/// Default storage service, selector and secret name
pub const DEFAULT_STORAGE_NAME: &str = "elasticsearch";

/// Default Elasticsearch HTTP port
pub const DEFAULT_STORAGE_PORT: u16 = 9200;

/// Default index prefix
pub const DEFAULT_INDEX_PREFIX: &str = "jaeger-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierConfig {
    pub retry_interval: Duration,
    pub timeout: Duration,
    /// Added to the timeout while waiting for the cleaner's CronJob
    pub cleaner_extra_timeout: Duration,
    pub tunnel_setup_timeout: Duration,
    pub storage: StorageTarget,
    pub index_prefix: String,
    pub expect_present: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            retry_interval: crate::poll::DEFAULT_INTERVAL,
            timeout: crate::poll::DEFAULT_TIMEOUT,
            cleaner_extra_timeout: Duration::from_secs(60),
            tunnel_setup_timeout: DEFAULT_SETUP_TIMEOUT,
            storage: StorageTarget {
                namespace: "default".to_string(),
                service_name: DEFAULT_STORAGE_NAME.to_string(),
                selector_name: DEFAULT_STORAGE_NAME.to_string(),
                port: DEFAULT_STORAGE_PORT,
                secret_name: DEFAULT_STORAGE_NAME.to_string(),
                secure: false,
            },
            index_prefix: DEFAULT_INDEX_PREFIX.to_string(),
            expect_present: true,
        }
    }
}

impl VerifierConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            retry_interval: seconds(&lookup, RETRY_INTERVAL_ENV, defaults.retry_interval)?,
            timeout: seconds(&lookup, TIMEOUT_ENV, defaults.timeout)?,
            cleaner_extra_timeout: seconds(
                &lookup,
                CLEANER_EXTRA_TIMEOUT_ENV,
                defaults.cleaner_extra_timeout,
            )?,
            tunnel_setup_timeout: seconds(
                &lookup,
                TUNNEL_SETUP_TIMEOUT_ENV,
                defaults.tunnel_setup_timeout,
            )?,
            storage: StorageTarget {
                namespace: string(ES_NAMESPACE_ENV, &defaults.storage.namespace),
                service_name: string(ES_SERVICE_NAME_ENV, &defaults.storage.service_name),
                selector_name: string(ES_SELECTOR_NAME_ENV, &defaults.storage.selector_name),
                port: parsed(&lookup, ES_PORT_ENV, defaults.storage.port)?,
                secret_name: string(ES_SECRET_NAME_ENV, &defaults.storage.secret_name),
                secure: flag(&lookup, ES_SECURE_ENV, defaults.storage.secure)?,
            },
            index_prefix: string(ES_INDEX_PREFIX_ENV, &defaults.index_prefix),
            expect_present: flag(&lookup, ES_EXPECT_PRESENT_ENV, defaults.expect_present)?,
        };

        if config.index_prefix.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "{} must not be empty",
                ES_INDEX_PREFIX_ENV
            )));
        }

        if config.tunnel_setup_timeout.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "{} must be greater than zero",
                TUNNEL_SETUP_TIMEOUT_ENV
            )));
        }

        // Surface an inconsistent interval/timeout pair at startup
        config.poll_spec(config.expect_present)?;

        Ok(config)
    }

    /// Poll spec with the configured cadence and the given expectation
    pub fn poll_spec<T>(&self, expected: T) -> Result<PollSpec<T>> {
        PollSpec::new(self.retry_interval, self.timeout, expected)
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("{}={:?}: {}", key, raw, e))),
    }
}

fn seconds<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(lookup, key, default.as_secs_f64()).and_then(|secs: f64| {
        Duration::try_from_secs_f64(secs)
            .map_err(|e| Error::InvalidConfig(format!("{}={}: {}", key, secs, e)))
    })
}

fn flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "TRUE" | "True" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "False" | "no") => Ok(false),
        Some(other) => Err(Error::InvalidConfig(format!(
            "{}={:?}: expected true or false",
            key, other
        ))),
    }
}
