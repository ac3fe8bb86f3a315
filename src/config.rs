use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use thiserror::Error;

use crate::queue::{DEFAULT_MAX_RETRIES, MAX_RETRIES_LIMIT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings for the supervisor binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub log_level: LevelFilter,
    pub max_retries: i32,
    pub stale_timeout: Duration,
    pub maintenance_interval: Duration,
    pub completed_retention: Duration,
    /// `None` retries failed jobs immediately.
    pub backoff_base: Option<Duration>,
    pub known_job_types: Option<HashSet<String>>,
}

impl Config {
    /// Reads the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let max_retries = parse_or(&lookup, "JOB_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        if !(1..=MAX_RETRIES_LIMIT).contains(&max_retries) {
            return Err(ConfigError::Invalid {
                name: "JOB_MAX_RETRIES",
                value: max_retries.to_string(),
                reason: format!("must be between 1 and {MAX_RETRIES_LIMIT}"),
            });
        }

        let backoff_base = match lookup("JOB_BACKOFF_BASE_SECS") {
            Some(value) if !value.trim().is_empty() => Some(Duration::from_secs(parse_value(
                "JOB_BACKOFF_BASE_SECS",
                &value,
            )?)),
            _ => None,
        };

        let known_job_types = lookup("KNOWN_JOB_TYPES").map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|job_type| !job_type.is_empty())
                .map(String::from)
                .collect::<HashSet<_>>()
        });

        Ok(Self {
            database_url,
            bind_addr: parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 7878)))?,
            log_level: parse_or(&lookup, "LOG_LEVEL", LevelFilter::Info)?,
            max_retries,
            stale_timeout: Duration::from_secs(parse_or(&lookup, "JOB_STALE_TIMEOUT_SECS", 300)?),
            maintenance_interval: Duration::from_secs(parse_or(
                &lookup,
                "JOB_MAINTENANCE_INTERVAL_SECS",
                60,
            )?),
            completed_retention: Duration::from_secs(
                parse_or::<u64>(&lookup, "JOB_COMPLETED_RETENTION_HOURS", 168)?
                    .saturating_mul(60 * 60),
            ),
            backoff_base,
            known_job_types,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => parse_value(name, &value),
        _ => Ok(default),
    }
}

fn parse_value<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
