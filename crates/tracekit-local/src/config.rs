// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9999;
const DEFAULT_PORT_SEARCH_LIMIT: u16 = 100;
const DEFAULT_MAX_TRACES: usize = 1000;
const DEFAULT_MAX_AGE_SECS: u64 = 60 * 60;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
const DEFAULT_LOG_LEVEL: &str = "info";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Retention settings handed to the trace store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Count cap; the oldest records are dropped once exceeded.
    pub max_traces: usize,
    /// Records older than this are removed by the periodic sweep.
    pub max_age: Duration,
    /// How often the sweep runs.
    pub cleanup_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_traces: DEFAULT_MAX_TRACES,
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    /// First port tried; the server walks upward while ports are taken.
    pub port: u16,
    /// How many consecutive ports to try before giving up
    pub port_search_limit: u16,
    pub max_traces: usize,
    pub max_age: Duration,
    pub cleanup_interval: Duration,
    /// Largest accepted ingest body, in bytes
    pub max_request_content_length: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let store = StoreConfig::default();
        Config {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            port_search_limit: DEFAULT_PORT_SEARCH_LIMIT,
            max_traces: store.max_traces,
            max_age: store.max_age,
            cleanup_interval: store.cleanup_interval,
            max_request_content_length: 10 * 1024 * 1024, // 10MB in Bytes
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    /// Builds the configuration from `TRACEKIT_*` environment variables. Unset or unparsable
    /// values fall back to their defaults; the result is then validated.
    pub fn new() -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let config = Config {
            host: env::var("TRACEKIT_HOST").unwrap_or(defaults.host),
            port: parse_env("TRACEKIT_PORT").unwrap_or(defaults.port),
            port_search_limit: parse_env("TRACEKIT_PORT_SEARCH_LIMIT")
                .unwrap_or(defaults.port_search_limit),
            max_traces: parse_env("TRACEKIT_MAX_TRACES").unwrap_or(defaults.max_traces),
            max_age: parse_env("TRACEKIT_MAX_AGE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_age),
            cleanup_interval: parse_env("TRACEKIT_CLEANUP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
            max_request_content_length: defaults.max_request_content_length,
            log_level: env::var("TRACEKIT_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if IpAddr::from_str(&self.host).is_err() {
            return Err(ConfigError::Invalid(format!(
                "TRACEKIT_HOST must be an IP address, got '{}'",
                self.host
            )));
        }
        if self.port_search_limit == 0 {
            return Err(ConfigError::Invalid(
                "port search limit must be greater than 0".to_string(),
            ));
        }
        if self.max_traces == 0 {
            return Err(ConfigError::Invalid(
                "max traces must be greater than 0".to_string(),
            ));
        }
        if self.max_age.is_zero() {
            return Err(ConfigError::Invalid(
                "max trace age must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "cleanup interval must be greater than 0".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_traces: self.max_traces,
            max_age: self.max_age,
            cleanup_interval: self.cleanup_interval,
        }
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}
