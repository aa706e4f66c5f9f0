//! Miner configuration.
//!
//! Parsed once from environment variables at startup and passed down by
//! reference; nothing reads the environment afterwards.
//!
//! # Environment Variables
//!
//! - `FPGA_MINER_POOL_URL`: pool URLs in priority order, separated by `;`
//!   (required). Credentials may be given as URL userinfo.
//! - `FPGA_MINER_POOL_USER` / `FPGA_MINER_POOL_PASS`: credentials for URLs
//!   without userinfo
//! - `FPGA_MINER_LONGPOLL_URL`: long-poll URL, overrides discovery
//! - `FPGA_MINER_CONNECTION_EFFORT`: scales timeouts and error thresholds
//!   (default: 2.0)
//! - `FPGA_MINER_OVERHEAT_THRESHOLD`: hash rate drop treated as a fault
//!   (default: 0.04)
//! - `FPGA_MINER_MAX_ERROR_RATE`: error ceiling of the frequency search
//!   (default: 0.05)
//! - `FPGA_MINER_TEMP_LIMIT`: temperature limit in degrees Celsius
//!   (default: 65)
//! - `FPGA_MINER_TARGET_CHECK`: honor the pool's share target
//! - `FPGA_MINER_POLL_INTERVAL_MS`: minimum scheduler cycle (default: 250)
//! - `FPGA_MINER_LOG_FILE`: mirror the log into this file
//! - `FPGA_MINER_SHARE_LOG`: append every submitted nonce to this file
//! - `FPGA_MINER_SIM_DEVICES`: number of simulated boards to attach
//! - `FPGA_MINER_SIM_UNITS`: compute units per simulated board (default: 1)

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::{
    block_monitor::LongPollEndpoint,
    frequency::FrequencyConfig,
    pool::{ClientConfig, PoolEndpoint},
    scheduler::SchedulerConfig,
    session::SessionConfig,
};

/// Errors validating the configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {var}={value}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Immutable miner configuration.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Pool endpoints in priority order.
    pub endpoints: Vec<PoolEndpoint>,
    pub long_poll: Option<LongPollEndpoint>,
    pub connection_effort: f64,
    pub frequency: FrequencyConfig,
    pub target_check: bool,
    pub poll_interval: Duration,
    pub log_file: Option<PathBuf>,
    pub share_log: Option<PathBuf>,
    pub sim_devices: usize,
    pub sim_units: usize,
}

impl MinerConfig {
    /// Parse and validate the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let user = env::var("FPGA_MINER_POOL_USER").unwrap_or_default();
        let password = env::var("FPGA_MINER_POOL_PASS").unwrap_or_default();

        let urls = env::var("FPGA_MINER_POOL_URL").map_err(|_| ConfigError::Missing("FPGA_MINER_POOL_URL"))?;
        let endpoints = urls
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                PoolEndpoint::parse(s, &user, &password).map_err(|e| ConfigError::Invalid {
                    var: "FPGA_MINER_POOL_URL",
                    value: s.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(ConfigError::Missing("FPGA_MINER_POOL_URL"));
        }

        let long_poll = match env::var("FPGA_MINER_LONGPOLL_URL") {
            Ok(s) if !s.trim().is_empty() => {
                let ep = PoolEndpoint::parse(&s, &user, &password).map_err(|e| ConfigError::Invalid {
                    var: "FPGA_MINER_LONGPOLL_URL",
                    value: s.clone(),
                    reason: e.to_string(),
                })?;
                Some(LongPollEndpoint {
                    url: ep.url.to_string(),
                    user: ep.user,
                    password: ep.password,
                })
            }
            _ => None,
        };

        let connection_effort: f64 = parse_var("FPGA_MINER_CONNECTION_EFFORT", 2.0)?;
        check("FPGA_MINER_CONNECTION_EFFORT", connection_effort, |v| {
            v.is_finite() && v > 0.0
        })?;

        let defaults = FrequencyConfig::default();
        let overheat_threshold = parse_var("FPGA_MINER_OVERHEAT_THRESHOLD", defaults.overheat_threshold)?;
        check("FPGA_MINER_OVERHEAT_THRESHOLD", overheat_threshold, |v| {
            (0.0..1.0).contains(&v)
        })?;
        let max_error_rate = parse_var("FPGA_MINER_MAX_ERROR_RATE", defaults.max_error_rate)?;
        check("FPGA_MINER_MAX_ERROR_RATE", max_error_rate, |v| {
            v > 0.0 && v <= 1.0
        })?;
        let temp_limit = parse_var("FPGA_MINER_TEMP_LIMIT", defaults.temp_limit)?;
        check("FPGA_MINER_TEMP_LIMIT", temp_limit, f64::is_finite)?;

        let poll_ms: u64 = parse_var("FPGA_MINER_POLL_INTERVAL_MS", 250)?;
        if poll_ms == 0 {
            return Err(ConfigError::Invalid {
                var: "FPGA_MINER_POLL_INTERVAL_MS",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        Ok(Self {
            endpoints,
            long_poll,
            connection_effort,
            frequency: FrequencyConfig {
                max_error_rate,
                overheat_threshold,
                temp_limit,
            },
            target_check: flag("FPGA_MINER_TARGET_CHECK"),
            poll_interval: Duration::from_millis(poll_ms),
            log_file: path_var("FPGA_MINER_LOG_FILE"),
            share_log: path_var("FPGA_MINER_SHARE_LOG"),
            sim_devices: parse_var("FPGA_MINER_SIM_DEVICES", 0)?,
            sim_units: parse_var::<usize>("FPGA_MINER_SIM_UNITS", 1)?.max(1),
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connection_effort: self.connection_effort,
            target_check: self.target_check,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            frequency: self.frequency,
            ..Default::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: self.poll_interval,
            ..Default::default()
        }
    }
}

fn parse_var<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn check(var: &'static str, value: f64, valid: impl Fn(f64) -> bool) -> Result<(), ConfigError> {
    if valid(value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "out of range".into(),
        })
    }
}

fn flag(var: &str) -> bool {
    env::var(var).is_ok_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn path_var(var: &str) -> Option<PathBuf> {
    env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from)
}
