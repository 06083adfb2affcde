//! Configuration loading and representation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use locate_inference::{DeviceRequest, ResidencyConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct LocateConfig {
    pub residency: ResidencyConfig,
    /// Job worker threads
    pub workers: usize,
    pub bind: SocketAddr,
    pub upload_dir: PathBuf,
    /// Postgres URL; in-memory store when absent
    pub database_url: Option<String>,
    /// CSV gazetteer for the offline place resolver
    pub gazetteer: Option<PathBuf>,
    /// Emit audit events to the log
    pub audit: bool,
}

impl Default for LocateConfig {
    fn default() -> Self {
        Self {
            residency: ResidencyConfig::default(),
            workers: 1,
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upload_dir: PathBuf::from("./uploads"),
            database_url: None,
            gazetteer: None,
            audit: false,
        }
    }
}

impl LocateConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let device = match get("DEVICE") {
            Some(raw) => raw
                .parse::<DeviceRequest>()
                .map_err(|message| ConfigError::Invalid { var: "DEVICE", message })?,
            None => defaults.residency.device,
        };
        let idle_timeout = match get("MODEL_IDLE_TIMEOUT") {
            Some(raw) => Duration::from_secs(parse("MODEL_IDLE_TIMEOUT", &raw)?),
            None => defaults.residency.idle_timeout,
        };
        let sweep_interval = match get("MODEL_SWEEP_INTERVAL") {
            Some(raw) => match parse::<u64>("MODEL_SWEEP_INTERVAL", &raw)? {
                0 => return Err(invalid("MODEL_SWEEP_INTERVAL", "must be at least 1 second")),
                secs => Duration::from_secs(secs),
            },
            None => defaults.residency.sweep_interval,
        };
        let exclusive = match get("LOCATE_EXCLUSIVE_INFERENCE") {
            Some(raw) => parse_bool("LOCATE_EXCLUSIVE_INFERENCE", &raw)?,
            None => defaults.residency.exclusive_inference,
        };
        let workers = match get("LOCATE_WORKERS") {
            Some(raw) => match parse::<usize>("LOCATE_WORKERS", &raw)? {
                0 => return Err(invalid("LOCATE_WORKERS", "must be at least 1")),
                n => n,
            },
            None => defaults.workers,
        };
        let bind = match get("LOCATE_BIND") {
            Some(raw) => parse("LOCATE_BIND", &raw)?,
            None => defaults.bind,
        };
        let audit = match get("LOCATE_AUDIT") {
            Some(raw) => parse_bool("LOCATE_AUDIT", &raw)?,
            None => defaults.audit,
        };

        Ok(Self {
            residency: ResidencyConfig::default()
                .with_device(device)
                .with_idle_timeout(idle_timeout)
                .with_sweep_interval(sweep_interval)
                .with_exclusive_inference(exclusive),
            workers,
            bind,
            upload_dir: get("UPLOAD_DIR").map(PathBuf::from).unwrap_or(defaults.upload_dir),
            database_url: get("DATABASE_URL"),
            gazetteer: get("LOCATE_GAZETTEER").map(PathBuf::from),
            audit,
        })
    }
}

fn invalid(var: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        message: message.into(),
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| invalid(var, format!("'{raw}': {e}")))
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, format!("'{raw}' is not a boolean"))),
    }
}
