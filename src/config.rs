use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveTime};

use crate::model::{HOUR_MS, MINUTE_MS, Ms, Span};

/// Business hours and slot granularity, shared by every mechanic in a shop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShopHours {
    pub open_hour: u32,
    pub close_hour: u32,
    pub stride_minutes: u32,
    /// Shop-local offset from UTC, used to turn a calendar date into instants.
    pub utc_offset_minutes: i32,
}

impl Default for ShopHours {
    fn default() -> Self {
        Self {
            open_hour: 9,
            close_hour: 18,
            stride_minutes: 30,
            utc_offset_minutes: 0,
        }
    }
}

impl ShopHours {
    pub fn new(open_hour: u32, close_hour: u32, stride_minutes: u32) -> Result<Self, ConfigError> {
        let hours = Self {
            open_hour,
            close_hour,
            stride_minutes,
            utc_offset_minutes: 0,
        };
        hours.validate()?;
        Ok(hours)
    }

    pub fn with_utc_offset(mut self, minutes: i32) -> Result<Self, ConfigError> {
        self.utc_offset_minutes = minutes;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.close_hour > 24 {
            return Err(ConfigError::Invalid("close hour must be at most 24"));
        }
        if self.open_hour >= self.close_hour {
            return Err(ConfigError::Invalid("open hour must be before close hour"));
        }
        if self.stride_minutes == 0 {
            return Err(ConfigError::Invalid("stride must be positive"));
        }
        if self.stride_minutes > 24 * 60 {
            return Err(ConfigError::Invalid("stride longer than a day"));
        }
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(ConfigError::Invalid("utc offset beyond ±14h"));
        }
        Ok(())
    }

    /// Read `WORKBAY_OPEN_HOUR`, `WORKBAY_CLOSE_HOUR`, `WORKBAY_STRIDE_MINUTES`
    /// and `WORKBAY_UTC_OFFSET_MINUTES`, falling back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let hours = Self {
            open_hour: env_or("WORKBAY_OPEN_HOUR", defaults.open_hour),
            close_hour: env_or("WORKBAY_CLOSE_HOUR", defaults.close_hour),
            stride_minutes: env_or("WORKBAY_STRIDE_MINUTES", defaults.stride_minutes),
            utc_offset_minutes: env_or("WORKBAY_UTC_OFFSET_MINUTES", defaults.utc_offset_minutes),
        };
        hours.validate()?;
        Ok(hours)
    }

    pub fn stride_ms(&self) -> Ms {
        self.stride_minutes as Ms * MINUTE_MS
    }

    fn offset_ms(&self) -> Ms {
        self.utc_offset_minutes as Ms * MINUTE_MS
    }

    /// `[open, close)` on `date`, in UTC milliseconds.
    pub fn day_window(&self, date: NaiveDate) -> Span {
        let midnight = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis() - self.offset_ms();
        Span::new(
            midnight + self.open_hour as Ms * HOUR_MS,
            midnight + self.close_hour as Ms * HOUR_MS,
        )
    }

    /// The shop-local calendar date an instant falls on. `None` when the
    /// instant is out of range once shifted.
    pub fn local_date(&self, t: Ms) -> Option<NaiveDate> {
        let local = t.checked_add(self.offset_ms())?;
        DateTime::from_timestamp_millis(local).map(|dt| dt.date_naive())
    }
}

/// Process-level settings for the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub hours: ShopHours,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_connections = env_or("WORKBAY_MAX_CONNECTIONS", 256usize);
        if max_connections == 0 {
            return Err(ConfigError::Invalid("max connections must be positive"));
        }
        Ok(Self {
            bind: std::env::var("WORKBAY_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("WORKBAY_PORT", 5433),
            data_dir: PathBuf::from(
                std::env::var("WORKBAY_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            password: std::env::var("WORKBAY_PASSWORD").unwrap_or_else(|_| "workbay".into()),
            max_connections,
            compact_threshold: env_or("WORKBAY_COMPACT_THRESHOLD", 1000),
            metrics_port: std::env::var("WORKBAY_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            tls_cert: std::env::var("WORKBAY_TLS_CERT").ok(),
            tls_key: std::env::var("WORKBAY_TLS_KEY").ok(),
            hours: ShopHours::from_env()?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
