//! `MBH_*` environment overrides.
//!
//! [`EnvParser`] reads one variable at a time, keeps going past bad values
//! and collects every problem so `HarnessConfig::load` can report them
//! together. Each value comes back as a [`Sourced`] so callers only
//! overwrite settings that were actually set.

use std::env;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::source::Sourced;

const PREFIX: &str = "MBH_";
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {range})")]
    OutOfRange {
        var: String,
        value: String,
        range: String,
    },

    #[error("Invalid log level for {var}: {value} (one of {})", LOG_LEVELS.join(", "))]
    InvalidLogLevel { var: String, value: String },
}

/// Reads `MBH_`-prefixed variables, recording rather than failing on bad input.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Full variable name and its value, if set.
    fn lookup(name: &str) -> (String, Option<String>) {
        let var = format!("{PREFIX}{name}");
        let value = env::var(&var).ok();
        (var, value)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        match Self::lookup(name) {
            (var, Some(value)) => Sourced::from_env(value, var),
            (_, None) => Sourced::default_value(default.to_string()),
        }
    }

    /// Empty counts as unset.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match Self::lookup(name) {
            (var, Some(value)) => Sourced::from_env(Some(value).filter(|v| !v.is_empty()), var),
            (_, None) => Sourced::default_value(None),
        }
    }

    /// A number inside `range`. Unparseable or out-of-range values fall back
    /// to `default` and are recorded.
    pub fn get_in_range<T>(
        &mut self,
        name: &str,
        default: T,
        range: RangeInclusive<T>,
        expected: &'static str,
    ) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display,
    {
        let (var, Some(raw)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match raw.trim().parse::<T>() {
            Ok(n) if range.contains(&n) => Sourced::from_env(n, var),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    range: format!("{}..={}", range.start(), range.end()),
                    value: n.to_string(),
                    var,
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected,
                    value: raw,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Durations in humantime form: `30s`, `2m`, `1500ms`, `1m 30s`.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let (var, Some(raw)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match humantime::parse_duration(raw.trim()) {
            Ok(duration) => Sourced::from_env(duration, var),
            Err(_) => {
                self.errors.push(EnvError::InvalidDuration { var, value: raw });
                Sourced::default_value(default)
            }
        }
    }

    /// A `tracing` level name, lowercased.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let (var, Some(raw)) = Self::lookup(name) else {
            return Sourced::default_value(default.to_string());
        };
        let level = raw.trim().to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            Sourced::from_env(level, var)
        } else {
            self.errors.push(EnvError::InvalidLogLevel { var, value: raw });
            Sourced::default_value(default.to_string())
        }
    }
}

/// Expand a leading `~/` to the home directory.
pub(crate) fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}
