//! Environment helpers for `from_env` constructors
//!
//! Every setting falls back to its default when the variable is unset or
//! does not parse.

use std::str::FromStr;
use std::time::Duration;

/// Prefix of all engine environment variables
pub const ENV_PREFIX: &str = "STEADFAST_";

/// Parse `STEADFAST_<name>`
pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse `STEADFAST_<name>` as milliseconds
pub(crate) fn env_millis_or(name: &str, default: Duration) -> Duration {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Parse `STEADFAST_<name>` as a comma separated list
pub(crate) fn env_list_or(name: &str, default: Vec<String>) -> Vec<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .filter(|list| !list.is_empty())
        .unwrap_or(default)
}

/// Read `STEADFAST_<name>` as a string
pub(crate) fn env_string_or(name: &str, default: impl Into<String>) -> String {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.into())
}
