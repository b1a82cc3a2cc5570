//! Environment variable helpers
//!
//! Runtime knobs (`GREENLET_*`) are read through these so a malformed value
//! falls back to the default instead of failing startup.

use std::str::FromStr;

/// Parse `key` as `T`, or return `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, anything
/// else set is false, unset is `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
