use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

/// Read an environment variable, treating an empty value as unset.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn env_string(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

/// Parse an environment variable, falling back to `default` when it is unset
/// or unparseable.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env_opt(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("ignoring {key}={raw:?} ({e}), using default {default}");
            default
        }),
    }
}

/// Truncate a payload for log output
pub fn preview(payload: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(&payload[..payload.len().min(max)]);
    if payload.len() > max {
        format!("{text}…")
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back() {
        // unique keys so parallel tests do not race
        unsafe {
            std::env::set_var("FLEET_UTIL_TEST_GOOD", "42");
            std::env::set_var("FLEET_UTIL_TEST_BAD", "forty-two");
        }

        assert_eq!(env_parse("FLEET_UTIL_TEST_GOOD", 7u32), 42);
        assert_eq!(env_parse("FLEET_UTIL_TEST_BAD", 7u32), 7);
        assert_eq!(env_parse("FLEET_UTIL_TEST_MISSING", 7u32), 7);
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview(b"short", 10), "short");
        assert_eq!(preview(b"0123456789abc", 10), "0123456789…");
    }
}
