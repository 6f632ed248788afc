//! Environment variable parsing for config overrides.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_returns_default() {
        let v: usize = env_get("__TPC_TEST_UNSET__", 42);
        assert_eq!(v, 42);
        assert!(env_get_bool("__TPC_TEST_UNSET__", true));
    }

    #[test]
    fn parse_failure_returns_default() {
        std::env::set_var("__TPC_TEST_BAD__", "not-a-number");
        let v: usize = env_get("__TPC_TEST_BAD__", 7);
        assert_eq!(v, 7);
        std::env::remove_var("__TPC_TEST_BAD__");
    }
}
