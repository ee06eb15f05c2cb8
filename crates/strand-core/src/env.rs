//! Environment variable helpers
//!
//! Runtime configuration is overridable through `STRAND_*` environment
//! variables; these helpers parse them with typed defaults.

use std::str::FromStr;

/// Parse an environment variable as `T`, falling back to `default` when the
/// variable is unset or fails to parse.
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

/// Parse an environment variable as a boolean.
///
/// `"1"`, `"true"`, `"yes"` and `"on"` (case-insensitive) are true; any
/// other set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parse an environment variable, returning `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Read an environment variable as a string with a default.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check whether an environment variable is set at all.
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let n: usize = env_get("__STRAND_TEST_UNSET__", 7);
        assert_eq!(n, 7);
        assert!(env_get_bool("__STRAND_TEST_UNSET__", true));
        assert_eq!(env_get_opt::<u64>("__STRAND_TEST_UNSET__"), None);
        assert_eq!(env_get_str("__STRAND_TEST_UNSET__", "x"), "x");
        assert!(!env_is_set("__STRAND_TEST_UNSET__"));
    }

    #[test]
    fn test_parse_and_bool_variants() {
        std::env::set_var("__STRAND_TEST_NUM__", "128");
        assert_eq!(env_get("__STRAND_TEST_NUM__", 0usize), 128);
        std::env::set_var("__STRAND_TEST_NUM__", "not-a-number");
        assert_eq!(env_get("__STRAND_TEST_NUM__", 3usize), 3);
        std::env::remove_var("__STRAND_TEST_NUM__");

        std::env::set_var("__STRAND_TEST_FLAG__", "on");
        assert!(env_get_bool("__STRAND_TEST_FLAG__", false));
        std::env::set_var("__STRAND_TEST_FLAG__", "0");
        assert!(!env_get_bool("__STRAND_TEST_FLAG__", true));
        std::env::remove_var("__STRAND_TEST_FLAG__");
    }
}
