//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.
//!
//! # Usage
//!
//! ```ignore
//! use rcm_core::env::env_get;
//!
//! let backlog: u32 = env_get("RCM_BACKLOG", 10);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset and unparsable values both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__RCM_TEST_UNSET_VAR__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__RCM_TEST_NUM__", " 123 ");
        let val: u32 = env_get("__RCM_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__RCM_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__RCM_TEST_INVALID__", "not_a_number");
        let val: u16 = env_get("__RCM_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__RCM_TEST_INVALID__");
    }
}
