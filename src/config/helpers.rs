//! Env var parsing shared by the config sections.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid unicode".to_string(),
        }),
    }
}

/// Parse an env var into `T`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

pub(crate) fn parse_string_env(key: &str, default: &str) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.to_string()))
}

pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{raw}'"),
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable name so parallel tests don't collide.

    #[test]
    fn test_parse_optional_env_default() {
        let v: u64 = parse_optional_env("SESSIONGATE_TEST_UNSET_U64", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn test_parse_string_env_default() {
        let v = parse_string_env("SESSIONGATE_TEST_UNSET_STR", "fallback").unwrap();
        assert_eq!(v, "fallback");
    }

    #[test]
    fn test_parse_bool_env_default() {
        assert!(parse_bool_env("SESSIONGATE_TEST_UNSET_BOOL", true).unwrap());
    }
}
