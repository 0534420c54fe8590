use std::env;

use crate::errors::ServiceError;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_MAX_BATCH_SIZE: usize = 100;
const DEFAULT_RETRY_CEILING: u32 = 10;

/// Runtime configuration for the sync server, sourced from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub max_batch_size: usize,
    pub retry_ceiling: u32,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ServiceError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build config from any key lookup. Tests use this to avoid touching
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServiceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = required(&lookup, "DATABASE_URL")?;
        let bind_addr =
            lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let max_batch_size =
            parse_or(&lookup, "MAX_BATCH_SIZE", DEFAULT_MAX_BATCH_SIZE)?;
        let retry_ceiling =
            parse_or(&lookup, "MAX_RETRIES_CEILING", DEFAULT_RETRY_CEILING)?;

        if max_batch_size == 0 {
            return Err(ServiceError::Configuration(
                "MAX_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            database_url,
            bind_addr,
            max_batch_size,
            retry_ceiling,
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ServiceError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ServiceError::Configuration(format!("{} must be set", key)))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ServiceError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ServiceError::Configuration(format!("{} is not a valid number: {}", key, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_applied_when_optional_keys_missing() {
        let config =
            ServerConfig::from_lookup(lookup_from(&[("DATABASE_URL", "sqlite::memory:")]))
                .unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(config.retry_ceiling, DEFAULT_RETRY_CEILING);
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let err = ServerConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn overrides_parsed_from_environment() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite:pos.db"),
            ("BIND_ADDR", "0.0.0.0:9000"),
            ("MAX_BATCH_SIZE", "50"),
            ("MAX_RETRIES_CEILING", "5"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.retry_ceiling, 5);
    }

    #[test]
    fn non_numeric_batch_size_rejected() {
        let err = ServerConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite:pos.db"),
            ("MAX_BATCH_SIZE", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("MAX_BATCH_SIZE"));
    }
}
