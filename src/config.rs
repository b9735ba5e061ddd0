use std::env;
use std::time::Duration;

use crate::error::Error;

pub const ENV_POOL_CAPACITY: &str = "THREAD_IO_POOL_CAPACITY";
pub const ENV_POLL_INTERVAL_MS: &str = "THREAD_IO_POLL_INTERVAL_MS";
pub const ENV_THREAD_NAME_PREFIX: &str = "THREAD_IO_THREAD_NAME_PREFIX";

const DEFAULT_POOL_CAPACITY: usize = 5;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_THREAD_NAME_PREFIX: &str = "thread-io-runner";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of live runner threads.
    pub pool_capacity: usize,
    /// How long an idle runner waits on its queue before re-checking its liveness flag.
    pub poll_interval: Duration,
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `THREAD_IO_*` variable set in the environment.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        config.apply_env_overrides(|key| env::var(key).ok())?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self, read: impl Fn(&str) -> Option<String>) -> Result<(), Error> {
        if let Some(val) = read(ENV_POOL_CAPACITY) {
            let capacity = parse_number(ENV_POOL_CAPACITY, &val)?;
            self.pool_capacity = usize::try_from(capacity).map_err(|err| {
                Error::InvalidConfig(format!("{ENV_POOL_CAPACITY}={val:?}: {err}"))
            })?;
        }
        if let Some(val) = read(ENV_POLL_INTERVAL_MS) {
            self.poll_interval = Duration::from_millis(parse_number(ENV_POLL_INTERVAL_MS, &val)?);
        }
        if let Some(val) = read(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }

        Ok(())
    }

    pub fn pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.pool_capacity == 0 {
            return Err(Error::InvalidConfig(
                "pool_capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "poll_interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_number(key: &str, val: &str) -> Result<u64, Error> {
    val.trim()
        .parse()
        .map_err(|err| Error::InvalidConfig(format!("{key}={val:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn overrides(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.pool_capacity, 5);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(overrides(&[
                (ENV_POOL_CAPACITY, "3"),
                (ENV_POLL_INTERVAL_MS, " 50 "),
                (ENV_THREAD_NAME_PREFIX, "io"),
            ]))
            .unwrap();

        assert_eq!(
            config,
            Config::new()
                .pool_capacity(3)
                .poll_interval(Duration::from_millis(50))
                .thread_name_prefix("io")
        );
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(overrides(&[(ENV_POOL_CAPACITY, "many")]))
            .unwrap_err();

        assert!(matches!(err, Error::InvalidConfig(msg) if msg.starts_with(ENV_POOL_CAPACITY)));
    }

    #[test]
    fn test_capacity_out_of_range() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(overrides(&[(ENV_POOL_CAPACITY, "18446744073709551616")]))
            .unwrap_err();

        assert!(matches!(err, Error::InvalidConfig(msg) if msg.starts_with(ENV_POOL_CAPACITY)));
        assert_eq!(config.pool_capacity, 5);
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(Config::new().pool_capacity(0).validate().is_err());
        assert!(Config::new().poll_interval(Duration::ZERO).validate().is_err());
    }
}
