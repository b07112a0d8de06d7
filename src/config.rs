use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const ENV_CACHE_DIR: &str = "TUNNELKEEP_CACHE_DIR";
pub const ENV_ACCOUNT: &str = "TUNNELKEEP_ACCOUNT";
pub const ENV_INVENTORY: &str = "TUNNELKEEP_INVENTORY";
pub const ENV_AWS_BIN: &str = "TUNNELKEEP_AWS_BIN";
pub const ENV_READY_TIMEOUT: &str = "TUNNELKEEP_READY_TIMEOUT";
pub const ENV_HEALTH_TIMEOUT: &str = "TUNNELKEEP_HEALTH_TIMEOUT";
pub const ENV_SHUTDOWN_GRACE: &str = "TUNNELKEEP_SHUTDOWN_GRACE";
pub const ENV_LOCK_TIMEOUT: &str = "TUNNELKEEP_LOCK_TIMEOUT";

/// Remote session establishment is slow and occasionally spikes well past a minute
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid duration in {var}: {value:?} ({source})")]
    InvalidDuration {
        var: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Timing knobs of the tunnel manager
#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    /// bound on waiting for the session's readiness marker
    pub ready: Duration,
    /// bound on a single TCP health probe
    pub health: Duration,
    /// time between SIGTERM and SIGKILL
    pub shutdown_grace: Duration,
    /// bound on waiting for a concurrent open of the same tunnel
    pub lock: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: DEFAULT_READY_TIMEOUT,
            health: DEFAULT_HEALTH_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            lock: lock_timeout_for(DEFAULT_READY_TIMEOUT),
        }
    }
}

// a concurrent opener may hold the lock for a full readiness wait
fn lock_timeout_for(ready: Duration) -> Duration {
    ready + Duration::from_secs(30)
}

/// Values given on the command line; they win over the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub cache_dir: Option<PathBuf>,
    pub account: Option<String>,
    pub region: Option<String>,
    pub inventory: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// holds tunnel records, session logs and lock files
    pub cache_dir: PathBuf,
    pub account: Option<String>,
    pub region: Option<String>,
    /// static inventory used instead of AWS lookups
    pub inventory: Option<PathBuf>,
    pub aws_bin: String,
    pub timeouts: Timeouts,
}

impl Settings {
    pub fn from_env(overrides: Overrides) -> Result<Self, ConfigError> {
        Self::resolve(overrides, |name| std::env::var(name).ok())
    }

    /// Layer `overrides` over variables looked up through `lookup`
    pub fn resolve<F>(overrides: Overrides, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let duration = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match var(name) {
                Some(value) => {
                    humantime::parse_duration(value.trim()).map_err(|source| ConfigError::InvalidDuration {
                        var: name,
                        value,
                        source,
                    })
                }
                None => Ok(default),
            }
        };

        let ready = duration(ENV_READY_TIMEOUT, DEFAULT_READY_TIMEOUT)?;
        let timeouts = Timeouts {
            ready,
            health: duration(ENV_HEALTH_TIMEOUT, DEFAULT_HEALTH_TIMEOUT)?,
            shutdown_grace: duration(ENV_SHUTDOWN_GRACE, DEFAULT_SHUTDOWN_GRACE)?,
            lock: duration(ENV_LOCK_TIMEOUT, lock_timeout_for(ready))?,
        };

        Ok(Settings {
            cache_dir: overrides
                .cache_dir
                .or_else(|| var(ENV_CACHE_DIR).map(PathBuf::from))
                .unwrap_or_else(default_cache_dir),
            account: overrides.account.or_else(|| var(ENV_ACCOUNT)),
            region: overrides
                .region
                .or_else(|| var("AWS_REGION"))
                .or_else(|| var("AWS_DEFAULT_REGION")),
            inventory: overrides.inventory.or_else(|| var(ENV_INVENTORY).map(PathBuf::from)),
            aws_bin: var(ENV_AWS_BIN).unwrap_or_else(|| "aws".to_string()),
            timeouts,
        })
    }
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tunnelkeep")
        .join("tunnels")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(Overrides::default(), lookup(&[])).unwrap();

        assert_eq!(settings.cache_dir, default_cache_dir());
        assert_eq!(settings.aws_bin, "aws");
        assert!(settings.account.is_none());
        assert!(settings.region.is_none());
        assert_eq!(settings.timeouts, Timeouts::default());
        assert!(settings.timeouts.lock > settings.timeouts.ready);
    }

    #[test]
    fn test_env_values() {
        let settings = Settings::resolve(
            Overrides::default(),
            lookup(&[
                (ENV_CACHE_DIR, "/var/cache/tk"),
                (ENV_ACCOUNT, "123456789012"),
                ("AWS_DEFAULT_REGION", "eu-west-1"),
                (ENV_READY_TIMEOUT, "5m"),
                (ENV_HEALTH_TIMEOUT, "750ms"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.cache_dir, PathBuf::from("/var/cache/tk"));
        assert_eq!(settings.account.as_deref(), Some("123456789012"));
        assert_eq!(settings.region.as_deref(), Some("eu-west-1"));
        assert_eq!(settings.timeouts.ready, Duration::from_secs(300));
        assert_eq!(settings.timeouts.health, Duration::from_millis(750));
        assert_eq!(settings.timeouts.lock, Duration::from_secs(330));
    }

    #[test]
    fn test_overrides_win() {
        let overrides = Overrides {
            cache_dir: Some(PathBuf::from("/tmp/tk")),
            region: Some("us-west-2".to_string()),
            ..Default::default()
        };
        let settings = Settings::resolve(
            overrides,
            lookup(&[(ENV_CACHE_DIR, "/var/cache/tk"), ("AWS_REGION", "eu-west-1")]),
        )
        .unwrap();

        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/tk"));
        assert_eq!(settings.region.as_deref(), Some("us-west-2"));
    }

    #[test]
    fn test_invalid_duration() {
        let err = Settings::resolve(Overrides::default(), lookup(&[(ENV_SHUTDOWN_GRACE, "soon")])).unwrap_err();
        assert!(err.to_string().contains(ENV_SHUTDOWN_GRACE));
    }
}
