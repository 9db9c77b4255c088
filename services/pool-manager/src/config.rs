//! Configuration for the pool manager.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use warmpool_naming::{NameCodec, VersionTag};
use warmpool_reconcile::{FailurePolicy, PoolTarget, DEFAULT_BATCH_SIZE, DEFAULT_POOL_SIZE};

use crate::provisioner::{ProvisionerConfig, DEFAULT_POLL_INTERVAL};
use crate::reconciler::ReconcilerConfig;

/// Pool manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Platform API credential.
    pub api_key: String,

    /// Platform API base URL.
    pub api_url: String,

    /// Idle instances to keep ready.
    pub pool_size: u32,

    /// Maximum provisioning runs per tick.
    pub batch_size: u32,

    /// Interval between reconciliation ticks in seconds.
    pub check_interval_secs: u64,

    /// Template directory packed into every source bundle.
    pub template_dir: PathBuf,

    /// Release version; its digits form the name version tag.
    pub version: String,

    /// Instance name prefix.
    pub name_prefix: String,

    /// Region new instances are created in.
    pub region: String,

    /// Stack new instances are created on.
    pub stack: String,

    /// Fan-out failure policy.
    pub failure_policy: FailurePolicy,

    /// Claim API listen address; the API is not served when unset.
    pub listen_addr: Option<SocketAddr>,

    /// Email substrings allowed to claim; empty admits everyone.
    pub allowed_users: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = var("WARMPOOL_API_KEY").context("WARMPOOL_API_KEY must be set")?;

        let api_url = var("WARMPOOL_API_URL").unwrap_or_else(|| "https://api.heroku.com".to_string());

        let pool_size = parse_or(var("WARMPOOL_POOL_SIZE"), "WARMPOOL_POOL_SIZE", DEFAULT_POOL_SIZE)?;

        let batch_size = parse_or(var("WARMPOOL_BATCH_SIZE"), "WARMPOOL_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            bail!("WARMPOOL_BATCH_SIZE must be at least 1");
        }

        let check_interval_secs = parse_or(
            var("WARMPOOL_CHECK_INTERVAL_SECS"),
            "WARMPOOL_CHECK_INTERVAL_SECS",
            60,
        )?;
        if check_interval_secs == 0 {
            bail!("WARMPOOL_CHECK_INTERVAL_SECS must be at least 1");
        }

        let template_dir = var("WARMPOOL_TEMPLATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./template"));

        let version = var("WARMPOOL_VERSION").unwrap_or_else(|| "0.0.1".to_string());

        let name_prefix = var("WARMPOOL_NAME_PREFIX").unwrap_or_else(|| "cf".to_string());

        let region = var("WARMPOOL_REGION").unwrap_or_else(|| "us".to_string());

        let stack = var("WARMPOOL_STACK").unwrap_or_else(|| "container".to_string());

        let failure_policy = parse_or(
            var("WARMPOOL_FAILURE_POLICY"),
            "WARMPOOL_FAILURE_POLICY",
            FailurePolicy::default(),
        )?;

        let listen_addr = var("WARMPOOL_LISTEN_ADDR")
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("WARMPOOL_LISTEN_ADDR is not a socket address: {addr}"))
            })
            .transpose()?;

        let allowed_users = var("WARMPOOL_ALLOWED_USERS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let log_level = var("WARMPOOL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let config = Self {
            api_key,
            api_url,
            pool_size,
            batch_size,
            check_interval_secs,
            template_dir,
            version,
            name_prefix,
            region,
            stack,
            failure_policy,
            listen_addr,
            allowed_users,
            log_level,
        };

        // Validates prefix and version.
        config.codec()?;
        Ok(config)
    }

    /// Name codec for the configured prefix and version.
    pub fn codec(&self) -> Result<NameCodec> {
        let tag = VersionTag::from_release(&self.version)
            .with_context(|| format!("invalid WARMPOOL_VERSION {:?}", self.version))?;
        NameCodec::new(self.name_prefix.clone(), tag).context("invalid WARMPOOL_NAME_PREFIX")
    }

    /// Provisioner settings.
    pub fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            region: self.region.clone(),
            stack: self.stack.clone(),
            template_dir: self.template_dir.clone(),
            release_version: self.version.clone(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Reconciler settings.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            target: PoolTarget {
                desired_idle: self.pool_size,
                batch_size: self.batch_size,
            },
            check_interval: Duration::from_secs(self.check_interval_secs),
            failure_policy: self.failure_policy,
        }
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("WARMPOOL_API_KEY", "secret")]).unwrap();

        assert_eq!(config.api_url, "https://api.heroku.com");
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.check_interval_secs, 60);
        assert_eq!(config.template_dir, PathBuf::from("./template"));
        assert_eq!(config.version, "0.0.1");
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.listen_addr, None);
        assert!(config.allowed_users.is_empty());
        assert_eq!(config.codec().unwrap().current_version().as_str(), "001");
    }

    #[test]
    fn test_api_key_required() {
        assert!(load(&[]).is_err());
        assert!(load(&[("WARMPOOL_API_KEY", "  ")]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("WARMPOOL_API_KEY", "secret"),
            ("WARMPOOL_POOL_SIZE", "10"),
            ("WARMPOOL_BATCH_SIZE", "3"),
            ("WARMPOOL_CHECK_INTERVAL_SECS", "15"),
            ("WARMPOOL_VERSION", "1.2.0"),
            ("WARMPOOL_FAILURE_POLICY", "isolate"),
            ("WARMPOOL_LISTEN_ADDR", "127.0.0.1:8080"),
            ("WARMPOOL_ALLOWED_USERS", "@example.com, bob@ ,"),
        ])
        .unwrap();

        let reconciler = config.reconciler_config();
        assert_eq!(reconciler.target.desired_idle, 10);
        assert_eq!(reconciler.target.batch_size, 3);
        assert_eq!(reconciler.check_interval, Duration::from_secs(15));
        assert_eq!(reconciler.failure_policy, FailurePolicy::Isolate);
        assert_eq!(config.codec().unwrap().current_version().as_str(), "120");
        assert_eq!(config.listen_addr, Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(config.allowed_users, vec!["@example.com", "bob@"]);
        assert_eq!(config.provisioner_config().release_version, "1.2.0");
    }

    #[test]
    fn test_invalid_values() {
        let base = ("WARMPOOL_API_KEY", "secret");
        assert!(load(&[base, ("WARMPOOL_POOL_SIZE", "many")]).is_err());
        assert!(load(&[base, ("WARMPOOL_BATCH_SIZE", "0")]).is_err());
        assert!(load(&[base, ("WARMPOOL_CHECK_INTERVAL_SECS", "0")]).is_err());
        assert!(load(&[base, ("WARMPOOL_FAILURE_POLICY", "retry")]).is_err());
        assert!(load(&[base, ("WARMPOOL_VERSION", "v1-beta")]).is_err());
        assert!(load(&[base, ("WARMPOOL_NAME_PREFIX", "Bad_Prefix")]).is_err());
        assert!(load(&[base, ("WARMPOOL_LISTEN_ADDR", "localhost")]).is_err());
    }
}
