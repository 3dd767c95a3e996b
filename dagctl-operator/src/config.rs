//! Operator configuration
//!
//! Defines all configurable parameters for the operator including
//! reconcile pacing, scheduling backoff and the defaults baked into every
//! execution unit.

use std::time::Duration;

/// Fixed values used when a project leaves a field unset
#[derive(Debug, Clone)]
pub struct UnitDefaults {
    /// Main step image when the project declares none
    pub image: String,

    /// Image of the source-fetch step
    pub git_image: String,

    /// Ref checked out when the project declares none
    pub git_ref: String,

    /// Mount point of the shared workspace volume
    pub workspace_root: String,

    /// Verb run when neither the run nor the project declares commands
    pub command: String,

    /// Executable prepended to every resolved command
    pub tool: String,

    pub ssh_mount_path: String,

    /// File mode of the mounted ssh key
    pub ssh_key_mode: i32,

    pub profiles_mount_path: String,

    /// Appended to the run name to name its execution unit
    pub unit_suffix: String,
}

impl Default for UnitDefaults {
    fn default() -> Self {
        Self {
            image: "ghcr.io/dbt-labs/dbt-postgres:1.7.0".to_string(),
            git_image: "alpine/git:latest".to_string(),
            git_ref: "main".to_string(),
            workspace_root: "/workspace".to_string(),
            command: "run".to_string(),
            tool: "dbt".to_string(),
            ssh_mount_path: "/root/.ssh".to_string(),
            ssh_key_mode: 0o400,
            profiles_mount_path: "/root/.dbt".to_string(),
            unit_suffix: "job".to_string(),
        }
    }
}

/// Operator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API bind address
    pub bind_addr: String,

    /// Delay before retrying a project whose schedule failed to install
    pub schedule_retry: Duration,

    /// Interval of the full resync each controller performs
    pub resync_interval: Duration,

    /// Maximum reconciles running at once, per controller
    pub max_concurrent_reconciles: usize,

    /// How long a run tolerates its execution unit being absent before
    /// it is declared lost
    pub unit_missing_grace: Duration,

    pub unit_defaults: UnitDefaults,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - DAGCTL_BIND_ADDR (default: 0.0.0.0:8080)
    /// - DAGCTL_SCHEDULE_RETRY_SECS (default: 60)
    /// - DAGCTL_RESYNC_SECS (default: 300)
    /// - DAGCTL_MAX_CONCURRENT_RECONCILES (default: 4)
    /// - DAGCTL_UNIT_MISSING_GRACE_SECS (default: 10)
    /// - DAGCTL_DEFAULT_IMAGE
    /// - DAGCTL_GIT_IMAGE
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let secs = |name: &str, fallback: Duration| -> anyhow::Result<Duration> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| anyhow::anyhow!("{} must be a number of seconds, got '{}'", name, raw)),
                None => Ok(fallback),
            }
        };

        let max_concurrent_reconciles = match lookup("DAGCTL_MAX_CONCURRENT_RECONCILES") {
            Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
                anyhow::anyhow!("DAGCTL_MAX_CONCURRENT_RECONCILES must be a number, got '{}'", raw)
            })?,
            None => defaults.max_concurrent_reconciles,
        };

        let mut unit_defaults = defaults.unit_defaults.clone();
        if let Some(image) = lookup("DAGCTL_DEFAULT_IMAGE") {
            unit_defaults.image = image;
        }
        if let Some(image) = lookup("DAGCTL_GIT_IMAGE") {
            unit_defaults.git_image = image;
        }

        Ok(Self {
            bind_addr: lookup("DAGCTL_BIND_ADDR").unwrap_or(defaults.bind_addr),
            schedule_retry: secs("DAGCTL_SCHEDULE_RETRY_SECS", defaults.schedule_retry)?,
            resync_interval: secs("DAGCTL_RESYNC_SECS", defaults.resync_interval)?,
            max_concurrent_reconciles,
            unit_missing_grace: secs("DAGCTL_UNIT_MISSING_GRACE_SECS", defaults.unit_missing_grace)?,
            unit_defaults,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.schedule_retry.is_zero() {
            anyhow::bail!("schedule_retry must be greater than 0");
        }

        if self.resync_interval.is_zero() {
            anyhow::bail!("resync_interval must be greater than 0");
        }

        if self.max_concurrent_reconciles == 0 {
            anyhow::bail!("max_concurrent_reconciles must be greater than 0");
        }

        let defaults = &self.unit_defaults;
        if defaults.image.is_empty() || defaults.git_image.is_empty() {
            anyhow::bail!("default images cannot be empty");
        }

        if !defaults.workspace_root.starts_with('/') {
            anyhow::bail!("workspace_root must be an absolute path");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            schedule_retry: Duration::from_secs(60),
            resync_interval: Duration::from_secs(300),
            max_concurrent_reconciles: 4,
            unit_missing_grace: Duration::from_secs(10),
            unit_defaults: UnitDefaults::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.schedule_retry, Duration::from_secs(60));
        assert_eq!(config.unit_defaults.git_ref, "main");
        assert_eq!(config.unit_defaults.ssh_key_mode, 0o400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("DAGCTL_SCHEDULE_RETRY_SECS", "5"),
            ("DAGCTL_MAX_CONCURRENT_RECONCILES", "8"),
            ("DAGCTL_DEFAULT_IMAGE", "custom:1"),
        ]))
        .unwrap();

        assert_eq!(config.schedule_retry, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_reconciles, 8);
        assert_eq!(config.unit_defaults.image, "custom:1");
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        assert!(Config::from_lookup(lookup_from(&[("DAGCTL_RESYNC_SECS", "soon")])).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.max_concurrent_reconciles = 0;
        assert!(config.validate().is_err());
        config.max_concurrent_reconciles = 1;

        config.unit_defaults.workspace_root = "workspace".to_string();
        assert!(config.validate().is_err());
        config.unit_defaults.workspace_root = "/workspace".to_string();

        assert!(config.validate().is_ok());
    }
}
