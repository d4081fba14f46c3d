//! Resolver configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Behavior when the authoritative datacenter cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownPolicy {
    /// Fail open with an allow-all authorizer
    Allow,
    /// Fail closed with a deny-all authorizer
    Deny,
    /// Serve the last known value, waiting for the refresh
    ExtendCache,
    /// Serve the last known value without waiting for the refresh
    AsyncCache,
}

impl DownPolicy {
    /// Whether stale cache entries may be served when the authority fails.
    pub fn extends_cache(self) -> bool {
        matches!(self, DownPolicy::ExtendCache | DownPolicy::AsyncCache)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownPolicy::Allow => "allow",
            DownPolicy::Deny => "deny",
            DownPolicy::ExtendCache => "extend-cache",
            DownPolicy::AsyncCache => "async-cache",
        }
    }
}

impl Default for DownPolicy {
    fn default() -> Self {
        DownPolicy::ExtendCache
    }
}

impl fmt::Display for DownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(DownPolicy::Allow),
            "deny" => Ok(DownPolicy::Deny),
            "extend-cache" => Ok(DownPolicy::ExtendCache),
            "async-cache" => Ok(DownPolicy::AsyncCache),
            other => anyhow::bail!("Unknown down policy: {}", other),
        }
    }
}

/// Global fallback decision applied after every policy layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultPolicy {
    Allow,
    Deny,
}

impl DefaultPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DefaultPolicy::Allow => "allow",
            DefaultPolicy::Deny => "deny",
        }
    }
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        DefaultPolicy::Allow
    }
}

impl fmt::Display for DefaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefaultPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(DefaultPolicy::Allow),
            "deny" => Ok(DefaultPolicy::Deny),
            other => anyhow::bail!("Unknown default policy: {}", other),
        }
    }
}

/// Capacity of each resolver cache
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSizes {
    #[serde(default = "default_cache_size")]
    pub identities: usize,
    #[serde(default = "default_cache_size")]
    pub policies: usize,
    #[serde(default = "default_cache_size")]
    pub parsed_policies: usize,
    #[serde(default = "default_cache_size")]
    pub authorizers: usize,
    #[serde(default = "default_cache_size")]
    pub roles: usize,
}

impl Default for CacheSizes {
    fn default() -> Self {
        Self {
            identities: default_cache_size(),
            policies: default_cache_size(),
            parsed_policies: default_cache_size(),
            authorizers: default_cache_size(),
            roles: default_cache_size(),
        }
    }
}

/// Token resolver configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AclResolverConfig {
    /// Master switch; when false every resolution yields no authorizer
    #[serde(default = "default_true")]
    pub acls_enabled: bool,

    /// Datacenter this resolver runs in, used for policy scope filtering
    pub datacenter: String,

    /// Name of the local agent, used by the agent recovery authorizer
    #[serde(default)]
    pub node_name: String,

    #[serde(default)]
    pub down_policy: DownPolicy,

    #[serde(default)]
    pub default_policy: DefaultPolicy,

    /// Local ceiling on identity cache freshness
    #[serde(default = "default_ttl")]
    pub token_ttl_ms: u64,

    /// Local ceiling on policy cache freshness
    #[serde(default = "default_ttl")]
    pub policy_ttl_ms: u64,

    /// Local ceiling on role cache freshness
    #[serde(default = "default_ttl")]
    pub role_ttl_ms: u64,

    /// How long ACLs stay off after a server reports them disabled
    /// (0 turns auto-disable off)
    #[serde(default)]
    pub disable_duration_ms: u64,

    /// Enforce node and session rules (pre-v8 clusters skip them)
    #[serde(default = "default_true")]
    pub enforce_version8: bool,

    #[serde(default = "default_max_retries")]
    pub policy_resolution_max_retries: usize,

    #[serde(default = "default_max_retries")]
    pub role_resolution_max_retries: usize,

    /// Token that resolves locally to the agent recovery authorizer
    #[serde(default)]
    pub agent_recovery_token: Option<String>,

    #[serde(default)]
    pub cache: CacheSizes,
}

// Default value functions
fn default_true() -> bool { true }
fn default_ttl() -> u64 { 30_000 }
fn default_max_retries() -> usize { 5 }
fn default_cache_size() -> usize { 10 * 1024 }

impl AclResolverConfig {
    /// Configuration with defaults for the given datacenter
    pub fn new(datacenter: impl Into<String>) -> Self {
        Self {
            acls_enabled: true,
            datacenter: datacenter.into(),
            node_name: String::new(),
            down_policy: DownPolicy::default(),
            default_policy: DefaultPolicy::default(),
            token_ttl_ms: default_ttl(),
            policy_ttl_ms: default_ttl(),
            role_ttl_ms: default_ttl(),
            disable_duration_ms: 0,
            enforce_version8: true,
            policy_resolution_max_retries: default_max_retries(),
            role_resolution_max_retries: default_max_retries(),
            agent_recovery_token: None,
            cache: CacheSizes::default(),
        }
    }

    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read configuration file {}", path.as_ref().display()))?;

        let config: AclResolverConfig = toml::from_str(&contents)
            .context("Failed to parse configuration file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.datacenter.is_empty() {
            anyhow::bail!("datacenter must be set");
        }

        if self.token_ttl_ms == 0 || self.policy_ttl_ms == 0 || self.role_ttl_ms == 0 {
            anyhow::bail!("Cache TTLs must be greater than zero");
        }

        if self.policy_resolution_max_retries == 0 || self.role_resolution_max_retries == 0 {
            anyhow::bail!("Resolution retry bounds must be at least 1");
        }

        let sizes = &self.cache;
        if sizes.identities == 0
            || sizes.policies == 0
            || sizes.parsed_policies == 0
            || sizes.authorizers == 0
            || sizes.roles == 0
        {
            anyhow::bail!("Cache sizes must be greater than zero");
        }

        if matches!(self.agent_recovery_token.as_deref(), Some("")) {
            anyhow::bail!("agent_recovery_token must not be empty when set");
        }

        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(self.token_ttl_ms)
    }

    pub fn policy_ttl(&self) -> Duration {
        Duration::from_millis(self.policy_ttl_ms)
    }

    pub fn role_ttl(&self) -> Duration {
        Duration::from_millis(self.role_ttl_ms)
    }

    /// Auto-disable window, `None` when auto-disable is off
    pub fn disable_duration(&self) -> Option<Duration> {
        if self.disable_duration_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.disable_duration_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AclResolverConfig::new("dc1");
        assert!(config.acls_enabled);
        assert_eq!(config.down_policy, DownPolicy::ExtendCache);
        assert_eq!(config.default_policy, DefaultPolicy::Allow);
        assert_eq!(config.token_ttl(), Duration::from_secs(30));
        assert_eq!(config.policy_resolution_max_retries, 5);
        assert_eq!(config.role_resolution_max_retries, 5);
        assert_eq!(config.disable_duration(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_policy_spellings() {
        for policy in [
            DownPolicy::Allow,
            DownPolicy::Deny,
            DownPolicy::ExtendCache,
            DownPolicy::AsyncCache,
        ] {
            assert_eq!(policy.to_string().parse::<DownPolicy>().unwrap(), policy);
        }
        assert!("extend".parse::<DownPolicy>().is_err());
        assert_eq!("deny".parse::<DefaultPolicy>().unwrap(), DefaultPolicy::Deny);
        assert!(DownPolicy::AsyncCache.extends_cache());
        assert!(!DownPolicy::Deny.extends_cache());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
datacenter = "dc2"
down_policy = "async-cache"
default_policy = "deny"
token_ttl_ms = 2000
disable_duration_ms = 10000

[cache]
identities = 16
"#
        )
        .unwrap();

        let config = AclResolverConfig::from_file(file.path()).unwrap();
        assert_eq!(config.datacenter, "dc2");
        assert_eq!(config.down_policy, DownPolicy::AsyncCache);
        assert_eq!(config.default_policy, DefaultPolicy::Deny);
        assert_eq!(config.token_ttl(), Duration::from_secs(2));
        assert_eq!(config.policy_ttl(), Duration::from_secs(30));
        assert_eq!(config.disable_duration(), Some(Duration::from_secs(10)));
        assert_eq!(config.cache.identities, 16);
        assert_eq!(config.cache.roles, 10 * 1024);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AclResolverConfig::new("");
        assert!(config.validate().is_err());

        config.datacenter = "dc1".into();
        config.policy_resolution_max_retries = 0;
        assert!(config.validate().is_err());

        config.policy_resolution_max_retries = 5;
        config.agent_recovery_token = Some(String::new());
        assert!(config.validate().is_err());
    }
}
