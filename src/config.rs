//! Configuration management for ionos-ddns.

use crate::error::{DdnsError, Result};
use crate::record::{ManagedRecord, RecordType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Polling interval in seconds (default: 300 = 5 minutes).
    #[serde(default = "default_interval")]
    pub check_interval_secs: u64,

    /// Interval between heartbeat log lines (default: 21600 = 6 hours).
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,

    /// IPv4 address-lookup services, tried in order.
    #[serde(default = "default_ip_services")]
    pub ip_services: Vec<String>,

    /// IPv6 address-lookup services, tried in order.
    #[serde(default = "default_ipv6_services")]
    pub ipv6_services: Vec<String>,

    /// Per-endpoint lookup timeout in seconds.
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_secs: u64,

    /// Whether records share one address lookup per cycle.
    #[serde(default)]
    pub resolve_policy: ResolvePolicy,

    /// IONOS API key (`prefix.secret`, or an environment variable name if prefixed with $).
    #[serde(default)]
    pub api_key: String,

    /// IONOS DNS API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Provider request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// State file location.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Port for `/healthz` and `/status`; disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_port: Option<u16>,

    /// Consecutive transient failures before a record is marked failed.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    /// Retry backoff settings.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Records under management.
    #[serde(default)]
    pub records: Vec<ManagedRecord>,
}

fn default_interval() -> u64 {
    300
}

fn default_heartbeat() -> u64 {
    21600
}

fn default_ip_services() -> Vec<String> {
    vec![
        "https://api.ipify.org".to_string(),
        "https://icanhazip.com".to_string(),
        "https://ifconfig.me/ip".to_string(),
        "https://ipecho.net/plain".to_string(),
    ]
}

fn default_ipv6_services() -> Vec<String> {
    vec![
        "https://api6.ipify.org".to_string(),
        "https://v6.ident.me".to_string(),
        "https://ipv6.icanhazip.com".to_string(),
    ]
}

fn default_lookup_timeout() -> u64 {
    10
}

fn default_api_url() -> String {
    "https://api.hosting.ionos.com/dns/v1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_state_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("ionos-ddns").join("state.json"))
        .unwrap_or_else(|| PathBuf::from("ionos-ddns-state.json"))
}

fn default_max_failures() -> u32 {
    5
}

/// How address lookups are shared between records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvePolicy {
    /// One lookup per address family and endpoint list per cycle.
    #[default]
    Shared,
    /// Every record resolves independently.
    PerRecord,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    #[serde(default = "default_backoff_base")]
    pub base_secs: u64,

    /// Upper bound on any single delay.
    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,

    /// Random spread added on top, as a fraction of the delay (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_max() -> u64 {
    600
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base(),
            max_secs: default_backoff_max(),
            jitter: default_jitter(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval_secs: default_interval(),
            heartbeat_interval_secs: default_heartbeat(),
            ip_services: default_ip_services(),
            ipv6_services: default_ipv6_services(),
            lookup_timeout_secs: default_lookup_timeout(),
            resolve_policy: ResolvePolicy::default(),
            api_key: String::new(),
            api_url: default_api_url(),
            request_timeout_secs: default_request_timeout(),
            state_path: default_state_path(),
            health_port: None,
            max_consecutive_failures: default_max_failures(),
            backoff: BackoffConfig::default(),
            records: Vec::new(),
        }
    }
}

impl Config {
    /// Get the default config file path.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| DdnsError::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("ionos-ddns").join("config.toml"))
    }

    /// Load configuration from a specific path, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.api_key = resolve_env(&config.api_key);
        Ok(config)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply the `IONOS_*` / `*_SECONDS` environment overrides.
    ///
    /// `lookup` is injected so tests don't have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("IONOS_API_KEY").filter(|k| !k.is_empty()) {
            self.api_key = key;
        }

        if let Some(domains) = lookup("IONOS_DOMAINS") {
            let records: Vec<ManagedRecord> = domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(|d| ManagedRecord::new(d, RecordType::A))
                .collect();
            if !records.is_empty() {
                self.records = records;
            }
        }

        if let Some(v) = lookup("UPDATE_INTERVAL_SECONDS") {
            self.check_interval_secs = parse_env("UPDATE_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("HEARTBEAT_INTERVAL_SECONDS") {
            self.heartbeat_interval_secs = parse_env("HEARTBEAT_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("HEALTH_PORT") {
            self.health_port = Some(parse_env("HEALTH_PORT", &v)?);
        }
        if let Some(v) = lookup("IONOS_STATE_PATH") {
            self.state_path = PathBuf::from(v);
        }

        Ok(())
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() || self.api_key.starts_with('$') {
            return Err(DdnsError::Config(
                "IONOS API key is not set (api_key or IONOS_API_KEY)".to_string(),
            ));
        }

        if self.records.is_empty() {
            return Err(DdnsError::Config(
                "No records configured (records or IONOS_DOMAINS)".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for record in &self.records {
            validate_domain_name(&record.domain)?;
            if !seen.insert(record.key()) {
                return Err(DdnsError::Config(format!(
                    "Record {} is configured more than once",
                    record
                )));
            }
            if record.ttl == 0 {
                return Err(DdnsError::Config(format!("Record {} has a zero TTL", record)));
            }
            if record.record_id.is_some() && record.zone_id.is_none() {
                return Err(DdnsError::Config(format!(
                    "Record {} sets record_id without zone_id",
                    record
                )));
            }
            if record.ip_services.as_ref().is_some_and(|s| s.is_empty()) {
                return Err(DdnsError::Config(format!(
                    "Record {} has an empty ip_services override",
                    record
                )));
            }
        }

        if self.check_interval_secs == 0 {
            return Err(DdnsError::Config(
                "check_interval_secs must be greater than zero".to_string(),
            ));
        }

        if self.max_consecutive_failures == 0 {
            return Err(DdnsError::Config(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }

        // Records with their own ip_services don't need the family default.
        let needs = |family: RecordType| {
            self.records
                .iter()
                .any(|r| r.record_type == family && r.ip_services.is_none())
        };
        if (needs(RecordType::A) && self.ip_services.is_empty())
            || (needs(RecordType::Aaaa) && self.ipv6_services.is_empty())
        {
            return Err(DdnsError::Config(
                "At least one address-lookup service is required".to_string(),
            ));
        }

        if self.backoff.base_secs == 0 || self.backoff.base_secs > self.backoff.max_secs {
            return Err(DdnsError::Config(format!(
                "backoff.base_secs ({}) must be between 1 and backoff.max_secs ({})",
                self.backoff.base_secs, self.backoff.max_secs
            )));
        }

        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(DdnsError::Config(format!(
                "backoff.jitter must be between 0.0 and 1.0, got {}",
                self.backoff.jitter
            )));
        }

        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Lookup endpoints for a record: its override, else the family default.
    pub fn services_for(&self, record: &ManagedRecord) -> Vec<String> {
        if let Some(services) = &record.ip_services {
            return services.clone();
        }
        match record.record_type {
            RecordType::A => self.ip_services.clone(),
            RecordType::Aaaa => self.ipv6_services.clone(),
        }
    }

    /// Generate example configuration.
    pub fn example() -> Self {
        let mut v6 = ManagedRecord::new("home.example.com", RecordType::Aaaa);
        v6.ttl = 300;

        Self {
            api_key: "$IONOS_API_KEY".to_string(),
            state_path: PathBuf::from("/var/lib/ionos-ddns/state.json"),
            health_port: Some(8080),
            records: vec![ManagedRecord::new("home.example.com", RecordType::A), v6],
            ..Self::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DdnsError::Config(format!("{} has an invalid value: {}", name, value)))
}

/// Resolve environment variable references (values starting with $).
pub(crate) fn resolve_env(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| {
            tracing::warn!("Environment variable {} not set", var_name);
            value.to_string()
        })
    } else {
        value.to_string()
    }
}

/// Basic RFC 1035 shape check.
fn validate_domain_name(domain: &str) -> Result<()> {
    let invalid = |why: &str| DdnsError::Config(format!("Invalid domain '{}': {}", domain, why));

    if domain.is_empty() {
        return Err(invalid("empty"));
    }
    if domain.len() > 253 {
        return Err(invalid("longer than 253 characters"));
    }

    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid("label must be 1-63 characters"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(invalid("only letters, digits, '-' and '_' are allowed"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label cannot start or end with '-'"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn valid() -> Config {
        Config {
            api_key: "prefix.secret".to_string(),
            records: vec![ManagedRecord::new("example.com", RecordType::A)],
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.check_interval_secs, 300);
        assert_eq!(config.heartbeat_interval_secs, 21600);
        assert_eq!(config.resolve_policy, ResolvePolicy::Shared);
        assert!(!config.ip_services.is_empty());
    }

    #[test]
    fn test_example_config_roundtrips_through_toml() {
        let example = Config::example();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.records, example.records);
        assert_eq!(parsed.health_port, Some(8080));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("IONOS_API_KEY", "abc.def"),
                ("IONOS_DOMAINS", "example.com, sub.example.com,"),
                ("UPDATE_INTERVAL_SECONDS", "60"),
                ("HEALTH_PORT", "9090"),
            ]))
            .unwrap();

        assert_eq!(config.api_key, "abc.def");
        assert_eq!(config.records.len(), 2);
        assert_eq!(config.records[1].domain, "sub.example.com");
        assert_eq!(config.check_interval_secs, 60);
        assert_eq!(config.health_port, Some(9090));
    }

    #[test]
    fn test_env_rejects_bad_number() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("UPDATE_INTERVAL_SECONDS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("UPDATE_INTERVAL_SECONDS"));
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_missing_key() {
        let config = Config {
            api_key: String::new(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_records() {
        let mut config = valid();
        config
            .records
            .push(ManagedRecord::new("EXAMPLE.com", RecordType::A));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_domain() {
        let mut config = valid();
        config.records = vec![ManagedRecord::new("-bad.example.com", RecordType::A)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_backoff_bounds() {
        let mut config = valid();
        config.backoff.base_secs = 700;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.backoff.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_lookup_lists_per_family() {
        let mut config = valid();
        config.records = vec![ManagedRecord::new("example.com", RecordType::Aaaa)];
        config.ip_services.clear();
        assert!(config.validate().is_ok());

        config.ipv6_services.clear();
        assert!(config.validate().is_err());

        config.records[0].ip_services = Some(vec!["https://ip6.example.net".to_string()]);
        assert!(config.validate().is_ok());

        let mut config = valid();
        config.ip_services.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_services_for_override() {
        let config = valid();
        let mut record = ManagedRecord::new("example.com", RecordType::Aaaa);
        assert_eq!(config.services_for(&record), config.ipv6_services);

        record.ip_services = Some(vec!["https://ip.example.net".to_string()]);
        assert_eq!(config.services_for(&record), vec!["https://ip.example.net"]);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.lookup_timeout_secs, 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = valid();
        config.save_to(&path).unwrap();

        let loaded: Config = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.records, config.records);
        assert_eq!(loaded.api_key, "prefix.secret");
    }
}
