// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - Compiled defaults (per-domain values from the switch deployment)
// - Optional TOML file
// - SONIC_EXPORTER_* environment overrides (`__` separates sections)
// - Flat legacy variables (VLAN_ENABLED, FDB_MAX_ENTRIES, ...) applied last
// ============================================================================

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, ConfigResult};
use crate::store::StoreAddress;
use crate::{
    DEFAULT_FRESHNESS_SECS, DEFAULT_LISTEN_ADDRESS, DEFAULT_METRICS_PATH, DEFAULT_SCAN_COUNT,
    DEFAULT_STORE_ADDRESS, DEFAULT_TIMEOUT_SECS, ENV_PREFIX,
};

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default = "default_vlan")]
    pub vlan: DomainConfig,

    #[serde(default = "default_lag")]
    pub lag: DomainConfig,

    #[serde(default)]
    pub fdb: FdbConfig,

    #[serde(default)]
    pub lldp: LldpConfig,

    #[serde(default)]
    pub docker: DockerConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            vlan: default_vlan(),
            lag: default_lag(),
            fdb: FdbConfig::default(),
            lldp: LldpConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl ExporterConfig {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Self::figment().merge(Toml::file(path)))
    }

    /// Defaults plus environment only, for running without a file.
    pub fn from_env() -> ConfigResult<Self> {
        Self::extract(Self::figment())
    }

    /// Load from a TOML string (no environment)
    pub fn from_toml_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = Self::figment()
            .merge(Toml::string(toml_str))
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn extract(figment: Figment) -> ConfigResult<Self> {
        let mut config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;
        config.apply_legacy_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.server
            .listen_address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid_value("server.listen_address", e.to_string()))?;

        if !self.server.metrics_path.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "server.metrics_path",
                "must start with '/'",
            ));
        }

        if self.store.fixtures.is_none() {
            StoreAddress::parse(&self.store.address)?;
        }

        self.vlan.validate("vlan")?;
        self.lag.validate("lag")?;
        self.fdb.domain.validate("fdb")?;
        self.lldp.domain.validate("lldp")?;
        self.docker.domain.validate("docker")?;

        require_positive("fdb.max_ports", self.fdb.max_ports)?;
        require_positive("fdb.max_vlans", self.fdb.max_vlans)?;
        if self.docker.source_stale_threshold.is_zero() {
            return Err(ConfigError::invalid_value(
                "docker.source_stale_threshold",
                "must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Render the defaults as a TOML document
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Names of enabled domains, in registration order
    pub fn enabled_domains(&self) -> Vec<&'static str> {
        [
            ("vlan", self.vlan.enabled),
            ("lag", self.lag.enabled),
            ("fdb", self.fdb.domain.enabled),
            ("lldp", self.lldp.domain.enabled),
            ("docker", self.docker.domain.enabled),
        ]
        .into_iter()
        .filter(|(_, enabled)| *enabled)
        .map(|(name, _)| name)
        .collect()
    }

    /// Overlay the flat variable names used by existing switch deployments.
    pub fn apply_legacy_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        env.bool("VLAN_ENABLED", &mut self.vlan.enabled);
        env.duration("VLAN_REFRESH_INTERVAL", &mut self.vlan.refresh_interval);
        env.duration("VLAN_TIMEOUT", &mut self.vlan.timeout);
        env.positive("VLAN_MAX_VLANS", &mut self.vlan.max_entities);
        env.positive("VLAN_MAX_MEMBERS", &mut self.vlan.max_children);

        env.bool("LAG_ENABLED", &mut self.lag.enabled);
        env.duration("LAG_REFRESH_INTERVAL", &mut self.lag.refresh_interval);
        env.duration("LAG_TIMEOUT", &mut self.lag.timeout);
        env.positive("LAG_MAX_LAGS", &mut self.lag.max_entities);
        env.positive("LAG_MAX_MEMBERS", &mut self.lag.max_children);

        env.bool("FDB_ENABLED", &mut self.fdb.domain.enabled);
        env.duration("FDB_REFRESH_INTERVAL", &mut self.fdb.domain.refresh_interval);
        env.duration("FDB_TIMEOUT", &mut self.fdb.domain.timeout);
        env.positive("FDB_MAX_ENTRIES", &mut self.fdb.domain.max_entities);
        env.positive("FDB_MAX_PORTS", &mut self.fdb.max_ports);
        env.positive("FDB_MAX_VLANS", &mut self.fdb.max_vlans);

        env.bool("LLDP_ENABLED", &mut self.lldp.domain.enabled);
        env.bool("LLDP_INCLUDE_MGMT", &mut self.lldp.include_mgmt);
        env.duration("LLDP_REFRESH_INTERVAL", &mut self.lldp.domain.refresh_interval);
        env.duration("LLDP_TIMEOUT", &mut self.lldp.domain.timeout);
        env.positive("LLDP_MAX_NEIGHBORS", &mut self.lldp.domain.max_entities);

        env.bool("DOCKER_ENABLED", &mut self.docker.domain.enabled);
        env.duration("DOCKER_REFRESH_INTERVAL", &mut self.docker.domain.refresh_interval);
        env.duration("DOCKER_TIMEOUT", &mut self.docker.domain.timeout);
        env.positive("DOCKER_MAX_CONTAINERS", &mut self.docker.domain.max_entities);
        env.duration("DOCKER_SOURCE_STALE_THRESHOLD", &mut self.docker.source_stale_threshold);

        env.string("REDIS_ADDRESS", &mut self.store.address);
    }
}

// ----------------------------------------------------------------------------
// 5.2 Per-Domain Configuration
// ----------------------------------------------------------------------------

/// How a domain's snapshot is kept fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Background task on a fixed period
    #[default]
    Interval,
    /// Refresh during collect once the snapshot is older than `freshness`
    OnDemand,
}

/// Settings shared by every domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub enabled: bool,

    pub refresh_mode: RefreshMode,

    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Staleness threshold for on-demand refresh
    #[serde(with = "humantime_serde")]
    pub freshness: Duration,

    /// Deadline for one refresh cycle
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Cap on emitted top-level entities (raw entries for FDB)
    pub max_entities: usize,

    /// Cap on emitted children per entity
    pub max_children: usize,

    /// SCAN batch size
    pub scan_count: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_mode: RefreshMode::Interval,
            refresh_interval: Duration::from_secs(30),
            freshness: Duration::from_secs(DEFAULT_FRESHNESS_SECS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_entities: 1024,
            max_children: 8192,
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }
}

impl DomainConfig {
    pub fn with_caps(mut self, max_entities: usize, max_children: usize) -> Self {
        self.max_entities = max_entities;
        self.max_children = max_children;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_mode(mut self, mode: RefreshMode) -> Self {
        self.refresh_mode = mode;
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn validate(&self, section: &str) -> ConfigResult<()> {
        for (field, value) in [
            ("refresh_interval", self.refresh_interval),
            ("freshness", self.freshness),
            ("timeout", self.timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid_value(
                    format!("{}.{}", section, field),
                    "must be greater than zero",
                ));
            }
        }
        require_positive(&format!("{}.max_entities", section), self.max_entities)?;
        require_positive(&format!("{}.max_children", section), self.max_children)?;
        require_positive(&format!("{}.scan_count", section), self.scan_count)?;
        Ok(())
    }
}

fn require_positive(field: &str, value: usize) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::invalid_value(field, "must be greater than zero"));
    }
    Ok(())
}

fn default_vlan() -> DomainConfig {
    DomainConfig::default().with_caps(1024, 8192)
}

fn default_lag() -> DomainConfig {
    DomainConfig::default().with_caps(512, 4096)
}

/// Forwarding-table domain: `max_entities` is the raw entry ceiling, the
/// series caps bound the per-port and per-VLAN aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FdbConfig {
    #[serde(flatten)]
    pub domain: DomainConfig,
    pub max_ports: usize,
    pub max_vlans: usize,
}

impl Default for FdbConfig {
    fn default() -> Self {
        Self {
            domain: DomainConfig::default()
                .with_enabled(false)
                .with_interval(Duration::from_secs(60))
                .with_caps(50_000, 1),
            max_ports: 1024,
            max_vlans: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LldpConfig {
    #[serde(flatten)]
    pub domain: DomainConfig,
    /// Export the management interface (eth0) neighbour
    pub include_mgmt: bool,
}

impl Default for LldpConfig {
    fn default() -> Self {
        Self {
            domain: DomainConfig::default().with_caps(512, 1),
            include_mgmt: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    #[serde(flatten)]
    pub domain: DomainConfig,
    /// Age after which container stats are flagged stale
    #[serde(with = "humantime_serde")]
    pub source_stale_threshold: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            domain: DomainConfig::default()
                .with_enabled(false)
                .with_interval(Duration::from_secs(60))
                .with_caps(128, 1),
            source_stale_threshold: Duration::from_secs(300),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.3 Server, Store & Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub metrics_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.into(),
            metrics_path: DEFAULT_METRICS_PATH.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `unix:///path` or `host:port`
    pub address: String,
    /// Serve from JSON database dumps in this directory instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixtures: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_STORE_ADDRESS.into(),
            fixtures: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Output format (json, pretty, compact)
    pub format: String,

    /// Enable ANSI colors
    pub colors: bool,

    /// Include source location
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "compact".into(),
            colors: true,
            source_location: false,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.4 Flat Environment Helpers
// ----------------------------------------------------------------------------

/// Parse a boolean the way switch tooling writes them.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Reads single variables through `lookup`, keeping the current value and
/// logging a warning when the variable is present but unusable.
struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<'a, F: Fn(&str) -> Option<String>> EnvReader<'a, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn bool(&self, key: &str, target: &mut bool) {
        *target = parse_bool_env_with(self.lookup, key, *target);
    }

    fn duration(&self, key: &str, target: &mut Duration) {
        *target = parse_duration_env_with(self.lookup, key, *target);
    }

    fn positive(&self, key: &str, target: &mut usize) {
        *target = parse_positive_int_env_with(self.lookup, key, *target);
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.raw(key) {
            *target = value;
        }
    }
}

pub fn parse_bool_env_with<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: bool) -> bool {
    let Some(value) = lookup(key).filter(|v| !v.is_empty()) else {
        return default;
    };
    match parse_bool(&value) {
        Some(parsed) => parsed,
        None => {
            warn!(target: "sonic::config", key, value = %value, default, "Invalid boolean value in env, using default");
            default
        }
    }
}

pub fn parse_duration_env_with<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: Duration) -> Duration {
    let Some(value) = lookup(key).filter(|v| !v.is_empty()) else {
        return default;
    };
    match humantime::parse_duration(&value) {
        Ok(parsed) if !parsed.is_zero() => parsed,
        Ok(_) => {
            warn!(target: "sonic::config", key, value = %value, default = ?default, "Duration env must be greater than zero, using default");
            default
        }
        Err(e) => {
            warn!(target: "sonic::config", key, value = %value, error = %e, default = ?default, "Invalid duration value in env, using default");
            default
        }
    }
}

pub fn parse_positive_int_env_with<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: usize) -> usize {
    let Some(value) = lookup(key).filter(|v| !v.is_empty()) else {
        return default;
    };
    match value.trim().parse::<i64>() {
        Ok(parsed) if parsed > 0 => parsed as usize,
        Ok(_) => {
            warn!(target: "sonic::config", key, value = %value, default, "Integer env must be greater than zero, using default");
            default
        }
        Err(_) => {
            warn!(target: "sonic::config", key, value = %value, default, "Invalid integer value in env, using default");
            default
        }
    }
}

pub fn parse_string_env_with<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: &str) -> String {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
