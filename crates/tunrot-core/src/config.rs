//! Configuration resolution for tunrot.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. TOML config file (`/etc/tunrot/tunrot.toml` unless overridden)
//! 3. Environment variables (`TUNROT_*`)
//! 4. CLI arguments (applied by the daemon binary, highest priority)
//!
//! Every interval and threshold is a default, not a constant: operators tune
//! them per host.

use std::fmt::Display;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tunrot/tunrot.toml";

/// Complete tunrot configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub catalog: CatalogConfig,
    pub rotation: RotationConfig,
    pub health: HealthConfig,
    pub blacklist: BlacklistConfig,
    pub tunnel: TunnelConfig,
    pub routing: RoutingConfig,
    pub classifier: ClassifierConfig,
    pub daemon: DaemonConfig,
}

/// Where candidate profiles live and how the next one is picked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory holding one connection profile per candidate.
    pub profile_dir: PathBuf,
    /// File name prefix of a candidate profile (e.g. `mullvad_`).
    pub profile_prefix: String,
    /// File name suffix of a candidate profile (e.g. `_all.conf`).
    pub profile_suffix: String,
    /// Shared credentials file passed to every tunnel.
    pub credentials_file: Option<PathBuf>,
    pub selection: SelectionMode,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            profile_dir: PathBuf::from("/etc/openvpn"),
            profile_prefix: "mullvad_".to_string(),
            profile_suffix: "_all.conf".to_string(),
            credentials_file: None,
            selection: SelectionMode::default(),
        }
    }
}

/// Candidate selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// Cursor over the stable catalog order.
    #[default]
    RoundRobin,
    /// Uniform choice among available candidates.
    Random,
}

/// Periodic rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub interval_secs: u64,
    /// Candidates tried per rotation cycle before reporting exhaustion.
    pub max_attempts_per_cycle: u32,
    pub backoff: BackoffConfig,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30 * 60,
            max_attempts_per_cycle: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RotationConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Retry backoff after a failed rotation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_secs: u64,
    pub max_secs: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: 60,
            max_secs: 30 * 60,
            multiplier: 2.0,
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// Consecutive probe failures before the active candidate is blacklisted.
    pub failure_threshold: u32,
    /// Hard deadline for one probe.
    pub probe_timeout_secs: u64,
    /// What-is-my-IP endpoints, tried in order.
    pub probe_urls: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            failure_threshold: 3,
            probe_timeout_secs: 15,
            probe_urls: vec![
                "https://api.ipify.org".to_string(),
                "https://ifconfig.me/ip".to_string(),
                "https://ipecho.net/plain".to_string(),
            ],
        }
    }
}

impl HealthConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Blacklist durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Applied on verification and health failures.
    pub default_secs: u64,
    /// Applied when the transport fails to launch.
    pub launch_failure_secs: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            default_secs: 24 * 60 * 60,
            launch_failure_secs: 60 * 60,
        }
    }
}

impl BlacklistConfig {
    pub const fn default_duration(&self) -> Duration {
        Duration::from_secs(self.default_secs)
    }

    pub const fn launch_failure_duration(&self) -> Duration {
        Duration::from_secs(self.launch_failure_secs)
    }
}

/// Tunnel transport process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Path to the tunnel transport binary.
    pub binary: PathBuf,
    /// Interface names of the two slots.
    pub interfaces: [String; 2],
    /// Budget for interface-up plus egress probe during verification.
    pub verify_timeout_secs: u64,
    /// Grace window for in-flight flows before the old tunnel is stopped.
    pub drain_grace_secs: u64,
    /// Seconds to wait after SIGTERM before SIGKILL.
    pub terminate_timeout_secs: u64,
    /// Directory for pid files.
    pub run_dir: PathBuf,
    /// Directory for per-interface transport logs.
    pub log_dir: PathBuf,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("openvpn"),
            interfaces: ["tun0".to_string(), "tun1".to_string()],
            verify_timeout_secs: 45,
            drain_grace_secs: 10,
            terminate_timeout_secs: 5,
            run_dir: PathBuf::from("/run/tunrot"),
            log_dir: PathBuf::from("/var/log/tunrot"),
        }
    }
}

impl TunnelConfig {
    pub const fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub const fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Policy routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub ip_bin: PathBuf,
    pub iptables_bin: PathBuf,
    /// Routing table holding the rotated default route.
    pub table_id: u32,
    /// Firewall mark placed on rotated packets.
    pub fwmark: u32,
    /// Mangle chain the classifier rules are installed into.
    pub chain: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ip_bin: PathBuf::from("ip"),
            iptables_bin: PathBuf::from("iptables"),
            table_id: 100,
            fwmark: 100,
            chain: "TUNROT".to_string(),
        }
    }
}

/// Protected-flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Operator session port (SSH).
    pub operator_port: u16,
    /// Administrative panel port, if one is exposed.
    pub admin_port: Option<u16>,
    /// Operator session address. Falls back to `SSH_CONNECTION`/`SSH_CLIENT`.
    pub operator_address: Option<IpAddr>,
    /// Local users whose traffic is always protected.
    pub protected_uids: Vec<u32>,
    /// Local users whose traffic is rotated. Empty rotates every
    /// unprotected packet.
    pub rotated_uids: Vec<u32>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            operator_port: 22,
            admin_port: None,
            operator_address: None,
            protected_uids: Vec::new(),
            rotated_uids: Vec::new(),
        }
    }
}

/// Daemon-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Where the read-only status snapshot is written.
    pub status_path: PathBuf,
    pub log_level: String,
    pub log_json: bool,
    /// The host's own unrotated egress address. Probed at startup when unset.
    pub host_address: Option<IpAddr>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            status_path: PathBuf::from("/run/tunrot/status.json"),
            log_level: "info".to_string(),
            log_json: false,
            host_address: None,
        }
    }
}

impl Config {
    /// Reject settings the control loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rotation.interval_secs == 0 {
            return Err(Error::Config("rotation.interval_secs must be > 0".into()));
        }
        if self.rotation.max_attempts_per_cycle == 0 {
            return Err(Error::Config(
                "rotation.max_attempts_per_cycle must be > 0".into(),
            ));
        }
        if self.rotation.backoff.initial_secs == 0 || self.rotation.backoff.multiplier < 1.0 {
            return Err(Error::Config(
                "rotation.backoff needs initial_secs > 0 and multiplier >= 1".into(),
            ));
        }
        if self.health.interval_secs == 0 || self.health.probe_timeout_secs == 0 {
            return Err(Error::Config(
                "health.interval_secs and health.probe_timeout_secs must be > 0".into(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(Error::Config("health.failure_threshold must be > 0".into()));
        }
        if self.health.probe_urls.is_empty() {
            return Err(Error::Config("health.probe_urls must not be empty".into()));
        }
        if self.blacklist.default_secs == 0 || self.blacklist.launch_failure_secs == 0 {
            return Err(Error::Config("blacklist durations must be > 0".into()));
        }
        let [a, b] = &self.tunnel.interfaces;
        if a.is_empty() || b.is_empty() || a == b {
            return Err(Error::Config(
                "tunnel.interfaces must name two distinct interfaces".into(),
            ));
        }
        if self.routing.chain.is_empty() {
            return Err(Error::Config("routing.chain must not be empty".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicitly named file must exist; the default path is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_config_file(default)?
            } else {
                debug!("No config file at default path, using built-in defaults");
                Config::default()
            }
        }
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config: Config = toml::from_str(&content)?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(val) = var("TUNROT_PROFILE_DIR") {
        config.catalog.profile_dir = PathBuf::from(val);
    }
    if let Some(n) = parse_env(&var, "TUNROT_ROTATION_INTERVAL_SECS")? {
        config.rotation.interval_secs = n;
    }
    if let Some(n) = parse_env(&var, "TUNROT_HEALTH_INTERVAL_SECS")? {
        config.health.interval_secs = n;
    }
    if let Some(n) = parse_env(&var, "TUNROT_FAILURE_THRESHOLD")? {
        config.health.failure_threshold = n;
    }
    if let Some(port) = parse_env(&var, "TUNROT_ADMIN_PORT")? {
        config.classifier.admin_port = Some(port);
    }
    if let Some(addr) = parse_env(&var, "TUNROT_OPERATOR_ADDRESS")? {
        config.classifier.operator_address = Some(addr);
    }
    if let Some(val) = var("TUNROT_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    Ok(())
}

fn parse_env<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{key}={raw:?} is invalid: {e}")))
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_intervals() {
        let config = Config::default();
        assert_eq!(config.rotation.interval(), Duration::from_secs(1800));
        assert_eq!(config.health.interval(), Duration::from_secs(300));
        assert_eq!(config.blacklist.default_duration(), Duration::from_secs(86_400));
        assert_eq!(config.blacklist.launch_failure_duration(), Duration::from_secs(3600));
        assert_eq!(config.health.failure_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [rotation]
            interval_secs = 600

            [classifier]
            admin_port = 8443
            operator_address = "203.0.113.7"
            "#,
        )
        .unwrap();
        assert_eq!(config.rotation.interval_secs, 600);
        assert_eq!(config.rotation.max_attempts_per_cycle, 3);
        assert_eq!(config.classifier.admin_port, Some(8443));
        assert_eq!(config.classifier.operator_port, 22);
        assert_eq!(
            config.classifier.operator_address,
            Some("203.0.113.7".parse().unwrap())
        );
        assert_eq!(config.rotation.backoff.multiplier, 2.0);
    }

    #[test]
    fn selection_mode_parses_kebab_case() {
        let config: Config = toml::from_str("[catalog]\nselection = \"random\"\n").unwrap();
        assert_eq!(config.catalog.selection, SelectionMode::Random);
        let config: Config = toml::from_str("[catalog]\nselection = \"round-robin\"\n").unwrap();
        assert_eq!(config.catalog.selection, SelectionMode::RoundRobin);
    }

    #[test]
    fn validate_rejects_identical_interfaces() {
        let mut config = Config::default();
        config.tunnel.interfaces = ["tun0".to_string(), "tun0".to_string()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_blacklist_duration() {
        let mut config = Config::default();
        config.blacklist.launch_failure_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_threshold() {
        let mut config = Config::default();
        config.health.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("TUNROT_ROTATION_INTERVAL_SECS", "900"),
            ("TUNROT_FAILURE_THRESHOLD", "2"),
            ("TUNROT_ADMIN_PORT", "8443"),
            ("TUNROT_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.rotation.interval_secs, 900);
        assert_eq!(config.health.failure_threshold, 2);
        assert_eq!(config.classifier.admin_port, Some(8443));
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn invalid_env_override_is_rejected() {
        let mut config = Config::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == "TUNROT_ADMIN_PORT").then(|| "not-a-port".to_string())
        })
        .unwrap_err();
        assert!(matches!(&err, Error::Config(msg) if msg.contains("TUNROT_ADMIN_PORT")));
        assert_eq!(config.classifier.admin_port, None);
    }

    #[test]
    fn rotated_uids_parse_from_toml() {
        let config: Config = toml::from_str("[classifier]\nrotated_uids = [1001]\n").unwrap();
        assert_eq!(config.classifier.rotated_uids, vec![1001]);
        assert!(config.classifier.protected_uids.is_empty());
    }

    #[test]
    fn load_config_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunrot.toml");
        std::fs::write(&path, "[health]\nfailure_threshold = 2\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.health.failure_threshold, 2);
    }

    #[test]
    fn load_config_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
