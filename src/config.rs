//! Node configuration: TOML file, then environment overrides.
//!
//! Every section and key is optional; missing values take the protocol
//! defaults. Call `validate` after all overrides are applied.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::contracts::{FollowerIdentity, LinkAddress, IDENTITY_LEN};
use crate::errors::{EverlineError, Result};

/// Follower-side settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FollowerConfig {
    /// Name broadcast in every packet (at most 16 bytes)
    pub identity: String,
    pub send_interval_ms: u64,
    /// Input sampling period
    pub poll_interval_ms: u64,
    /// `AA:BB:CC:DD:EE:FF`; a random locally-administered address if absent
    pub link_address: Option<String>,
    /// GPIO value file; the level stays low if absent
    pub input_path: Option<PathBuf>,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            identity: crate::DEFAULT_FOLLOWER_IDENTITY.to_string(),
            send_interval_ms: crate::DEFAULT_SEND_INTERVAL_MS,
            poll_interval_ms: crate::LOOP_DELAY_MS,
            link_address: None,
            input_path: None,
        }
    }
}

impl FollowerConfig {
    pub fn identity(&self) -> Result<FollowerIdentity> {
        FollowerIdentity::new(&self.identity)
    }

    pub fn link_address(&self) -> Result<Option<LinkAddress>> {
        self.link_address.as_deref().map(LinkAddress::from_str).transpose()
    }
}

/// Leader-side settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaderConfig {
    pub summary_interval_ms: u64,
    pub follower_timeout_ms: u64,
    pub eviction_interval_ms: u64,
    pub max_followers: usize,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            summary_interval_ms: crate::DEFAULT_SUMMARY_INTERVAL_MS,
            follower_timeout_ms: crate::DEFAULT_FOLLOWER_TIMEOUT_MS,
            eviction_interval_ms: crate::EVICTION_INTERVAL_MS,
            max_followers: crate::DEFAULT_MAX_FOLLOWERS,
        }
    }
}

/// UDP stand-in for the radio channel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub bind_addr: SocketAddr,
    pub broadcast_addr: SocketAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT)),
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], crate::DEFAULT_PORT)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

/// Complete configuration for either role
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub follower: FollowerConfig,
    pub leader: LeaderConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

impl NodeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EverlineError::Config(e.to_string()))
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| EverlineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Defaults, then `path` if given, then the `EVERLINE_*` environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Override from any key lookup; split out so tests need not touch the
    /// process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EVERLINE_FOLLOWER_IDENTITY") {
            self.follower.identity = v;
        }
        override_parsed(&lookup, "EVERLINE_SEND_INTERVAL_MS", &mut self.follower.send_interval_ms)?;
        override_parsed(&lookup, "EVERLINE_POLL_INTERVAL_MS", &mut self.follower.poll_interval_ms)?;
        if let Some(v) = lookup("EVERLINE_LINK_ADDRESS") {
            self.follower.link_address = Some(v);
        }
        if let Some(v) = lookup("EVERLINE_INPUT_PATH") {
            self.follower.input_path = Some(PathBuf::from(v));
        }

        override_parsed(&lookup, "EVERLINE_SUMMARY_INTERVAL_MS", &mut self.leader.summary_interval_ms)?;
        override_parsed(&lookup, "EVERLINE_FOLLOWER_TIMEOUT_MS", &mut self.leader.follower_timeout_ms)?;
        override_parsed(&lookup, "EVERLINE_EVICTION_INTERVAL_MS", &mut self.leader.eviction_interval_ms)?;
        override_parsed(&lookup, "EVERLINE_MAX_FOLLOWERS", &mut self.leader.max_followers)?;

        override_parsed(&lookup, "EVERLINE_BIND_ADDR", &mut self.network.bind_addr)?;
        override_parsed(&lookup, "EVERLINE_BROADCAST_ADDR", &mut self.network.broadcast_addr)?;

        if let Some(v) = lookup("EVERLINE_LOG_LEVEL") {
            self.logging.level = v;
        }
        override_parsed(&lookup, "EVERLINE_LOG_JSON", &mut self.logging.json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let identity = &self.follower.identity;
        if identity.is_empty() || identity.len() > IDENTITY_LEN {
            return Err(EverlineError::Config(format!(
                "follower.identity must be 1..={} bytes, got {}",
                IDENTITY_LEN,
                identity.len()
            )));
        }
        self.follower.identity()?;
        self.follower.link_address()?;

        for (key, value) in [
            ("follower.send_interval_ms", self.follower.send_interval_ms),
            ("follower.poll_interval_ms", self.follower.poll_interval_ms),
            ("leader.summary_interval_ms", self.leader.summary_interval_ms),
            ("leader.follower_timeout_ms", self.leader.follower_timeout_ms),
            ("leader.eviction_interval_ms", self.leader.eviction_interval_ms),
        ] {
            if value == 0 {
                return Err(EverlineError::Config(format!("{} must be greater than zero", key)));
            }
        }
        if self.leader.max_followers == 0 {
            return Err(EverlineError::Config(
                "leader.max_followers must be greater than zero".to_string(),
            ));
        }

        if self.leader.follower_timeout_ms < self.follower.send_interval_ms.saturating_mul(2) {
            tracing::warn!(
                timeout_ms = self.leader.follower_timeout_ms,
                send_interval_ms = self.follower.send_interval_ms,
                "follower timeout is under two send intervals; one lost packet evicts"
            );
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| EverlineError::Config(format!("{}={:?}: {}", key, raw, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.follower.send_interval_ms, 1_000);
        assert_eq!(config.leader.summary_interval_ms, 5_000);
        assert_eq!(config.leader.follower_timeout_ms, 10_000);
        assert_eq!(config.leader.max_followers, 20);
        assert_eq!(config.network.broadcast_addr.to_string(), "255.255.255.255:4210");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = NodeConfig::from_toml_str(
            r#"
            [follower]
            identity = "FOLLOWER_02"
            link_address = "24:6F:28:01:02:03"

            [leader]
            follower_timeout_ms = 15000
            "#,
        )
        .unwrap();
        assert_eq!(config.follower.identity, "FOLLOWER_02");
        assert_eq!(config.follower.send_interval_ms, 1_000);
        assert_eq!(config.leader.follower_timeout_ms, 15_000);
        assert_eq!(config.leader.summary_interval_ms, 5_000);
        assert_eq!(
            config.follower.link_address().unwrap(),
            Some(LinkAddress([0x24, 0x6F, 0x28, 1, 2, 3]))
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = NodeConfig::from_toml_str("[leader]\ntimeout = 5\n").unwrap_err();
        assert!(matches!(err, EverlineError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nbind_addr = \"127.0.0.1:5000\"").unwrap();
        let config = NodeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 5000);

        assert!(NodeConfig::load_from_file("/nonexistent/everline.toml").is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EVERLINE_FOLLOWER_IDENTITY", "F9"),
            ("EVERLINE_SEND_INTERVAL_MS", "250"),
            ("EVERLINE_MAX_FOLLOWERS", "5"),
            ("EVERLINE_LOG_JSON", "true"),
            ("EVERLINE_BROADCAST_ADDR", "192.168.1.255:4210"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.follower.identity, "F9");
        assert_eq!(config.follower.send_interval_ms, 250);
        assert_eq!(config.leader.max_followers, 5);
        assert!(config.logging.json);
        assert_eq!(config.network.broadcast_addr.to_string(), "192.168.1.255:4210");
    }

    #[test]
    fn test_bad_override_value() {
        let mut config = NodeConfig::default();
        let err = config
            .apply_overrides(|k| (k == "EVERLINE_FOLLOWER_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("EVERLINE_FOLLOWER_TIMEOUT_MS"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = NodeConfig::default();
        config.follower.identity = "THIS_NAME_IS_TOO_LONG".to_string();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.follower.identity = String::new();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.leader.eviction_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.leader.max_followers = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.follower.link_address = Some("not-a-mac".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tight_timeout_only_warns() {
        let mut config = NodeConfig::default();
        config.leader.follower_timeout_ms = 1_500;
        assert!(config.validate().is_ok());
    }
}
