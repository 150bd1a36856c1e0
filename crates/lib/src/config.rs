use std::str::FromStr;

use configparser::ini::Ini;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmpRole {
    #[default]
    Leader,
    Follower,
}

impl FromStr for SmpRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" => Ok(SmpRole::Leader),
            "follower" => Ok(SmpRole::Follower),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Instance id stamped into guids and datelines.
    pub instance_id: u32,
    /// Per-request wall-clock deadline, milliseconds.
    pub deadline_ms: u64,
    pub smp_role: SmpRole,
    /// Leader address a follower connects to.
    pub smp_peer: Option<String>,
    /// How long the leader waits for a straggling follower to pause.
    pub smp_pause_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            instance_id: 1,
            deadline_ms: 10_000,
            smp_role: SmpRole::Leader,
            smp_peer: None,
            smp_pause_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unparseable config: {0}")]
    Malformed(String),
    #[error("[{section}] {key}: bad value `{value}`")]
    BadValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },
}

impl ServerConfig {
    /// INI layout:
    /// ```ini
    /// [server]
    /// instance = 7f
    /// deadline-ms = 5000
    /// [smp]
    /// role = follower
    /// peer = 127.0.0.1:8100
    /// pause-timeout-ms = 1000
    /// ```
    /// Unknown keys warn and are ignored; malformed values error.
    pub fn from_ini(text: &str) -> Result<ServerConfig, ConfigError> {
        let mut ini = Ini::new();
        let parsed = ini.read(text.to_string()).map_err(ConfigError::Malformed)?;
        let mut config = ServerConfig::default();

        for (section, keys) in &parsed {
            for (key, value) in keys {
                let value = value.clone().unwrap_or_default();
                let bad = |section, key| ConfigError::BadValue {
                    section,
                    key,
                    value: value.clone(),
                };
                match (section.as_str(), key.as_str()) {
                    ("server", "instance") => {
                        config.instance_id = u32::from_str_radix(&value, 16)
                            .map_err(|_| bad("server", "instance"))?;
                    }
                    ("server", "deadline-ms") => {
                        config.deadline_ms =
                            value.parse().map_err(|_| bad("server", "deadline-ms"))?;
                    }
                    ("smp", "role") => {
                        config.smp_role = value.parse().map_err(|_| bad("smp", "role"))?;
                    }
                    ("smp", "peer") => config.smp_peer = Some(value),
                    ("smp", "pause-timeout-ms") => {
                        config.smp_pause_timeout_ms =
                            value.parse().map_err(|_| bad("smp", "pause-timeout-ms"))?;
                    }
                    (section, key) => {
                        log::warn!("ignoring unknown config key [{section}] {key}");
                    }
                }
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let config = ServerConfig::from_ini("").unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn full_parse() {
        let config = ServerConfig::from_ini(
            "[server]\ninstance = 7f\ndeadline-ms = 5000\n\
             [smp]\nrole = follower\npeer = 127.0.0.1:8100\npause-timeout-ms = 1000\n",
        )
        .unwrap();
        assert_eq!(config.instance_id, 0x7f);
        assert_eq!(config.deadline_ms, 5000);
        assert_eq!(config.smp_role, SmpRole::Follower);
        assert_eq!(config.smp_peer.as_deref(), Some("127.0.0.1:8100"));
        assert_eq!(config.smp_pause_timeout_ms, 1000);
    }

    #[test]
    fn bad_values_error_unknown_keys_do_not() {
        assert!(ServerConfig::from_ini("[smp]\nrole = bystander\n").is_err());
        assert!(ServerConfig::from_ini("[server]\ninstance = zz\n").is_err());
        assert!(ServerConfig::from_ini("[server]\ncolor = mauve\n").is_ok());
    }
}
