// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::apply::{APPLY_TIMEOUT, ApplyMethod};
use crate::provision::{BootstrapAdmin, BootstrapServer};
use crate::render::ClientDefaults;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wiregate/wiregate.toml";

#[derive(Debug, Parser)]
#[command(name = "wiregate-api", version = env!("GIT_VERSION"), about = "WireGuard provisioning API")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("WG_KEY_SECRET must be exactly 64 hex characters (32 bytes)")]
    InvalidKeySecret,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub auth: AuthConfig,
    pub wireguard: WireguardConfig,
    pub defaults: ClientDefaults,
    pub public_ip: PublicIpConfig,
    pub admin: Option<BootstrapAdmin>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            database_url: String::new(),
            auth: AuthConfig::default(),
            wireguard: WireguardConfig::default(),
            defaults: ClientDefaults::default(),
            public_ip: PublicIpConfig::default(),
            admin: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_hours: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    pub config_path: PathBuf,
    pub interface: Option<String>,
    pub apply_method: ApplyMethod,
    pub apply_timeout_secs: u64,
    pub user_dir: PathBuf,
    pub key_secret: String,
    pub bootstrap: BootstrapServer,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            config_path: "/etc/wireguard/wg0.conf".into(),
            interface: None,
            apply_method: ApplyMethod::default(),
            apply_timeout_secs: APPLY_TIMEOUT.as_secs(),
            user_dir: "/var/lib/wiregate/users".into(),
            key_secret: String::new(),
            bootstrap: BootstrapServer::default(),
        }
    }
}

impl WireguardConfig {
    /// The configured interface, else the config file's stem (`wg0`).
    pub fn interface(&self) -> String {
        self.interface.clone().unwrap_or_else(|| {
            self.config_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("wg0")
                .to_string()
        })
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs.max(1))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PublicIpConfig {
    pub address: String,
    pub detect: bool,
    pub detect_url: String,
}

impl Default for PublicIpConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            detect: false,
            detect_url: "https://api.ipify.org".into(),
        }
    }
}

fn parse_hex_32(hex: &str) -> Result<[u8; 32], ConfigError> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.is_ascii() {
        return Err(ConfigError::InvalidKeySecret);
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte =
            u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| ConfigError::InvalidKeySecret)?;
    }
    Ok(out)
}

impl Config {
    /// Reads `path` (a missing file means all defaults) and applies
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                String::new()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_parts(&text, |var| env::var(var).ok())
    }

    pub fn from_parts(text: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;

        if let Some(url) = env("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(bind) = env("BIND_ADDR") {
            config.bind_addr = bind;
        }
        if let Some(secret) = env("JWT_SECRET") {
            config.auth.jwt_secret = secret;
        }
        if let Some(secret) = env("WG_KEY_SECRET") {
            config.wireguard.key_secret = secret;
        }

        if config.database_url.trim().is_empty() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if config.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::Missing("JWT_SECRET"));
        }
        if config.wireguard.key_secret.trim().is_empty() {
            return Err(ConfigError::Missing("WG_KEY_SECRET"));
        }
        parse_hex_32(&config.wireguard.key_secret)?;
        Ok(config)
    }

    pub fn key_secret(&self) -> Result<[u8; 32], ConfigError> {
        parse_hex_32(&self.wireguard.key_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    fn secrets() -> impl Fn(&str) -> Option<String> {
        env_of(&[
            ("DATABASE_URL", "postgres://localhost/wiregate"),
            ("JWT_SECRET", "jwt"),
            ("WG_KEY_SECRET", KEY),
        ])
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_parts("", secrets()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.auth.token_ttl_hours, 24);
        assert_eq!(config.wireguard.interface(), "wg0");
        assert_eq!(config.wireguard.apply_method, ApplyMethod::WgQuick);
        assert_eq!(config.wireguard.bootstrap.listen_port, 51820);
        assert!(config.admin.is_none());
        assert_eq!(config.key_secret().unwrap()[31], 0x1f);
    }

    #[test]
    fn file_sections_are_read() {
        let text = r#"
            bind_addr = "0.0.0.0:9000"

            [wireguard]
            config_path = "/etc/wireguard/office.conf"
            apply_method = "service"

            [wireguard.bootstrap]
            address = "10.8.0.1/24"
            listen_port = 51821

            [defaults]
            dns = "1.1.1.1"

            [admin]
            username = "root"
            email = "root@example.com"
            password = "changeme123"
        "#;
        let config = Config::from_parts(text, secrets()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.wireguard.interface(), "office");
        assert_eq!(config.wireguard.apply_method, ApplyMethod::Service);
        assert_eq!(config.wireguard.bootstrap.address, "10.8.0.1/24");
        assert_eq!(config.wireguard.bootstrap.listen_port, 51821);
        assert_eq!(config.defaults.dns, "1.1.1.1");
        assert_eq!(config.admin.unwrap().username, "root");
    }

    #[test]
    fn environment_overrides_file() {
        let text = "bind_addr = \"0.0.0.0:9000\"\n";
        let env = env_of(&[
            ("DATABASE_URL", "postgres://db/x"),
            ("JWT_SECRET", "jwt"),
            ("WG_KEY_SECRET", KEY),
            ("BIND_ADDR", "127.0.0.1:1"),
        ]);
        let config = Config::from_parts(text, env).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:1");
        assert_eq!(config.database_url, "postgres://db/x");
    }

    #[test]
    fn secrets_are_required() {
        let err = Config::from_parts("", env_of(&[("DATABASE_URL", "x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("JWT_SECRET")));

        let env = env_of(&[("DATABASE_URL", "x"), ("JWT_SECRET", "y"), ("WG_KEY_SECRET", "abcd")]);
        assert!(matches!(Config::from_parts("", env), Err(ConfigError::InvalidKeySecret)));
    }
}
