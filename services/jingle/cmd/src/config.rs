//! Configuration handling for the node binary.
//!
//! Values come from the shared YAML config file (`services.jingle` section)
//! and are then overridden by `JINGLE_*` environment variables.

use anyhow::{bail, Context, Result};
use jingle_session::{Cipher, SessionConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Node configuration for the loopback demo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// JID of the initiating endpoint
    pub initiator: String,
    /// JID of the responding endpoint
    pub responder: String,
    /// JID of the in-process relay
    pub relay: String,
    /// Offer relay candidates from the initiator
    pub use_relay: bool,
    /// Announce no direct candidates at all
    pub relay_only: bool,
    /// Wrap the stream in the encrypted transport
    pub encrypt: bool,
    /// Cipher name: `aes-256-gcm` or `chacha20-poly1305`
    pub cipher: String,
    /// Hex-encoded 32-byte pre-shared secret; random when empty
    pub psk: String,
    /// Payload size transferred by the demo
    pub transfer_bytes: usize,
    /// Address announced for direct candidates
    pub local_address: IpAddr,
    /// Response timeout (seconds)
    pub response_timeout: u64,
    /// Candidate connect budget (seconds)
    pub connect_budget: u64,
    /// Keepalive ping interval (seconds, 0 disables)
    pub ping_interval: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            initiator: "alice@example.org/node".to_string(),
            responder: "bob@example.org/node".to_string(),
            relay: "proxy.example.org".to_string(),
            use_relay: false,
            relay_only: false,
            encrypt: false,
            cipher: "aes-256-gcm".to_string(),
            psk: String::new(),
            transfer_bytes: 1024 * 1024,
            local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            response_timeout: 10,
            connect_budget: 10,
            ping_interval: 0,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    jingle: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        info!(
            "Node configuration: initiator={}, responder={}, relay_only={}, encrypt={}, bytes={}",
            config.initiator, config.responder, config.relay_only, config.encrypt, config.transfer_bytes
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        let Some(service) = root.services.and_then(|services| services.jingle) else {
            return;
        };

        for arg in service.args.unwrap_or_default() {
            if let Some((key, value)) = arg.strip_prefix("--").and_then(|arg| arg.split_once('=')) {
                self.set(key, value);
            } else if let Some(flag) = arg.strip_prefix("--") {
                self.set(flag, "true");
            }
        }

        for (key, value) in service.config.unwrap_or_default() {
            let applied = key
                .strip_prefix("services.jingle.")
                .map(|field| self.set(field, &value))
                .unwrap_or(false);
            if !applied {
                warn!("Ignoring configuration key {}={}", key, value);
            }
        }
    }

    /// Apply `JINGLE_*` overrides from `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        const FIELDS: &[&str] = &[
            "initiator",
            "responder",
            "relay",
            "use_relay",
            "relay_only",
            "encrypt",
            "cipher",
            "psk",
            "transfer_bytes",
            "local_address",
            "response_timeout",
            "connect_budget",
            "ping_interval",
        ];

        for field in FIELDS {
            let name = format!("JINGLE_{}", field.to_uppercase());
            if let Some(value) = lookup(&name) {
                if self.set(field, &value) {
                    info!("{} overridden by environment", field);
                }
            }
        }
    }

    /// Set one field from its textual form; false when the key or value is not understood
    fn set(&mut self, key: &str, value: &str) -> bool {
        let flag = || value.eq_ignore_ascii_case("true") || value == "1";
        match key.replace('-', "_").as_str() {
            "initiator" => self.initiator = value.to_string(),
            "responder" => self.responder = value.to_string(),
            "relay" => self.relay = value.to_string(),
            "use_relay" => self.use_relay = flag(),
            "relay_only" => self.relay_only = flag(),
            "encrypt" => self.encrypt = flag(),
            "cipher" => self.cipher = value.to_string(),
            "psk" => self.psk = value.to_string(),
            "transfer_bytes" => match value.parse() {
                Ok(bytes) => self.transfer_bytes = bytes,
                Err(_) => return false,
            },
            "local_address" => match value.parse() {
                Ok(address) => self.local_address = address,
                Err(_) => return false,
            },
            "response_timeout" => match value.parse() {
                Ok(secs) => self.response_timeout = secs,
                Err(_) => return false,
            },
            "connect_budget" => match value.parse() {
                Ok(secs) => self.connect_budget = secs,
                Err(_) => return false,
            },
            "ping_interval" => match value.parse() {
                Ok(secs) => self.ping_interval = secs,
                Err(_) => return false,
            },
            _ => return false,
        }
        true
    }

    /// Reject values the demo cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.initiator == self.responder {
            bail!("initiator and responder must differ");
        }
        if self.transfer_bytes == 0 {
            bail!("transfer_bytes must be positive");
        }
        self.cipher()?;
        if !self.psk.is_empty() {
            self.psk_secret()?;
        }
        Ok(())
    }

    /// Configured cipher
    pub fn cipher(&self) -> Result<Cipher> {
        match self.cipher.to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes" => Ok(Cipher::Aes256Gcm),
            "chacha20-poly1305" | "chacha" => Ok(Cipher::ChaCha20Poly1305),
            other => bail!("unknown cipher {}", other),
        }
    }

    /// Pre-shared secret, generated when none is configured
    pub fn psk_secret(&self) -> Result<[u8; 32]> {
        if self.psk.is_empty() {
            return Ok(rand::random());
        }
        let raw = hex::decode(&self.psk).context("psk is not valid hex")?;
        raw.try_into()
            .map_err(|raw: Vec<u8>| anyhow::anyhow!("psk must be 32 bytes, got {}", raw.len()))
    }

    /// Engine configuration for one endpoint
    pub fn to_session_config(&self, relays: bool) -> SessionConfig {
        let local_addresses = if self.relay_only {
            Vec::new()
        } else {
            vec![self.local_address]
        };
        SessionConfig {
            response_timeout: Duration::from_secs(self.response_timeout),
            connect_budget: Duration::from_secs(self.connect_budget),
            stream_host_bind: SocketAddr::new(self.local_address, 0),
            local_addresses,
            use_relays: relays,
            ping_interval: (self.ping_interval > 0).then(|| Duration::from_secs(self.ping_interval)),
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.initiator, "alice@example.org/node");
        assert!(!config.relay_only);
        assert_eq!(config.cipher().unwrap(), Cipher::Aes256Gcm);
        assert!(config.validate().is_ok());

        let session = config.to_session_config(false);
        assert_eq!(session.local_addresses, vec![config.local_address]);
        assert!(!session.use_relays);
        assert!(session.ping_interval.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  jingle:
    enabled: true
    executable: ./jingle-node
    args:
      - --relay-only
      - --transfer-bytes=4096
    config:
      services.jingle.responder: "carol@example.org/desk"
      services.jingle.encrypt: "true"
      services.jingle.cipher: "chacha20-poly1305"
      services.jingle.ping_interval: "5"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

        assert!(config.relay_only);
        assert_eq!(config.transfer_bytes, 4096);
        assert_eq!(config.responder, "carol@example.org/desk");
        assert!(config.encrypt);
        assert_eq!(config.cipher().unwrap(), Cipher::ChaCha20Poly1305);

        let session = config.to_session_config(true);
        assert!(session.local_addresses.is_empty());
        assert!(session.use_relays);
        assert_eq!(session.ping_interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("JINGLE_INITIATOR", "dave@example.org/laptop"),
            ("JINGLE_TRANSFER_BYTES", "not-a-number"),
            ("JINGLE_USE_RELAY", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|name| env.get(name).map(|value| value.to_string()));

        assert_eq!(config.initiator, "dave@example.org/laptop");
        assert_eq!(config.transfer_bytes, 1024 * 1024);
        assert!(config.use_relay);
    }

    #[test]
    fn test_psk_secret() {
        let mut config = NodeConfig {
            psk: "07".repeat(32),
            ..Default::default()
        };
        assert_eq!(config.psk_secret().unwrap(), [7u8; 32]);

        config.psk = "0707".to_string();
        assert!(config.psk_secret().is_err());
        assert!(config.validate().is_err());

        config.psk = "zz".repeat(32);
        assert!(config.psk_secret().is_err());
    }
}
