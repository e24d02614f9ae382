//! Tunnel configuration
//!
//! Agent and server must agree on the key, the tunnel domain and the chunk
//! size; everything here is read once at startup and validated before any
//! socket is opened.

use crate::cipher::{KEY_LEN, PACKET_OVERHEAD};
use crate::codec::{MAX_LABEL_LEN, MAX_QNAME_LEN, SEQ_LABEL_MAX_LEN};
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Longest domain that still leaves room for payload labels in a QNAME.
pub const MAX_DOMAIN_LEN: usize = 190;

/// Ceiling on the number of chunks in one message: the cumulative ACK is
/// carried in two IPv4 octets, so sequence numbers above this cannot be
/// acknowledged.
pub const MAX_CHUNKS: usize = u16::MAX as usize;

fn default_chunk_size() -> usize {
    30
}

fn default_server_addr() -> SocketAddr {
    "127.0.0.1:5354".parse().expect("default address is valid")
}

fn default_timeout_secs() -> u64 {
    4
}

fn default_max_retries() -> u32 {
    5
}

/// Main tunnel configuration, shared between agent and server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Pre-shared 256-bit key, hex encoded (64 characters).
    pub key: String,

    /// Base domain the tunnel hides under, e.g. "tunnel.example.com".
    pub domain: String,

    /// Plaintext bytes per chunk. Bounded so that one Base32-encoded packet
    /// plus the sequence label and the domain fits in a single QNAME.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Address the server listens on and the agent queries.
    #[serde(default = "default_server_addr")]
    pub server_addr: SocketAddr,

    /// Per-query timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retransmission cap per chunk (and reset handshake attempts).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            domain: "tunnel.example.com".to_string(),
            chunk_size: default_chunk_size(),
            server_addr: default_server_addr(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| TunnelError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a TOML file.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TunnelError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Decode the hex key into raw bytes, enforcing AES-256 key length.
    pub fn key_bytes(&self) -> Result<[u8; KEY_LEN]> {
        let raw = hex::decode(self.key.trim())
            .map_err(|e| TunnelError::Config(format!("key is not valid hex: {}", e)))?;
        raw.as_slice().try_into().map_err(|_| {
            TunnelError::Config(format!(
                "key must be {} bytes ({} hex characters), got {} bytes",
                KEY_LEN,
                KEY_LEN * 2,
                raw.len()
            ))
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Worst-case QNAME length for this chunk size and domain, in
    /// presentation form (the wire form adds two octets).
    fn worst_case_qname_len(&self) -> usize {
        let packet_len = self.chunk_size + PACKET_OVERHEAD;
        // Unpadded Base32: 8 characters per 5 bytes, rounded up.
        let encoded = (packet_len * 8).div_ceil(5);
        let payload_labels = encoded.div_ceil(MAX_LABEL_LEN);
        SEQ_LABEL_MAX_LEN + 1 + encoded + (payload_labels - 1) + 1 + self.domain.len()
    }

    /// Validate the configuration. Any failure here is fatal at startup,
    /// never a runtime error.
    pub fn validate(&self) -> Result<()> {
        self.key_bytes()?;

        if self.domain.is_empty() {
            return Err(TunnelError::Config("domain must not be empty".into()));
        }
        if self.domain.len() > MAX_DOMAIN_LEN {
            return Err(TunnelError::Config(format!(
                "domain is {} octets, maximum is {}",
                self.domain.len(),
                MAX_DOMAIN_LEN
            )));
        }
        if !self.domain.is_ascii() {
            return Err(TunnelError::Config("domain must be ASCII".into()));
        }
        for label in self.domain.trim_end_matches('.').split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(TunnelError::Config(format!(
                    "domain label {:?} violates DNS label limits",
                    label
                )));
            }
        }

        if self.chunk_size == 0 {
            return Err(TunnelError::Config("chunk_size must be at least 1".into()));
        }
        let qname_len = self.worst_case_qname_len();
        if qname_len > MAX_QNAME_LEN {
            return Err(TunnelError::Config(format!(
                "chunk_size {} with domain {:?} yields a {}-octet QNAME, maximum is {}",
                self.chunk_size, self.domain, qname_len, MAX_QNAME_LEN
            )));
        }

        if self.timeout_secs == 0 {
            return Err(TunnelError::Config("timeout must be at least 1 second".into()));
        }
        if self.max_retries == 0 {
            return Err(TunnelError::Config("max_retries must be at least 1".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> TunnelConfig {
        TunnelConfig {
            key: "00".repeat(KEY_LEN),
            ..TunnelConfig::default()
        }
    }

    #[test]
    fn default_config_validates_with_a_key() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn missing_key_is_rejected() {
        let config = TunnelConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn short_key_is_rejected() {
        let mut config = valid_config();
        config.key = "00".repeat(16);
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let mut config = valid_config();
        config.chunk_size = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn typical_chunk_sizes_fit() {
        for chunk_size in [30, 40, 50] {
            let mut config = valid_config();
            config.chunk_size = chunk_size;
            assert!(config.validate().is_ok(), "chunk_size {} should fit", chunk_size);
        }
    }

    #[test]
    fn overlong_domain_is_rejected() {
        let mut config = valid_config();
        config.domain = format!("{}.example.com", "a".repeat(60).repeat(4));
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = valid_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: TunnelConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.domain, config.domain);
        assert_eq!(parsed.chunk_size, config.chunk_size);
        assert_eq!(parsed.server_addr, config.server_addr);
    }
}
