//! Peer configuration

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Transfer configuration
    pub transfer: TransferConfig,

    /// Bandwidth pricing configuration
    pub pricing: PricingConfig,

    /// Presence configuration
    pub presence: PresenceConfig,

    /// Ledger flush configuration
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum concurrent sessions per peer
    pub max_sessions_per_peer: usize,
    /// Maximum blob size accepted from a provider, in bytes
    pub max_blob_size: u64,
    /// Seconds a session may wait in Offered before aborting
    pub ack_timeout_secs: u64,
    /// Seconds a session may stay in Transferring before aborting
    pub transfer_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Our rate in smallest currency unit per GiB served
    pub rate_per_gb: u64,
    /// Currency unit quoted in payment terms
    pub unit: String,
    /// Payment methods we accept as provider
    pub methods: Vec<String>,
    /// Reject quotes above this multiple of our expected rate
    pub max_rate_multiple: u64,
    /// Serve content without payment terms
    pub serve_free: bool,
    /// Seconds a requester stays untrusted after stiffing a postpay transfer
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Seconds since last traffic within which a peer counts as online
    pub liveness_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Seconds between periodic ledger flushes
    pub flush_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.tollgate".to_string(),
            transfer: TransferConfig {
                max_sessions_per_peer: 8,
                max_blob_size: 256 * 1024 * 1024,
                ack_timeout_secs: tollgate_core::BLOB_ACK_TIMEOUT.as_secs(),
                transfer_timeout_secs: tollgate_core::TRANSFER_TIMEOUT.as_secs(),
            },
            pricing: PricingConfig {
                rate_per_gb: 100,
                unit: "sat".to_string(),
                methods: vec!["lightning".to_string(), "cashu".to_string()],
                max_rate_multiple: 3,
                serve_free: false,
                cooldown_secs: 600,
            },
            presence: PresenceConfig {
                liveness_window_secs: 120,
            },
            ledger: LedgerConfig {
                flush_interval_secs: 10,
            },
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> std::path::PathBuf {
        if self.data_dir.starts_with("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(&self.data_dir[2..]);
            }
        }
        std::path::PathBuf::from(&self.data_dir)
    }
}
