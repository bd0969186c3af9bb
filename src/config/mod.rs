//! Configuration management
//!
//! Built-in defaults, overridden by an optional TOML file, overridden by
//! `REGCLIENT__SECTION__KEY` environment variables.

use crate::infrastructure::protocols::sip::{TimerConfig, TransportProtocol, UserCredentials};
use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sip: SipConfig,
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub credentials: Option<UserCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// `udp` or `tcp`
    pub transport: String,
    /// Registrar address requests are sent to
    pub registrar: String,
    pub domain: String,
    pub username: String,
    /// Requested binding lifetime in seconds
    pub expires: u32,
}

/// Timer values in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub initial_retransmit_interval_ms: u64,
    pub transaction_timeout_ms: u64,
    pub linger_ms: u64,
    pub reliable_transport: bool,
    pub restart_linger_on_duplicate: bool,
}

impl SipConfig {
    pub fn transport_protocol(&self) -> Result<TransportProtocol, ConfigError> {
        match self.transport.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            other => Err(ConfigError::Message(format!(
                "Unsupported transport: {}",
                other
            ))),
        }
    }

    pub fn bind(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}

impl TransactionConfig {
    pub fn timer_config(&self) -> TimerConfig {
        TimerConfig {
            initial_retransmit_interval: Duration::from_millis(self.initial_retransmit_interval_ms),
            transaction_timeout: Duration::from_millis(self.transaction_timeout_ms),
            linger_duration: Duration::from_millis(self.linger_ms),
            reliable_transport: self.reliable_transport,
            restart_linger_on_duplicate: self.restart_linger_on_duplicate,
        }
    }
}

impl Config {
    /// Load configuration, layering `path` (if any) and the environment
    /// over the defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Config::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }

        builder
            .add_source(
                Environment::with_prefix("REGCLIENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

impl Default for Config {
    fn default() -> Self {
        let timers = TimerConfig::default();

        Self {
            sip: SipConfig {
                bind_address: "0.0.0.0".to_string(),
                bind_port: 5070,
                transport: "udp".to_string(),
                registrar: "127.0.0.1:5060".to_string(),
                domain: "localhost".to_string(),
                username: "alice".to_string(),
                expires: 3600,
            },
            transaction: TransactionConfig {
                initial_retransmit_interval_ms: timers.initial_retransmit_interval.as_millis() as u64,
                transaction_timeout_ms: timers.transaction_timeout.as_millis() as u64,
                linger_ms: timers.linger_duration.as_millis() as u64,
                reliable_transport: timers.reliable_transport,
                restart_linger_on_duplicate: timers.restart_linger_on_duplicate,
            },
            credentials: None,
        }
    }
}
