use crate::error::{Result, TradeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub bank: BankConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct PeerConfig {
    pub name: Option<String>,
    pub goods_count: usize,
    pub goods_name_len: usize,
    pub max_price: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub offer_topic: String,
    pub bank_queue: String,
    pub sale_queue_suffix: String,
    pub topic_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Unset means a purchase waits for the seller indefinitely.
    pub reply_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct BankConfig {
    pub initial_balance: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: None,
            goods_count: 10,
            goods_name_len: 4,
            max_price: 10_000,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            offer_topic: "Offers".to_string(),
            bank_queue: "BankQueue".to_string(),
            sale_queue_suffix: "-SaleQueue".to_string(),
            topic_capacity: 1024,
        }
    }
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("pretty".to_string()),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| TradeError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(name) = std::env::var("MARKET_PEER_NAME") {
            self.peer.name = Some(name);
        }

        if let Ok(timeout) = std::env::var("MARKET_REPLY_TIMEOUT_MS") {
            let millis = timeout
                .parse::<u64>()
                .map_err(|e| TradeError::Config(format!("Invalid MARKET_REPLY_TIMEOUT_MS: {}", e)))?;
            self.negotiation.reply_timeout_ms = Some(millis);
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer.goods_name_len == 0 {
            return Err(TradeError::Config("Goods name length cannot be 0".to_string()));
        }

        if self.peer.max_price == 0 {
            return Err(TradeError::Config("Max price cannot be 0".to_string()));
        }

        if let Some(name) = &self.peer.name {
            if name.trim().is_empty() {
                return Err(TradeError::Config("Peer name cannot be blank".to_string()));
            }
        }

        if self.broker.offer_topic.is_empty() || self.broker.bank_queue.is_empty() {
            return Err(TradeError::Config("Broker destinations cannot be empty".to_string()));
        }

        if self.broker.topic_capacity == 0 {
            return Err(TradeError::Config("Topic capacity cannot be 0".to_string()));
        }

        if self.negotiation.reply_timeout_ms == Some(0) {
            return Err(TradeError::Config("Reply timeout cannot be 0".to_string()));
        }

        Ok(())
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.negotiation.reply_timeout_ms.map(Duration::from_millis)
    }

    pub fn sale_queue_name(&self, peer: &str) -> String {
        format!("{}{}", peer, self.broker.sale_queue_suffix)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| TradeError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| TradeError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
