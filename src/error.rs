use std::time::Duration;
use thiserror::Error;
use crate::model::AccountNumber;

pub type Result<T> = std::result::Result<T, TradeError>;

#[derive(Error, Debug)]
pub enum TradeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Seller {seller} offers {goods} for previously unknown price {price}")]
    StaleCacheMismatch {
        seller: String,
        goods: String,
        price: u64,
    },

    #[error("No pending reservation for account {0}")]
    ReservationNotFound(AccountNumber),

    #[error("Unknown account: {0}")]
    UnknownAccount(AccountNumber),

    #[error("No reply received within {0:?}")]
    ReplyTimeout(Duration),

    #[error("Broker route closed: {0}")]
    BrokerClosed(String),

    #[error("Queue already has a consumer: {0}")]
    QueueInUse(String),

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TradeError {
    fn from(err: serde_json::Error) -> Self {
        TradeError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TradeError {
    fn from(err: toml::de::Error) -> Self {
        TradeError::Config(format!("Failed to parse config file: {}", err))
    }
}
