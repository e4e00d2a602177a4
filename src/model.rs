use crate::error::{Result, TradeError};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque account number issued by the bank at registration.
pub type AccountNumber = u64;

pub const NO_SUCH_GOODS: &str = "No such goods found.";
pub const INSUFFICIENT_FUNDS: &str = "Insufficient funds.";
pub const INSUFFICIENT_PAYMENT: &str = "Insufficient payment.";
pub const PURCHASE_PENDING: &str = "Previous purchase still pending.";

/// Name of a broker queue that a message can be delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Route(String);

impl Route {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Good {
    pub name: String,
    pub price: u64,
}

impl Good {
    pub fn new(name: impl Into<String>, price: u64) -> Self {
        Self {
            name: name.into(),
            price,
        }
    }

    /// Generates up to `count` goods with distinct random uppercase names.
    pub fn random_batch<R: Rng>(rng: &mut R, count: usize, name_len: usize, max_price: u64) -> Vec<Good> {
        let mut goods: HashMap<String, Good> = HashMap::with_capacity(count);
        let mut attempts = 0;

        while goods.len() < count && attempts < count * 16 {
            attempts += 1;
            let name: String = (0..name_len)
                .map(|_| char::from(b'A' + rng.gen_range(0..26u8)))
                .collect();
            let price = rng.gen_range(0..max_price.max(1));
            goods.entry(name.clone()).or_insert_with(|| Good::new(name, price));
        }

        goods.into_values().collect()
    }
}

impl fmt::Display for Good {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ${}", self.name, self.price)
    }
}

/// Snapshot of the goods one peer currently offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOffer {
    pub peer: String,
    pub goods: Vec<Good>,
}

impl PeerOffer {
    pub fn prices_of(&self, goods_name: &str) -> Vec<u64> {
        self.goods
            .iter()
            .filter(|g| g.name == goods_name)
            .map(|g| g.price)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub buyer: String,
    pub buyer_account: AccountNumber,
    pub reply_route: Route,
    pub good: Good,
    pub reserved_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(buyer: String, buyer_account: AccountNumber, reply_route: Route, good: Good) -> Self {
        Self {
            buyer,
            buyer_account,
            reply_route,
            good,
            reserved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRequest {
    pub buyer: String,
    pub goods_name: String,
    pub buyer_account: AccountNumber,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaleResponse {
    Accept {
        seller_account: AccountNumber,
        price: u64,
    },
    Deny {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub sender: String,
    pub receiver_account: AccountNumber,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaleConfirmation {
    Accept {
        goods_name: String,
    },
    Deny {
        goods_name: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferBroadcast {
    pub peer: String,
    pub goods: Vec<Good>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BankCommand {
    /// The envelope's reply route receives the account number and, later,
    /// every transfer report concerning the new account.
    OpenAccount { client: String },
    Balance { account: AccountNumber },
    Pay(PaymentOrder),
    /// Returns money to a payer; reported to the receiver as `Refunded`.
    Refund(PaymentOrder),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum BankReply {
    AccountOpened { account: AccountNumber },
    Balance { account: AccountNumber, balance: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum BankReport {
    Received {
        amount: u64,
        sender_account: AccountNumber,
    },
    InsufficientFunds {
        amount: u64,
        sender_account: AccountNumber,
    },
    Refunded {
        amount: u64,
        sender_account: AccountNumber,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    SaleRequest(SaleRequest),
    SaleResponse(SaleResponse),
    SaleConfirmation(SaleConfirmation),
    Offer(OfferBroadcast),
    Bank(BankCommand),
    BankReply(BankReply),
    BankReport(BankReport),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SaleRequest(_) => "sale_request",
            Message::SaleResponse(_) => "sale_response",
            Message::SaleConfirmation(_) => "sale_confirmation",
            Message::Offer(_) => "offer",
            Message::Bank(_) => "bank",
            Message::BankReply(_) => "bank_reply",
            Message::BankReport(_) => "bank_report",
        }
    }
}

/// A message in flight, with the route its answer should go to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub reply_to: Option<Route>,
    pub body: Message,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(body: Message) -> Self {
        Self {
            reply_to: None,
            body,
            sent_at: Utc::now(),
        }
    }

    pub fn with_reply_to(mut self, route: Route) -> Self {
        self.reply_to = Some(route);
        self
    }

    /// JSON rendering used when logging messages that do not fit a receive point.
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(TradeError::from)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(TradeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_batch_has_unique_names() {
        let mut rng = StdRng::seed_from_u64(7);
        let goods = Good::random_batch(&mut rng, 10, 4, 10_000);

        assert_eq!(goods.len(), 10);
        let mut names: Vec<_> = goods.iter().map(|g| g.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 10);
        for good in &goods {
            assert_eq!(good.name.len(), 4);
            assert!(good.name.chars().all(|c| c.is_ascii_uppercase()));
            assert!(good.price < 10_000);
        }
    }

    #[test]
    fn test_prices_of_filters_by_name() {
        let offer = PeerOffer {
            peer: "alice".to_string(),
            goods: vec![Good::new("ABCD", 100), Good::new("WXYZ", 5)],
        };

        assert_eq!(offer.prices_of("ABCD"), vec![100]);
        assert!(offer.prices_of("NONE").is_empty());
    }

    #[test]
    fn test_envelope_json_keeps_reply_route() {
        let envelope = Envelope::new(Message::SaleResponse(SaleResponse::Deny {
            reason: NO_SUCH_GOODS.to_string(),
        }))
        .with_reply_to(Route::new("tmp-1"));

        let raw = envelope.to_json().unwrap();
        assert!(raw.contains("\"deny\""));
        let parsed = Envelope::from_json(&raw).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.body.kind(), "sale_response");
    }
}
