//! # Peer Market
//!
//! Peers that are both buyers and sellers trade named goods through a shared
//! message broker, while a bank settles the payments.
//!
//! ## Architecture
//!
//! - **State**: inventory, offer catalog and reservation ledger behind one lock
//! - **Offers**: inventory snapshots broadcast on a topic, applied to every peer's catalog
//! - **Sale**: seller side, reserves goods for a buyer on request
//! - **Settlement**: seller side, confirms or aborts reservations from bank reports
//! - **Negotiation**: buyer side, request, pay and wait for confirmation
//! - **Broker / Bank**: in-process collaborators the protocol runs against

pub mod bank;
pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod negotiation;
pub mod offers;
pub mod peer;
pub mod sale;
pub mod settlement;
pub mod state;

pub use bank::Bank;
pub use broker::Broker;
pub use config::AppConfig;
pub use error::{Result, TradeError};
pub use model::{AccountNumber, Good, PeerOffer, Reservation};
pub use negotiation::{NegotiationEngine, PriceConfirmation, PurchaseOutcome, ReplyTimeout};
pub use offers::{Broadcaster, OfferListener};
pub use peer::Peer;
pub use sale::SaleResponder;
pub use settlement::{SettlementListener, SettlementOutcome};
pub use state::{LocalState, SharedState};
