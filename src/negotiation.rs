use crate::{
    broker::{Broker, QueueReceiver},
    error::{Result, TradeError},
    model::{
        AccountNumber, BankCommand, Envelope, Message, PaymentOrder, Route, SaleConfirmation, SaleRequest,
        SaleResponse,
    },
    state::SharedState,
};
use std::time::Duration;

/// How long a purchase waits for each reply from the seller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyTimeout {
    /// Wait until the seller answers, however long that takes.
    #[default]
    Never,
    After(Duration),
}

impl From<Option<Duration>> for ReplyTimeout {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or(ReplyTimeout::Never, ReplyTimeout::After)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseOutcome {
    Success {
        seller_account: AccountNumber,
        goods: String,
        price: u64,
    },
    Denied {
        reason: String,
    },
    /// The seller answered with a message that does not belong at this step.
    UnknownResponse,
}

/// Asks the user whether to pay a price that the cached offer did not list.
#[cfg_attr(test, mockall::automock)]
pub trait PriceConfirmation: Send + Sync {
    fn confirm_price(&self, seller: &str, goods: &str, listed: &[u64], offered: u64) -> bool;
}

/// Pays whatever the seller asks.
pub struct AlwaysConfirm;

impl PriceConfirmation for AlwaysConfirm {
    fn confirm_price(&self, _seller: &str, _goods: &str, _listed: &[u64], _offered: u64) -> bool {
        true
    }
}

/// Only pays prices that were listed in the catalog.
pub struct ListedPricesOnly;

impl PriceConfirmation for ListedPricesOnly {
    fn confirm_price(&self, _seller: &str, _goods: &str, _listed: &[u64], _offered: u64) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub bank_queue: Route,
    pub sale_queue_suffix: String,
    pub reply_timeout: ReplyTimeout,
}

/// Buyer side of a purchase. Owns the session's reply queue, so purchases
/// through one engine run one at a time.
pub struct NegotiationEngine {
    identity: String,
    account: AccountNumber,
    state: SharedState,
    broker: Broker,
    replies: QueueReceiver,
    settings: NegotiationSettings,
}

impl NegotiationEngine {
    pub fn new(
        identity: impl Into<String>,
        account: AccountNumber,
        state: SharedState,
        broker: Broker,
        replies: QueueReceiver,
        settings: NegotiationSettings,
    ) -> Self {
        Self {
            identity: identity.into(),
            account,
            state,
            broker,
            replies,
            settings,
        }
    }

    pub fn reply_route(&self) -> &Route {
        self.replies.route()
    }

    pub async fn buy(
        &mut self,
        seller: &str,
        goods: &str,
        confirmation: &dyn PriceConfirmation,
    ) -> Result<PurchaseOutcome> {
        let timeout = self.settings.reply_timeout;
        self.buy_with_timeout(seller, goods, confirmation, timeout).await
    }

    pub async fn buy_with_timeout(
        &mut self,
        seller: &str,
        goods: &str,
        confirmation: &dyn PriceConfirmation,
        timeout: ReplyTimeout,
    ) -> Result<PurchaseOutcome> {
        let listed = self.state.lock().catalog.prices_of(seller, goods);
        match &listed {
            Some(prices) => tracing::info!(seller, goods, ?prices, "listed prices"),
            None => tracing::info!(seller, goods, "seller has no cached offer"),
        }
        let listed = listed.unwrap_or_default();

        self.discard_stale_replies();

        let sale_queue = Route::new(format!("{}{}", seller, self.settings.sale_queue_suffix));
        let request = Envelope::new(Message::SaleRequest(SaleRequest {
            buyer: self.identity.clone(),
            goods_name: goods.to_string(),
            buyer_account: self.account,
        }))
        .with_reply_to(self.replies.route().clone());
        self.broker.send(&sale_queue, request)?;

        let reply = self.await_reply(timeout).await?;
        let (seller_account, price) = match reply.body {
            Message::SaleResponse(SaleResponse::Accept {
                seller_account,
                price,
            }) => (seller_account, price),
            Message::SaleResponse(SaleResponse::Deny { reason }) => {
                tracing::info!(seller, goods, %reason, "seller denied sale");
                return Ok(PurchaseOutcome::Denied { reason });
            }
            other => {
                tracing::warn!(seller, kind = other.kind(), "unexpected reply to sale request");
                return Ok(PurchaseOutcome::UnknownResponse);
            }
        };

        if !listed.contains(&price) && !confirmation.confirm_price(seller, goods, &listed, price) {
            tracing::info!(seller, goods, price, "declined unlisted price");
            return Err(TradeError::StaleCacheMismatch {
                seller: seller.to_string(),
                goods: goods.to_string(),
                price,
            });
        }

        let order = PaymentOrder {
            sender: self.identity.clone(),
            receiver_account: seller_account,
            amount: price,
        };
        tracing::info!(seller, seller_account, price, "ordering payment");
        self.broker.send(
            &self.settings.bank_queue,
            Envelope::new(Message::Bank(BankCommand::Pay(order))),
        )?;

        let settled = self.await_reply(timeout).await?;
        match settled.body {
            Message::SaleConfirmation(SaleConfirmation::Accept { goods_name }) => {
                tracing::info!(seller, goods = %goods_name, price, "purchase successful");
                Ok(PurchaseOutcome::Success {
                    seller_account,
                    goods: goods_name,
                    price,
                })
            }
            Message::SaleConfirmation(SaleConfirmation::Deny { reason, .. }) => {
                tracing::info!(seller, goods, %reason, "purchase failed");
                Ok(PurchaseOutcome::Denied { reason })
            }
            other => {
                tracing::warn!(seller, kind = other.kind(), "unexpected sale confirmation");
                Ok(PurchaseOutcome::UnknownResponse)
            }
        }
    }

    async fn await_reply(&mut self, timeout: ReplyTimeout) -> Result<Envelope> {
        match timeout {
            ReplyTimeout::Never => self
                .replies
                .recv()
                .await
                .ok_or_else(|| TradeError::BrokerClosed(self.replies.route().to_string())),
            ReplyTimeout::After(limit) => self.replies.recv_timeout(limit).await,
        }
    }

    /// Late answers to an earlier, abandoned purchase must not be read as
    /// answers to this one.
    fn discard_stale_replies(&mut self) {
        while let Some(stale) = self.replies.try_recv() {
            tracing::debug!(message = %stale.describe(), "discarding stale reply");
        }
    }
}
