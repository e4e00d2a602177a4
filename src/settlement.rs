use crate::{
    broker::{Broker, QueueReceiver},
    error::{Result, TradeError},
    model::{
        AccountNumber, BankCommand, BankReport, Envelope, Message, PaymentOrder, Reservation, Route,
        SaleConfirmation, INSUFFICIENT_FUNDS, INSUFFICIENT_PAYMENT,
    },
    offers::Broadcaster,
    state::SharedState,
};

/// Terminal outcome of a reservation, as decided from a bank report.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Sold {
        buyer: String,
        goods: String,
        amount: u64,
    },
    /// Paid less than the price: the payment is refunded and the goods go
    /// back on sale.
    Underpaid {
        buyer: String,
        goods: String,
        refunded: u64,
    },
    /// The bank refused the buyer's transfer; the goods go back on sale.
    FundsMissing {
        buyer: String,
        goods: String,
    },
    /// Money returned by a seller this peer underpaid. Settles nothing.
    RefundReceived {
        amount: u64,
        from_account: AccountNumber,
    },
}

enum Decision {
    Sold(Reservation),
    Aborted(Reservation, Vec<crate::model::Good>),
}

/// Seller side of settlement: turns bank transfer reports into sale
/// confirmations for the waiting buyer.
#[derive(Clone)]
pub struct SettlementListener {
    identity: String,
    state: SharedState,
    broker: Broker,
    broadcaster: Broadcaster,
    bank_queue: Route,
}

impl SettlementListener {
    pub fn new(
        identity: impl Into<String>,
        state: SharedState,
        broker: Broker,
        broadcaster: Broadcaster,
        bank_queue: Route,
    ) -> Self {
        Self {
            identity: identity.into(),
            state,
            broker,
            broadcaster,
            bank_queue,
        }
    }

    pub fn handle(&self, envelope: Envelope) -> Result<SettlementOutcome> {
        let report = match envelope.body {
            Message::BankReport(report) => report,
            other => {
                return Err(TradeError::ProtocolViolation(format!(
                    "expected bank report, got {}",
                    other.kind()
                )))
            }
        };

        match report {
            BankReport::Received {
                amount,
                sender_account,
            } => self.on_received(amount, sender_account),
            BankReport::InsufficientFunds {
                amount,
                sender_account,
            } => self.on_insufficient_funds(amount, sender_account),
            BankReport::Refunded {
                amount,
                sender_account,
            } => {
                tracing::info!(amount, from_account = sender_account, "refund received");
                Ok(SettlementOutcome::RefundReceived {
                    amount,
                    from_account: sender_account,
                })
            }
        }
    }

    fn on_received(&self, amount: u64, sender_account: AccountNumber) -> Result<SettlementOutcome> {
        let decision = {
            let mut state = self.state.lock();
            let price = state.ledger.find_by_account(sender_account)?.good.price;
            if amount >= price {
                Decision::Sold(state.complete_sale(sender_account)?)
            } else {
                let (reservation, snapshot) = state.abort_sale(sender_account)?;
                Decision::Aborted(reservation, snapshot)
            }
        };

        match decision {
            Decision::Sold(reservation) => {
                tracing::info!(
                    buyer = %reservation.buyer,
                    goods = %reservation.good.name,
                    amount,
                    "payment received, sale confirmed"
                );
                self.confirm(
                    &reservation.reply_route,
                    SaleConfirmation::Accept {
                        goods_name: reservation.good.name.clone(),
                    },
                )?;
                Ok(SettlementOutcome::Sold {
                    buyer: reservation.buyer,
                    goods: reservation.good.name,
                    amount,
                })
            }
            Decision::Aborted(reservation, snapshot) => {
                tracing::warn!(
                    buyer = %reservation.buyer,
                    goods = %reservation.good.name,
                    amount,
                    price = reservation.good.price,
                    "underpaid, refunding and restocking"
                );
                self.broadcaster.publish(snapshot);
                if amount > 0 {
                    self.refund(sender_account, amount)?;
                }
                self.confirm(
                    &reservation.reply_route,
                    SaleConfirmation::Deny {
                        goods_name: reservation.good.name.clone(),
                        reason: INSUFFICIENT_PAYMENT.to_string(),
                    },
                )?;
                Ok(SettlementOutcome::Underpaid {
                    buyer: reservation.buyer,
                    goods: reservation.good.name,
                    refunded: amount,
                })
            }
        }
    }

    fn on_insufficient_funds(&self, amount: u64, sender_account: AccountNumber) -> Result<SettlementOutcome> {
        let (reservation, snapshot) = self.state.lock().abort_sale(sender_account)?;

        tracing::info!(
            buyer = %reservation.buyer,
            goods = %reservation.good.name,
            amount,
            "buyer lacks funds, restocking"
        );
        self.broadcaster.publish(snapshot);
        self.confirm(
            &reservation.reply_route,
            SaleConfirmation::Deny {
                goods_name: reservation.good.name.clone(),
                reason: INSUFFICIENT_FUNDS.to_string(),
            },
        )?;

        Ok(SettlementOutcome::FundsMissing {
            buyer: reservation.buyer,
            goods: reservation.good.name,
        })
    }

    fn confirm(&self, route: &Route, confirmation: SaleConfirmation) -> Result<()> {
        self.broker
            .send(route, Envelope::new(Message::SaleConfirmation(confirmation)))
    }

    fn refund(&self, buyer_account: AccountNumber, amount: u64) -> Result<()> {
        let order = PaymentOrder {
            sender: self.identity.clone(),
            receiver_account: buyer_account,
            amount,
        };
        self.broker
            .send(&self.bank_queue, Envelope::new(Message::Bank(BankCommand::Refund(order))))
    }

    pub async fn run(self, mut receiver: QueueReceiver) {
        while let Some(envelope) = receiver.recv().await {
            match self.handle(envelope) {
                Ok(outcome) => tracing::debug!(?outcome, "reservation settled"),
                Err(e @ (TradeError::UnknownAccount(_) | TradeError::ReservationNotFound(_))) => {
                    tracing::warn!("dropping bank report: {}", e);
                }
                Err(e) => tracing::error!("bank report handling failed: {}", e),
            }
        }
        tracing::debug!("bank report queue closed");
    }
}
