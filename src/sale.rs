use crate::{
    broker::{Broker, QueueReceiver},
    error::{Result, TradeError},
    model::{Envelope, Message, SaleResponse},
    offers::Broadcaster,
    state::{ReserveOutcome, SharedState},
};

/// Seller side of a purchase: answers sale requests arriving on this peer's
/// sale queue.
#[derive(Clone)]
pub struct SaleResponder {
    state: SharedState,
    broker: Broker,
    broadcaster: Broadcaster,
}

impl SaleResponder {
    pub fn new(state: SharedState, broker: Broker, broadcaster: Broadcaster) -> Self {
        Self {
            state,
            broker,
            broadcaster,
        }
    }

    pub fn handle(&self, envelope: Envelope) -> Result<SaleResponse> {
        let request = match envelope.body {
            Message::SaleRequest(request) => request,
            other => {
                return Err(TradeError::ProtocolViolation(format!(
                    "expected sale request, got {}",
                    other.kind()
                )))
            }
        };
        let reply_to = envelope.reply_to.ok_or_else(|| {
            TradeError::ProtocolViolation(format!("sale request from {} has no reply route", request.buyer))
        })?;

        let outcome = self.state.lock().reserve(&request, reply_to.clone())?;

        let response = match outcome {
            ReserveOutcome::Reserved {
                seller_account,
                good,
                snapshot,
            } => {
                tracing::info!(
                    buyer = %request.buyer,
                    goods = %good.name,
                    price = good.price,
                    "reserved goods"
                );
                self.broadcaster.publish(snapshot);
                SaleResponse::Accept {
                    seller_account,
                    price: good.price,
                }
            }
            ReserveOutcome::Denied { reason } => {
                tracing::info!(buyer = %request.buyer, goods = %request.goods_name, %reason, "denied sale request");
                SaleResponse::Deny { reason }
            }
        };

        let reply = Envelope::new(Message::SaleResponse(response.clone()));
        if let Err(e) = self.broker.send(&reply_to, reply) {
            if matches!(response, SaleResponse::Accept { .. }) {
                // The buyer can no longer pay for what it cannot hear about.
                let (_, snapshot) = self.state.lock().abort_sale(request.buyer_account)?;
                self.broadcaster.publish(snapshot);
                tracing::warn!(buyer = %request.buyer, "buyer unreachable, reservation released");
            }
            return Err(e);
        }

        Ok(response)
    }

    pub async fn run(self, mut receiver: QueueReceiver) {
        while let Some(envelope) = receiver.recv().await {
            let description = envelope.describe();
            if let Err(e) = self.handle(envelope) {
                tracing::warn!(message = %description, "sale request failed: {}", e);
            }
        }
        tracing::debug!(queue = %receiver.route(), "sale queue closed");
    }
}
