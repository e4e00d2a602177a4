use crate::{
    broker::{Broker, TopicReceiver},
    error::{Result, TradeError},
    model::{Envelope, Good, Message, OfferBroadcast},
    state::{CatalogUpdate, SharedState},
};

/// Publishes the local inventory to every peer on the offer topic.
#[derive(Clone)]
pub struct Broadcaster {
    identity: String,
    topic: String,
    broker: Broker,
}

impl Broadcaster {
    pub fn new(identity: impl Into<String>, topic: impl Into<String>, broker: Broker) -> Self {
        Self {
            identity: identity.into(),
            topic: topic.into(),
            broker,
        }
    }

    /// Sends a full snapshot. An empty snapshot withdraws this peer's offer.
    pub fn publish(&self, snapshot: Vec<Good>) -> usize {
        let count = snapshot.len();
        let envelope = Envelope::new(Message::Offer(OfferBroadcast {
            peer: self.identity.clone(),
            goods: snapshot,
        }));
        let reached = self.broker.publish(&self.topic, envelope);
        tracing::debug!(peer = %self.identity, goods = count, reached, "published offer");
        reached
    }

    /// Copies the inventory under the lock and publishes it after the guard
    /// is released.
    pub fn publish_current(&self, state: &SharedState) -> usize {
        let snapshot = state.lock().inventory.snapshot();
        self.publish(snapshot)
    }

    pub fn withdraw(&self) -> usize {
        self.publish(Vec::new())
    }
}

/// Applies offer broadcasts from other peers to the local catalog.
#[derive(Clone)]
pub struct OfferListener {
    state: SharedState,
}

impl OfferListener {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    pub fn handle(&self, envelope: Envelope) -> Result<CatalogUpdate> {
        let broadcast = match envelope.body {
            Message::Offer(broadcast) => broadcast,
            other => {
                return Err(TradeError::ProtocolViolation(format!(
                    "expected offer, got {}",
                    other.kind()
                )))
            }
        };

        let peer = broadcast.peer.clone();
        let update = self.state.lock().catalog.apply(broadcast);
        if update != CatalogUpdate::IgnoredOwn {
            tracing::debug!(peer = %peer, ?update, "offer catalog updated");
        }
        Ok(update)
    }

    pub async fn run(self, mut receiver: TopicReceiver) {
        while let Some(envelope) = receiver.recv().await {
            if let Err(e) = self.handle(envelope) {
                tracing::warn!("dropping offer message: {}", e);
            }
        }
        tracing::debug!("offer topic closed");
    }
}
