//! In-process message broker.
//!
//! Provides the two destination kinds the trading protocol relies on:
//!
//! - **Queues**: named point-to-point destinations with a single consumer.
//!   Messages sent before the consumer attaches are buffered.
//! - **Topics**: publish/subscribe destinations; every subscriber receives
//!   every message published after it subscribed.
//!
//! Delivery is reliable and ordered per destination. Acknowledgement is
//! implicit on receipt.

use crate::error::{Result, TradeError};
use crate::model::{Envelope, Route};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const TEMPORARY_PREFIX: &str = "tmp-";

struct QueueSlot {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Option<mpsc::UnboundedReceiver<Envelope>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

struct Inner {
    queues: Mutex<HashMap<String, QueueSlot>>,
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    topic_capacity: usize,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Broker {
    pub fn new(topic_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                topics: Mutex::new(HashMap::new()),
                topic_capacity: topic_capacity.max(1),
            }),
        }
    }

    /// Declares a named queue, creating it if it does not exist yet.
    pub fn queue(&self, name: &str) -> Route {
        self.inner
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(QueueSlot::new);
        Route::new(name)
    }

    /// Creates a uniquely named queue that lives until [`Broker::delete_queue`].
    pub fn temporary_queue(&self) -> Route {
        let name = format!("{}{}", TEMPORARY_PREFIX, uuid::Uuid::new_v4());
        self.queue(&name)
    }

    pub fn delete_queue(&self, route: &Route) {
        self.inner.queues.lock().remove(route.as_str());
    }

    /// Attaches the single consumer of a queue.
    pub fn consume(&self, route: &Route) -> Result<QueueReceiver> {
        let mut queues = self.inner.queues.lock();
        let slot = queues
            .entry(route.as_str().to_string())
            .or_insert_with(QueueSlot::new);
        if slot.receiver.is_none() && slot.sender.is_closed() {
            // Previous consumer is gone; a returning consumer starts fresh.
            *slot = QueueSlot::new();
        }
        let receiver = slot
            .receiver
            .take()
            .ok_or_else(|| TradeError::QueueInUse(route.to_string()))?;

        Ok(QueueReceiver {
            route: route.clone(),
            receiver,
        })
    }

    /// Sends to a queue. Named queues are created on first use and keep
    /// buffering after their consumer goes away; temporary queues must still
    /// have a live consumer or a pending one.
    pub fn send(&self, route: &Route, envelope: Envelope) -> Result<()> {
        let temporary = route.as_str().starts_with(TEMPORARY_PREFIX);
        let mut queues = self.inner.queues.lock();

        let envelope = match queues.get(route.as_str()) {
            Some(slot) => match slot.sender.send(envelope) {
                Ok(()) => {
                    tracing::trace!(route = %route, "queued message");
                    return Ok(());
                }
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            None => envelope,
        };

        if temporary {
            queues.remove(route.as_str());
            return Err(TradeError::BrokerClosed(route.to_string()));
        }

        let slot = QueueSlot::new();
        // A fresh channel with its receiver parked in the slot cannot be closed.
        let _ = slot.sender.send(envelope);
        queues.insert(route.as_str().to_string(), slot);
        tracing::trace!(route = %route, "queued message on new queue");
        Ok(())
    }

    /// Publishes to a topic and returns the number of subscribers reached.
    pub fn publish(&self, topic: &str, envelope: Envelope) -> usize {
        let sender = self.topic_sender(topic);
        // No subscribers is not an error for pub/sub.
        sender.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self, topic: &str) -> TopicReceiver {
        TopicReceiver {
            topic: topic.to_string(),
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.topic_capacity).0)
            .clone()
    }
}

pub struct QueueReceiver {
    route: Route,
    receiver: mpsc::UnboundedReceiver<Envelope>,
}

impl QueueReceiver {
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Waits for the next message. `None` once the queue has been deleted
    /// and drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Envelope> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => Err(TradeError::BrokerClosed(self.route.to_string())),
            Err(_) => Err(TradeError::ReplyTimeout(timeout)),
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.receiver.try_recv().ok()
    }
}

pub struct TopicReceiver {
    topic: String,
    receiver: broadcast::Receiver<Envelope>,
}

impl TopicReceiver {
    /// Waits for the next published message. Messages this subscriber fell
    /// too far behind on are skipped with a warning.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %self.topic, skipped, "subscriber lagged behind topic");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, OfferBroadcast, SaleResponse};

    fn deny(reason: &str) -> Envelope {
        Envelope::new(Message::SaleResponse(SaleResponse::Deny {
            reason: reason.to_string(),
        }))
    }

    #[tokio::test]
    async fn test_queue_buffers_until_consumer_attaches() {
        let broker = Broker::default();
        let route = Route::new("alice-SaleQueue");

        broker.send(&route, deny("first")).unwrap();
        broker.send(&route, deny("second")).unwrap();

        let mut receiver = broker.consume(&route).unwrap();
        assert_eq!(receiver.recv().await.unwrap().body, deny("first").body);
        assert_eq!(receiver.recv().await.unwrap().body, deny("second").body);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_queue_preserves_order() {
        let broker = Broker::default();
        let route = broker.queue("orders");
        let mut receiver = broker.consume(&route).unwrap();

        for reason in ["a", "b", "c"] {
            broker.send(&route, deny(reason)).unwrap();
        }

        for reason in ["a", "b", "c"] {
            assert_eq!(receiver.recv().await.unwrap().body, deny(reason).body);
        }
    }

    #[tokio::test]
    async fn test_queue_has_single_consumer() {
        let broker = Broker::default();
        let route = broker.queue("single");
        let _first = broker.consume(&route).unwrap();

        assert!(matches!(broker.consume(&route), Err(TradeError::QueueInUse(_))));
    }

    #[tokio::test]
    async fn test_deleted_temporary_queue_rejects_sends() {
        let broker = Broker::default();
        let route = broker.temporary_queue();
        assert!(route.as_str().starts_with(TEMPORARY_PREFIX));

        broker.delete_queue(&route);
        assert!(matches!(
            broker.send(&route, deny("late")),
            Err(TradeError::BrokerClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_consumer_closes_queue() {
        let broker = Broker::default();
        let route = broker.temporary_queue();
        drop(broker.consume(&route).unwrap());

        assert!(broker.send(&route, deny("nobody")).is_err());
    }

    #[tokio::test]
    async fn test_named_queue_can_be_consumed_again_after_consumer_leaves() {
        let broker = Broker::default();
        let route = broker.queue("alice-SaleQueue");
        drop(broker.consume(&route).unwrap());

        broker.send(&route, deny("while away")).unwrap();
        let mut receiver = broker.consume(&route).unwrap();

        assert_eq!(receiver.recv().await.unwrap().body, deny("while away").body);
    }

    #[tokio::test]
    async fn test_recv_timeout_elapses() {
        let broker = Broker::default();
        let route = broker.temporary_queue();
        let mut receiver = broker.consume(&route).unwrap();

        let err = receiver.recv_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, TradeError::ReplyTimeout(_)));
    }

    #[tokio::test]
    async fn test_topic_fans_out_to_all_subscribers() {
        let broker = Broker::default();
        let mut first = broker.subscribe("Offers");
        let mut second = broker.subscribe("Offers");

        let offer = Envelope::new(Message::Offer(OfferBroadcast {
            peer: "alice".to_string(),
            goods: vec![],
        }));
        assert_eq!(broker.publish("Offers", offer.clone()), 2);

        assert_eq!(first.recv().await.unwrap().body, offer.body);
        assert_eq!(second.recv().await.unwrap().body, offer.body);
    }

    #[test]
    fn test_publish_without_subscribers_is_not_an_error() {
        let broker = Broker::default();
        let offer = Envelope::new(Message::Offer(OfferBroadcast {
            peer: "alice".to_string(),
            goods: vec![],
        }));

        assert_eq!(broker.publish("Offers", offer), 0);
    }
}
