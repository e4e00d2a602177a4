//! Peer session wiring.
//!
//! A connected peer runs two sessions against the broker. The *event
//! session* owns the three listener tasks (offers, sale requests, bank
//! reports); the *client session* owns the reply queue that purchases block
//! on. Keeping them apart means a purchase waiting on a silent seller never
//! stalls this peer's own selling.

use crate::{
    broker::{Broker, QueueReceiver},
    config::AppConfig,
    error::{Result, TradeError},
    model::{AccountNumber, BankCommand, BankReply, Envelope, Good, Message, PeerOffer, Route},
    negotiation::{NegotiationEngine, NegotiationSettings, PriceConfirmation, PurchaseOutcome, ReplyTimeout},
    offers::{Broadcaster, OfferListener},
    sale::SaleResponder,
    settlement::SettlementListener,
    state::{LocalState, SharedState},
};
use tokio::task::JoinHandle;

struct Session {
    account: AccountNumber,
    engine: NegotiationEngine,
    report_route: Route,
    sale_queue: Route,
    listeners: Vec<JoinHandle<()>>,
}

pub struct Peer {
    identity: String,
    broker: Broker,
    config: AppConfig,
    state: SharedState,
    broadcaster: Broadcaster,
    session: Option<Session>,
}

impl Peer {
    pub fn new(identity: impl Into<String>, goods: Vec<Good>, broker: Broker, config: AppConfig) -> Self {
        let identity = identity.into();
        let state = LocalState::new(identity.clone(), goods).into_shared();
        let broadcaster = Broadcaster::new(identity.clone(), config.broker.offer_topic.clone(), broker.clone());
        Self {
            identity,
            broker,
            config,
            state,
            broadcaster,
            session: None,
        }
    }

    /// Creates a peer offering the configured batch of random goods.
    pub fn with_random_goods(identity: impl Into<String>, broker: Broker, config: AppConfig) -> Self {
        let goods = Good::random_batch(
            &mut rand::thread_rng(),
            config.peer.goods_count,
            config.peer.goods_name_len,
            config.peer.max_price,
        );
        Self::new(identity, goods, broker, config)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn account(&self) -> Option<AccountNumber> {
        self.session.as_ref().map(|s| s.account)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn reply_timeout(&self) -> ReplyTimeout {
        ReplyTimeout::from(self.config.reply_timeout())
    }

    /// Opens a bank account, starts the listeners and publishes the first offer.
    ///
    /// Both queues only this peer may consume are claimed before the bank
    /// hears about it, so a failed connect leaves no listener behind and does
    /// not move the account's report route.
    pub async fn connect(&mut self) -> Result<AccountNumber> {
        if let Some(session) = &self.session {
            return Ok(session.account);
        }

        let bank_queue = Route::new(self.config.broker.bank_queue.clone());

        let sale_queue = self.broker.queue(&self.config.sale_queue_name(&self.identity));
        let sale_requests = self.broker.consume(&sale_queue)?;

        // Client session.
        let reply_route = self.broker.temporary_queue();
        let replies = self.broker.consume(&reply_route)?;

        // Event session: the report route receives the account number first,
        // then every transfer report for this account.
        let report_route = self.broker.temporary_queue();
        let mut reports = match self.broker.consume(&report_route) {
            Ok(reports) => reports,
            Err(e) => {
                self.broker.delete_queue(&reply_route);
                return Err(e);
            }
        };
        let account = match self.open_account(&bank_queue, &report_route, &mut reports).await {
            Ok(account) => account,
            Err(e) => {
                self.broker.delete_queue(&report_route);
                self.broker.delete_queue(&reply_route);
                return Err(e);
            }
        };
        self.state.lock().set_own_account(account);
        tracing::info!(peer = %self.identity, account, "connected");

        let mut listeners = Vec::with_capacity(3);

        let settlement = SettlementListener::new(
            self.identity.clone(),
            self.state.clone(),
            self.broker.clone(),
            self.broadcaster.clone(),
            bank_queue.clone(),
        );
        listeners.push(tokio::spawn(settlement.run(reports)));

        let offers = self.broker.subscribe(&self.config.broker.offer_topic);
        listeners.push(tokio::spawn(OfferListener::new(self.state.clone()).run(offers)));

        let responder = SaleResponder::new(self.state.clone(), self.broker.clone(), self.broadcaster.clone());
        listeners.push(tokio::spawn(responder.run(sale_requests)));

        let engine = NegotiationEngine::new(
            self.identity.clone(),
            account,
            self.state.clone(),
            self.broker.clone(),
            replies,
            NegotiationSettings {
                bank_queue,
                sale_queue_suffix: self.config.broker.sale_queue_suffix.clone(),
                reply_timeout: self.reply_timeout(),
            },
        );

        self.session = Some(Session {
            account,
            engine,
            report_route,
            sale_queue,
            listeners,
        });

        self.publish()?;
        Ok(account)
    }

    async fn open_account(
        &self,
        bank_queue: &Route,
        report_route: &Route,
        reports: &mut QueueReceiver,
    ) -> Result<AccountNumber> {
        self.broker.send(
            bank_queue,
            Envelope::new(Message::Bank(BankCommand::OpenAccount {
                client: self.identity.clone(),
            }))
            .with_reply_to(report_route.clone()),
        )?;

        let opened = match self.reply_timeout() {
            ReplyTimeout::Never => reports
                .recv()
                .await
                .ok_or_else(|| TradeError::BrokerClosed(report_route.to_string()))?,
            ReplyTimeout::After(limit) => reports.recv_timeout(limit).await?,
        };
        match opened.body {
            Message::BankReply(BankReply::AccountOpened { account }) => Ok(account),
            other => Err(TradeError::ProtocolViolation(format!(
                "expected account number from bank, got {}",
                other.kind()
            ))),
        }
    }

    pub async fn buy(
        &mut self,
        seller: &str,
        goods: &str,
        confirmation: &dyn PriceConfirmation,
    ) -> Result<PurchaseOutcome> {
        let session = self.session.as_mut().ok_or(TradeError::NotConnected)?;
        session.engine.buy(seller, goods, confirmation).await
    }

    pub async fn buy_with_timeout(
        &mut self,
        seller: &str,
        goods: &str,
        confirmation: &dyn PriceConfirmation,
        timeout: ReplyTimeout,
    ) -> Result<PurchaseOutcome> {
        let session = self.session.as_mut().ok_or(TradeError::NotConnected)?;
        session
            .engine
            .buy_with_timeout(seller, goods, confirmation, timeout)
            .await
    }

    /// Goods other peers are known to offer.
    pub fn list(&self) -> Vec<PeerOffer> {
        self.state.lock().catalog.offers()
    }

    /// Goods this peer currently offers.
    pub fn offered(&self) -> Vec<Good> {
        self.state.lock().inventory.snapshot()
    }

    pub fn publish(&self) -> Result<usize> {
        if self.session.is_none() {
            return Err(TradeError::NotConnected);
        }
        Ok(self.broadcaster.publish_current(&self.state))
    }

    pub async fn balance(&self) -> Result<u64> {
        let account = self.account().ok_or(TradeError::NotConnected)?;
        let route = self.broker.temporary_queue();
        let mut replies = self.broker.consume(&route)?;

        let sent = self.broker.send(
            &Route::new(self.config.broker.bank_queue.clone()),
            Envelope::new(Message::Bank(BankCommand::Balance { account })).with_reply_to(route.clone()),
        );
        let reply = match sent {
            Ok(()) => match self.reply_timeout() {
                ReplyTimeout::Never => replies
                    .recv()
                    .await
                    .ok_or_else(|| TradeError::BrokerClosed(route.to_string())),
                ReplyTimeout::After(limit) => replies.recv_timeout(limit).await,
            },
            Err(e) => Err(e),
        };
        self.broker.delete_queue(&route);

        match reply?.body {
            Message::BankReply(BankReply::Balance { balance, .. }) => Ok(balance),
            other => Err(TradeError::ProtocolViolation(format!(
                "expected balance reply, got {}",
                other.kind()
            ))),
        }
    }

    /// Withdraws this peer's offer and stops its listeners.
    pub async fn disconnect(&mut self) -> Result<()> {
        let session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };

        self.broadcaster.withdraw();

        for listener in &session.listeners {
            listener.abort();
        }
        for listener in session.listeners {
            // Aborted tasks finish with a cancellation error.
            let _ = listener.await;
        }

        let pending = self.state.lock().ledger.len();
        if pending > 0 {
            tracing::warn!(peer = %self.identity, pending, "disconnecting with unsettled reservations");
        }

        self.broker.delete_queue(session.engine.reply_route());
        self.broker.delete_queue(&session.report_route);
        tracing::info!(peer = %self.identity, queue = %session.sale_queue, "disconnected");
        Ok(())
    }
}
