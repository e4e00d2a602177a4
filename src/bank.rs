//! In-process bank.
//!
//! Consumes commands from the bank queue: opens accounts, answers balance
//! queries and executes payment orders. Every transfer attempt is reported
//! to the receiving account holder, who decides what the money was for.

use crate::{
    broker::{Broker, QueueReceiver},
    error::{Result, TradeError},
    model::{AccountNumber, BankCommand, BankReply, BankReport, Envelope, Message, PaymentOrder, Route},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Account {
    balance: u64,
    report_route: Route,
}

#[derive(Debug, Default)]
struct Accounts {
    by_number: HashMap<AccountNumber, Account>,
    by_holder: HashMap<String, AccountNumber>,
    next_number: AccountNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    InsufficientFunds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    Payment,
    Refund,
}

#[derive(Clone)]
pub struct Bank {
    broker: Broker,
    queue: Route,
    initial_balance: u64,
    accounts: Arc<Mutex<Accounts>>,
}

impl Bank {
    pub fn new(broker: Broker, queue_name: &str, initial_balance: u64) -> Self {
        let queue = broker.queue(queue_name);
        Self {
            broker,
            queue,
            initial_balance,
            accounts: Arc::new(Mutex::new(Accounts {
                next_number: 1,
                ..Accounts::default()
            })),
        }
    }

    pub fn queue(&self) -> &Route {
        &self.queue
    }

    /// Starts consuming the bank queue on its own task.
    pub fn spawn(&self) -> Result<tokio::task::JoinHandle<()>> {
        let receiver = self.broker.consume(&self.queue)?;
        let bank = self.clone();
        Ok(tokio::spawn(bank.run(receiver)))
    }

    async fn run(self, mut receiver: QueueReceiver) {
        while let Some(envelope) = receiver.recv().await {
            let description = envelope.describe();
            if let Err(e) = self.handle(envelope) {
                tracing::warn!(message = %description, "bank command failed: {}", e);
            }
        }
    }

    pub fn handle(&self, envelope: Envelope) -> Result<()> {
        let command = match envelope.body {
            Message::Bank(command) => command,
            other => {
                return Err(TradeError::ProtocolViolation(format!(
                    "expected bank command, got {}",
                    other.kind()
                )))
            }
        };

        match command {
            BankCommand::OpenAccount { client } => {
                let reply_to = envelope
                    .reply_to
                    .ok_or_else(|| TradeError::ProtocolViolation("account request without reply route".to_string()))?;
                let account = self.open_account(&client, reply_to.clone());
                self.broker.send(
                    &reply_to,
                    Envelope::new(Message::BankReply(BankReply::AccountOpened { account })),
                )
            }
            BankCommand::Balance { account } => {
                let reply_to = envelope
                    .reply_to
                    .ok_or_else(|| TradeError::ProtocolViolation("balance query without reply route".to_string()))?;
                let balance = self.balance(account)?;
                self.broker.send(
                    &reply_to,
                    Envelope::new(Message::BankReply(BankReply::Balance { account, balance })),
                )
            }
            BankCommand::Pay(order) => self.execute(&order).map(|_| ()),
            BankCommand::Refund(order) => self.refund(&order).map(|_| ()),
        }
    }

    /// Opens an account, or re-binds the report route of an existing holder.
    pub fn open_account(&self, client: &str, report_route: Route) -> AccountNumber {
        let mut accounts = self.accounts.lock();

        let existing = accounts.by_holder.get(client).copied();
        if let Some(number) = existing {
            if let Some(account) = accounts.by_number.get_mut(&number) {
                account.report_route = report_route;
            }
            return number;
        }

        let number = accounts.next_number;
        accounts.next_number += 1;
        accounts.by_holder.insert(client.to_string(), number);
        accounts.by_number.insert(
            number,
            Account {
                balance: self.initial_balance,
                report_route,
            },
        );
        tracing::info!(client, account = number, "opened bank account");
        number
    }

    pub fn balance(&self, account: AccountNumber) -> Result<u64> {
        self.accounts
            .lock()
            .by_number
            .get(&account)
            .map(|a| a.balance)
            .ok_or(TradeError::UnknownAccount(account))
    }

    /// Moves money if the sender can cover it and reports the attempt to the
    /// receiver either way.
    pub fn execute(&self, order: &PaymentOrder) -> Result<TransferStatus> {
        self.transfer(order, TransferKind::Payment)
    }

    /// Returns money to a payer. The receiver is told it was a refund, so it
    /// is never mistaken for a payment towards one of its own sales. A refund
    /// the sender cannot cover is not reported.
    pub fn refund(&self, order: &PaymentOrder) -> Result<TransferStatus> {
        self.transfer(order, TransferKind::Refund)
    }

    fn transfer(&self, order: &PaymentOrder, kind: TransferKind) -> Result<TransferStatus> {
        let (status, sender_account, report_route) = {
            let mut accounts = self.accounts.lock();
            let sender_account = *accounts.by_holder.get(&order.sender).ok_or_else(|| {
                TradeError::ProtocolViolation(format!("payment order from unknown client {}", order.sender))
            })?;
            let report_route = accounts
                .by_number
                .get(&order.receiver_account)
                .map(|a| a.report_route.clone())
                .ok_or(TradeError::UnknownAccount(order.receiver_account))?;

            let sender_balance = accounts
                .by_number
                .get(&sender_account)
                .map(|a| a.balance)
                .unwrap_or(0);

            let status = if sender_balance >= order.amount {
                if let Some(sender) = accounts.by_number.get_mut(&sender_account) {
                    sender.balance -= order.amount;
                }
                if let Some(receiver) = accounts.by_number.get_mut(&order.receiver_account) {
                    receiver.balance += order.amount;
                }
                TransferStatus::Completed
            } else {
                TransferStatus::InsufficientFunds
            };
            (status, sender_account, report_route)
        };

        tracing::info!(
            sender = %order.sender,
            receiver = order.receiver_account,
            amount = order.amount,
            ?kind,
            ?status,
            "processed transfer"
        );

        let amount = order.amount;
        let report = match (kind, status) {
            (TransferKind::Payment, TransferStatus::Completed) => BankReport::Received {
                amount,
                sender_account,
            },
            (TransferKind::Payment, TransferStatus::InsufficientFunds) => BankReport::InsufficientFunds {
                amount,
                sender_account,
            },
            (TransferKind::Refund, TransferStatus::Completed) => BankReport::Refunded {
                amount,
                sender_account,
            },
            (TransferKind::Refund, TransferStatus::InsufficientFunds) => {
                tracing::warn!(sender = %order.sender, amount, "refund not covered by sender");
                return Ok(status);
            }
        };
        self.broker
            .send(&report_route, Envelope::new(Message::BankReport(report)))?;

        Ok(status)
    }
}
