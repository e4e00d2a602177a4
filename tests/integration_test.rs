use peer_market::{
    config::AppConfig,
    error::{Result, TradeError},
    model::{
        Good, Message, PaymentOrder, SaleConfirmation, SaleRequest, INSUFFICIENT_FUNDS, INSUFFICIENT_PAYMENT,
        NO_SUCH_GOODS,
    },
    negotiation::{AlwaysConfirm, ListedPricesOnly, PurchaseOutcome, ReplyTimeout},
    Bank, Broker, Peer,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};

struct Market {
    broker: Broker,
    bank: Bank,
    config: AppConfig,
}

fn setup_market(initial_balance: u64) -> Result<Market> {
    let mut config = AppConfig::default();
    config.bank.initial_balance = initial_balance;
    // Tests never rely on the unbounded default; a stuck reply fails the test instead.
    config.negotiation.reply_timeout_ms = Some(5_000);

    let broker = Broker::new(config.broker.topic_capacity);
    let bank = Bank::new(broker.clone(), &config.broker.bank_queue, config.bank.initial_balance);
    bank.spawn()?;

    Ok(Market { broker, bank, config })
}

impl Market {
    fn peer(&self, name: &str, goods: Vec<Good>) -> Peer {
        Peer::new(name, goods, self.broker.clone(), self.config.clone())
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

fn lists(peer: &Peer, seller: &str, goods: &str) -> bool {
    peer.state()
        .lock()
        .catalog
        .prices_of(seller, goods)
        .map_or(false, |prices| !prices.is_empty())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_purchase_with_listed_price_succeeds() -> Result<()> {
    let market = setup_market(1_000)?;
    let mut buyer = market.peer("bob", Vec::new());
    let mut seller = market.peer("alice", vec![Good::new("ABCD", 100)]);

    let buyer_account = buyer.connect().await?;
    let seller_account = seller.connect().await?;
    eventually("alice's offer", || lists(&buyer, "alice", "ABCD")).await;

    let outcome = buyer.buy("alice", "ABCD", &ListedPricesOnly).await?;

    assert_eq!(
        outcome,
        PurchaseOutcome::Success {
            seller_account,
            goods: "ABCD".to_string(),
            price: 100,
        }
    );
    assert_eq!(market.bank.balance(buyer_account)?, 900);
    assert_eq!(market.bank.balance(seller_account)?, 1_100);
    {
        let state = seller.state().lock();
        assert!(state.inventory.is_empty());
        assert!(state.ledger.is_empty());
    }
    eventually("alice's withdrawn goods", || !lists(&buyer, "alice", "ABCD")).await;

    assert_eq!(buyer.balance().await?, 900);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_goods_is_denied_without_reservation() -> Result<()> {
    let market = setup_market(1_000)?;
    let mut buyer = market.peer("bob", Vec::new());
    let mut seller = market.peer("alice", vec![Good::new("ABCD", 100)]);
    buyer.connect().await?;
    seller.connect().await?;

    let mut offers = market.broker.subscribe(&market.config.broker.offer_topic);
    let outcome = buyer.buy("alice", "ZZZZ", &AlwaysConfirm).await?;

    assert_eq!(
        outcome,
        PurchaseOutcome::Denied {
            reason: NO_SUCH_GOODS.to_string()
        }
    );
    assert!(seller.state().lock().ledger.is_empty());
    assert!(offers.try_recv().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_buyers_only_one_wins() -> Result<()> {
    let market = setup_market(1_000)?;
    let mut seller = market.peer("alice", vec![Good::new("ABCD", 100)]);
    let mut bob = market.peer("bob", Vec::new());
    let mut carol = market.peer("carol", Vec::new());
    seller.connect().await?;
    bob.connect().await?;
    carol.connect().await?;

    let (first, second) = tokio::join!(
        bob.buy("alice", "ABCD", &AlwaysConfirm),
        carol.buy("alice", "ABCD", &AlwaysConfirm),
    );
    let outcomes = [first?, second?];

    let wins = outcomes
        .iter()
        .filter(|o| matches!(o, PurchaseOutcome::Success { .. }))
        .count();
    let denials = outcomes
        .iter()
        .filter(|o| matches!(o, PurchaseOutcome::Denied { reason } if reason == NO_SUCH_GOODS))
        .count();
    assert_eq!((wins, denials), (1, 1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_insufficient_funds_restocks_and_is_not_confirmed_twice() -> Result<()> {
    let market = setup_market(50)?;
    let mut buyer = market.peer("bob", Vec::new());
    let mut seller = market.peer("alice", vec![Good::new("ABCD", 100)]);
    let buyer_account = buyer.connect().await?;
    let seller_account = seller.connect().await?;

    let outcome = buyer.buy("alice", "ABCD", &AlwaysConfirm).await?;
    assert_eq!(
        outcome,
        PurchaseOutcome::Denied {
            reason: INSUFFICIENT_FUNDS.to_string()
        }
    );
    assert!(seller.state().lock().inventory.contains("ABCD"));

    // A repeated report for the same buyer finds no reservation and is dropped.
    market.bank.execute(&PaymentOrder {
        sender: "bob".to_string(),
        receiver_account: seller_account,
        amount: 100,
    })?;
    sleep(Duration::from_millis(50)).await;
    {
        let state = seller.state().lock();
        assert!(state.ledger.is_empty());
        assert_eq!(state.inventory.snapshot(), vec![Good::new("ABCD", 100)]);
    }
    assert_eq!(market.bank.balance(buyer_account)?, 50);

    // The goods are back on sale, so a retry reaches the bank again.
    let outcome = buyer
        .buy_with_timeout(
            "alice",
            "ABCD",
            &AlwaysConfirm,
            ReplyTimeout::After(Duration::from_secs(5)),
        )
        .await?;
    assert_eq!(
        outcome,
        PurchaseOutcome::Denied {
            reason: INSUFFICIENT_FUNDS.to_string()
        }
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refund_does_not_settle_the_refunded_peers_own_sale() -> Result<()> {
    let market = setup_market(1_000)?;
    let mut alice = market.peer("alice", vec![Good::new("ABCD", 100)]);
    let mut bob = market.peer("bob", vec![Good::new("WXYZ", 30)]);
    let alice_account = alice.connect().await?;
    let bob_account = bob.connect().await?;

    // Each peer holds an unpaid reservation for the other.
    let alice_route = market.broker.temporary_queue();
    let mut alice_replies = market.broker.consume(&alice_route)?;
    bob.state().lock().reserve(
        &SaleRequest {
            buyer: "alice".to_string(),
            goods_name: "WXYZ".to_string(),
            buyer_account: alice_account,
        },
        alice_route,
    )?;
    let bob_route = market.broker.temporary_queue();
    let mut bob_replies = market.broker.consume(&bob_route)?;
    alice.state().lock().reserve(
        &SaleRequest {
            buyer: "bob".to_string(),
            goods_name: "ABCD".to_string(),
            buyer_account: bob_account,
        },
        bob_route,
    )?;

    // bob underpays; alice refunds the 40 to bob's account.
    market.bank.execute(&PaymentOrder {
        sender: "bob".to_string(),
        receiver_account: alice_account,
        amount: 40,
    })?;

    let denial = bob_replies.recv_timeout(Duration::from_secs(5)).await?;
    assert_eq!(
        denial.body,
        Message::SaleConfirmation(SaleConfirmation::Deny {
            goods_name: "ABCD".to_string(),
            reason: INSUFFICIENT_PAYMENT.to_string(),
        })
    );
    eventually("bob's refund", || {
        market.bank.balance(bob_account).map_or(false, |balance| balance == 1_000)
    })
    .await;
    sleep(Duration::from_millis(50)).await;

    assert!(alice_replies.try_recv().is_none());
    assert!(bob.state().lock().ledger.find_by_account(alice_account).is_ok());

    // alice's own payment still settles her purchase from bob.
    market.bank.execute(&PaymentOrder {
        sender: "alice".to_string(),
        receiver_account: bob_account,
        amount: 30,
    })?;
    let confirmation = alice_replies.recv_timeout(Duration::from_secs(5)).await?;
    assert_eq!(
        confirmation.body,
        Message::SaleConfirmation(SaleConfirmation::Accept {
            goods_name: "WXYZ".to_string(),
        })
    );
    assert_eq!(market.bank.balance(alice_account)?, 970);
    assert_eq!(market.bank.balance(bob_account)?, 1_030);
    assert!(alice.state().lock().inventory.contains("ABCD"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_name_connect_leaves_first_peer_trading() -> Result<()> {
    let market = setup_market(1_000)?;
    let mut seller = market.peer("alice", vec![Good::new("ABCD", 100)]);
    let mut duplicate = market.peer("alice", vec![Good::new("EFGH", 5)]);
    let mut buyer = market.peer("bob", Vec::new());
    let seller_account = seller.connect().await?;
    buyer.connect().await?;

    let err = duplicate.connect().await.unwrap_err();
    assert!(matches!(err, TradeError::QueueInUse(_)));
    assert!(!duplicate.is_connected());

    let outcome = buyer.buy("alice", "ABCD", &AlwaysConfirm).await?;

    assert_eq!(
        outcome,
        PurchaseOutcome::Success {
            seller_account,
            goods: "ABCD".to_string(),
            price: 100,
        }
    );
    assert!(seller.state().lock().ledger.is_empty());
    assert_eq!(market.bank.balance(seller_account)?, 1_100);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_seller_does_not_stall_listeners() -> Result<()> {
    let market = setup_market(1_000)?;
    let mut buyer = market.peer("bob", vec![Good::new("WXYZ", 10)]);
    let mut other_buyer = market.peer("carol", Vec::new());
    buyer.connect().await?;
    other_buyer.connect().await?;

    let purchase = buyer.buy_with_timeout(
        "ghost",
        "ABCD",
        &AlwaysConfirm,
        ReplyTimeout::After(Duration::from_millis(300)),
    );
    let sale = async {
        sleep(Duration::from_millis(50)).await;
        other_buyer.buy("bob", "WXYZ", &AlwaysConfirm).await
    };
    let (stalled, sold) = tokio::join!(purchase, sale);

    assert!(matches!(stalled, Err(TradeError::ReplyTimeout(_))));
    assert!(matches!(sold?, PurchaseOutcome::Success { price: 10, .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_goods_are_never_lost_or_duplicated() -> Result<()> {
    let market = setup_market(10_000)?;
    let stock: Vec<Good> = ["AAAA", "BBBB", "CCCC", "DDDD"]
        .iter()
        .enumerate()
        .map(|(i, name)| Good::new(*name, 100 * (i as u64 + 1)))
        .collect();
    let mut seller = market.peer("alice", stock.clone());
    seller.connect().await?;

    let mut buyers = Vec::new();
    for name in ["bob", "carol", "dave"] {
        let mut buyer = market.peer(name, Vec::new());
        buyer.connect().await?;
        buyers.push(buyer);
    }

    let mut tasks = Vec::new();
    for (i, mut buyer) in buyers.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            let mut bought = Vec::new();
            for goods in ["AAAA", "BBBB", "CCCC", "DDDD"].iter().cycle().skip(i).take(4) {
                if let Ok(PurchaseOutcome::Success { goods, .. }) = buyer.buy("alice", goods, &AlwaysConfirm).await {
                    bought.push(goods);
                }
            }
            bought
        }));
    }

    let mut sold = Vec::new();
    for task in tasks {
        sold.extend(task.await.expect("buyer task panicked"));
    }

    let sold_names: BTreeSet<String> = sold.iter().cloned().collect();
    assert_eq!(sold_names.len(), sold.len(), "a goods name was sold twice");

    let state = seller.state().lock();
    let remaining: BTreeSet<String> = state.owned_goods().into_iter().map(|g| g.name).collect();
    assert!(remaining.is_disjoint(&sold_names));
    let all: BTreeSet<String> = stock.into_iter().map(|g| g.name).collect();
    assert_eq!(remaining.union(&sold_names).cloned().collect::<BTreeSet<_>>(), all);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_withdraws_offer() -> Result<()> {
    let market = setup_market(1_000)?;
    let mut buyer = market.peer("bob", Vec::new());
    let mut seller = market.peer("alice", vec![Good::new("ABCD", 100)]);
    buyer.connect().await?;
    seller.connect().await?;
    eventually("alice's offer", || lists(&buyer, "alice", "ABCD")).await;

    seller.disconnect().await?;

    eventually("alice's withdrawal", || buyer.list().is_empty()).await;
    assert!(!seller.is_connected());
    assert!(matches!(seller.publish(), Err(TradeError::NotConnected)));
    Ok(())
}

#[tokio::test]
async fn test_buy_requires_connection() {
    let market = setup_market(1_000).unwrap();
    let mut buyer = market.peer("bob", Vec::new());

    let err = buyer.buy("alice", "ABCD", &AlwaysConfirm).await.unwrap_err();
    assert!(matches!(err, TradeError::NotConnected));
    tokio_test::assert_err!(buyer.balance().await);
}
