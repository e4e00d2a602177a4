use anyhow::Context;
use clap::Parser;
use peer_market::{
    config::{create_default_config_file, AppConfig},
    logging::{init_logging, LogFormat},
    negotiation::{PriceConfirmation, PurchaseOutcome},
    Bank, Broker, Peer, TradeError,
};
use std::io::{BufRead, Write};

#[derive(Parser)]
#[command(name = "market")]
#[command(about = "Trade goods with other peers through a shared broker and bank")]
struct Args {
    /// Name this peer trades under.
    #[arg(short, long)]
    name: Option<String>,

    /// Other peers to run alongside in this process, comma separated.
    #[arg(short, long, value_delimiter = ',', default_value = "alice,bob")]
    peers: Vec<String>,

    #[arg(short, long)]
    config: Option<String>,

    /// Write a default config file to the given path and exit.
    #[arg(long)]
    init_config: Option<String>,
}

/// Reads one line from stdin without stalling the runtime's other tasks.
fn read_line(prompt: &str) -> Option<String> {
    tokio::task::block_in_place(|| {
        print!("{}", prompt);
        std::io::stdout().flush().ok()?;
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    })
}

struct StdinConfirmation;

impl PriceConfirmation for StdinConfirmation {
    fn confirm_price(&self, seller: &str, goods: &str, listed: &[u64], offered: u64) -> bool {
        println!(
            "Seller \"{}\" offers \"{}\" for previously unknown price ${} (listed: {:?})",
            seller, goods, offered, listed
        );
        matches!(
            read_line("Do you wish to continue? (y/N): ").as_deref(),
            Some("y") | Some("Y")
        )
    }
}

fn print_commands() {
    println!("\nAvailable commands (type and press enter):");
    println!(" l - list available goods");
    println!(" p - publish list of offered goods");
    println!(" b - buy goods");
    println!(" i - get account balance");
    println!(" q - quit");
}

async fn buy(peer: &mut Peer) {
    let Some(seller) = read_line("Enter seller name: ") else { return };
    let Some(goods) = read_line("Enter goods name: ") else { return };

    match peer.buy(&seller, &goods, &StdinConfirmation).await {
        Ok(PurchaseOutcome::Success {
            seller_account,
            goods,
            price,
        }) => println!("Sale {}[{}]:{}:{} SUCCESSFUL", seller, seller_account, goods, price),
        Ok(PurchaseOutcome::Denied { reason }) => println!("Sale {}:{} FAILED - {}", seller, goods, reason),
        Ok(PurchaseOutcome::UnknownResponse) => println!("Seller responded with a message of unknown type"),
        Err(TradeError::StaleCacheMismatch { .. }) => println!("Transaction declined."),
        Err(e) => println!("Purchase failed: {}", e),
    }
}

fn list(peer: &Peer) {
    println!("Available goods (name: price):");
    for offer in peer.list() {
        println!("From {}", offer.peer);
        for good in offer.goods {
            println!("  {}", good);
        }
    }
    println!("Offered by me:");
    for good in peer.offered() {
        println!("  {}", good);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.init_config {
        create_default_config_file(path)?;
        println!("Wrote default config to {}", path);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => AppConfig::load_with_env_overrides(path)?,
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    if let Some(name) = &args.name {
        config.peer.name = Some(name.clone());
    }
    config.validate()?;

    init_logging(&config.logging.level, LogFormat::from(&config.logging));

    let name = config
        .peer
        .name
        .clone()
        .context("a peer name is required (--name or [peer] name)")?;

    let broker = Broker::new(config.broker.topic_capacity);
    let bank = Bank::new(broker.clone(), &config.broker.bank_queue, config.bank.initial_balance);
    let bank_task = bank.spawn()?;

    let mut me = Peer::with_random_goods(name.clone(), broker.clone(), config.clone());
    me.connect().await?;

    let mut others = Vec::new();
    for other in args.peers.iter().filter(|p| !p.is_empty() && **p != name) {
        let mut peer = Peer::with_random_goods(other.clone(), broker.clone(), config.clone());
        peer.connect().await?;
        others.push(peer);
    }
    // Peers that connected before us never saw our offer, and we never saw theirs.
    me.publish()?;
    for peer in &others {
        peer.publish()?;
    }

    println!("Account number: {}", me.account().unwrap_or_default());

    loop {
        print_commands();
        let Some(command) = read_line("> ") else { break };
        match command.chars().next() {
            Some('q') => break,
            Some('b') => buy(&mut me).await,
            Some('l') => list(&me),
            Some('p') => {
                me.publish()?;
                println!("List of offers published");
            }
            Some('i') => match me.balance().await {
                Ok(balance) => println!(
                    "Current account [{}] balance: {}",
                    me.account().unwrap_or_default(),
                    balance
                ),
                Err(e) => println!("Balance query failed: {}", e),
            },
            _ => {}
        }
    }

    me.disconnect().await?;
    for peer in &mut others {
        peer.disconnect().await?;
    }
    bank_task.abort();

    println!("Goodbye");
    Ok(())
}
