#![forbid(unsafe_code)]
//! Interactive MiniChain node.

use clap::Parser;
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Color as TableColor;
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use minichain::blockchain::Block;
use minichain::config::load_config;
use minichain::crypto::{address_from_hex, address_to_hex, short_hex, Address, KeyPair};
use minichain::node::Node;
use minichain::transaction::Transaction;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

const LOGO: &str = r#"
╔═══════════════════════════════════════════════╗
║   █▀▄▀█ █ █▄ █ █   █▀▀ █ █ ▄▀█ █ █▄ █         ║
║   █ ▀ █ █ █ ▀█ █   █▄▄ █▀█ █▀█ █ █ ▀█         ║
║        account-based proof-of-work node       ║
╚═══════════════════════════════════════════════╝
"#;

#[derive(Parser, Debug)]
#[command(name = "minichain-node", version, about = "Run an interactive MiniChain node")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "minichain.toml")]
    config: PathBuf,

    /// Override the peer listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Peer to dial on startup (repeatable)
    #[arg(long = "connect", value_name = "HOST:PORT")]
    connect: Vec<String>,

    /// Start mining immediately
    #[arg(long)]
    mine: bool,

    /// Wallet secret key as hex; a fresh key is generated when omitted
    #[arg(long, value_name = "HEX")]
    key: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Status,
    Address,
    Balance(Option<Address>),
    Send(Address, u64),
    Faucet(Address, u64),
    Treasury,
    Mine,
    Start,
    Stop,
    Chain,
    Block(u64),
    Mempool,
    Peers,
    Connect(String),
    Quit,
}

fn parse_amount(raw: Option<&str>) -> Result<u64, String> {
    let raw = raw.ok_or("missing amount")?;
    let amount: u64 = raw
        .parse()
        .map_err(|_| format!("'{}' is not a valid amount", raw))?;
    if amount == 0 {
        return Err("amount must be greater than zero".to_string());
    }
    Ok(amount)
}

fn parse_address(raw: Option<&str>) -> Result<Address, String> {
    let raw = raw.ok_or("missing address")?;
    address_from_hex(raw).map_err(|e| e.to_string())
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let name = parts.next().ok_or("empty command")?;

    let command = match name {
        "help" | "?" => Command::Help,
        "status" => Command::Status,
        "address" => Command::Address,
        "balance" => match parts.next() {
            Some(raw) => Command::Balance(Some(parse_address(Some(raw))?)),
            None => Command::Balance(None),
        },
        "send" => {
            let to = parse_address(parts.next())?;
            Command::Send(to, parse_amount(parts.next())?)
        }
        "faucet" => {
            let to = parse_address(parts.next())?;
            Command::Faucet(to, parse_amount(parts.next())?)
        }
        "treasury" => Command::Treasury,
        "mine" => Command::Mine,
        "start" => Command::Start,
        "stop" => Command::Stop,
        "chain" => Command::Chain,
        "block" => {
            let raw = parts.next().ok_or("missing block index")?;
            Command::Block(
                raw.parse()
                    .map_err(|_| format!("'{}' is not a block index", raw))?,
            )
        }
        "mempool" => Command::Mempool,
        "peers" => Command::Peers,
        "connect" => Command::Connect(parts.next().ok_or("missing host:port")?.to_string()),
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{}' (try 'help')", other)),
    };

    if parts.next().is_some() {
        return Err(format!("too many arguments for '{}'", name));
    }
    Ok(command)
}

fn print_help() {
    let commands = [
        ("status", "node status overview"),
        ("address", "show this node's wallet address"),
        ("balance [addr]", "balance of the wallet or of addr"),
        ("send <addr> <amount>", "transfer from the node wallet"),
        ("faucet <addr> <amount>", "transfer from the dev treasury"),
        ("treasury", "treasury address and funds"),
        ("mine", "mine a single block"),
        ("start | stop", "toggle continuous mining"),
        ("chain", "chain summary and recent blocks"),
        ("block <index>", "print a block as JSON"),
        ("mempool", "pending transactions"),
        ("peers", "connected peers"),
        ("connect <host:port>", "dial a peer"),
        ("quit", "shut the node down"),
    ];
    for (usage, description) in commands {
        println!("  {:<24} {}", usage.bright_cyan(), description);
    }
}

fn header_cell(title: &str) -> Cell {
    Cell::new(title)
        .add_attribute(Attribute::Bold)
        .fg(TableColor::Cyan)
}

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.iter().map(|h| header_cell(h)).collect::<Vec<_>>());
    table
}

fn format_timestamp(millis: u64) -> String {
    chrono::DateTime::from_timestamp_millis(millis as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "invalid".to_string())
}

fn block_json(block: &Block) -> serde_json::Value {
    let transactions: Vec<serde_json::Value> = block
        .transactions
        .iter()
        .map(|tx| match tx {
            Transaction::Coinbase(cb) => serde_json::json!({
                "type": "coinbase",
                "hash": tx.hash_str(),
                "beneficiary": address_to_hex(&cb.beneficiary),
                "amount": cb.amount,
                "height": cb.height,
            }),
            Transaction::Transfer(t) => serde_json::json!({
                "type": "transfer",
                "hash": tx.hash_str(),
                "sender": address_to_hex(&t.sender),
                "recipient": address_to_hex(&t.recipient),
                "amount": t.amount,
                "nonce": t.nonce,
            }),
        })
        .collect();

    serde_json::json!({
        "index": block.index(),
        "hash": hex::encode(block.hash()),
        "previous_hash": hex::encode(block.header.previous_hash),
        "timestamp": format_timestamp(block.header.timestamp),
        "miner": address_to_hex(&block.header.miner),
        "difficulty": block.header.difficulty,
        "nonce": block.header.nonce,
        "transactions": transactions,
    })
}

async fn print_chain(node: &Node) {
    let summary = node.chain_summary().await;
    println!("{} {}", "Height:".bold(), summary.height);
    println!("{} {}", "Tip:".bold(), hex::encode(summary.tip_hash));
    println!("{} {}", "Genesis:".bold(), hex::encode(summary.genesis_hash));
    println!("{} {} bits", "Difficulty:".bold(), summary.difficulty);
    println!(
        "{} {} transfers, {} accounts, {} coins in circulation",
        "Totals:".bold(),
        summary.transfer_count,
        summary.account_count,
        summary.total_supply
    );

    let blocks = node.blocks().await;
    let mut table = new_table(&["#", "Hash", "Miner", "Txs", "Time"]);
    for block in blocks.iter().rev().take(10) {
        table.add_row(vec![
            Cell::new(block.index()).fg(TableColor::White),
            Cell::new(short_hex(&block.hash())).fg(TableColor::Yellow),
            Cell::new(short_hex(&block.header.miner)),
            Cell::new(block.transactions.len()),
            Cell::new(format_timestamp(block.header.timestamp)).fg(TableColor::Grey),
        ]);
    }
    println!("{table}");
}

async fn print_mempool(node: &Node) {
    let pending = node.list_mempool().await;
    if pending.is_empty() {
        println!("{}", "Mempool is empty".dimmed());
        return;
    }
    let mut table = new_table(&["Hash", "From", "To", "Amount", "Nonce"]);
    for tx in pending.iter() {
        if let Some(t) = tx.as_transfer() {
            table.add_row(vec![
                Cell::new(short_hex(&tx.hash())).fg(TableColor::Yellow),
                Cell::new(short_hex(&t.sender)),
                Cell::new(short_hex(&t.recipient)),
                Cell::new(t.amount).fg(TableColor::Green),
                Cell::new(t.nonce),
            ]);
        }
    }
    println!("{table}");
}

fn print_peers(node: &Node) {
    let peers = node.list_peers();
    if peers.is_empty() {
        println!("{}", "No peers connected".dimmed());
        return;
    }
    let mut table = new_table(&["Address", "Listening on", "Direction"]);
    for peer in peers {
        table.add_row(vec![
            Cell::new(peer.address),
            Cell::new(
                peer.listen_address
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(if peer.outbound { "outbound" } else { "inbound" }),
        ]);
    }
    println!("{table}");
}

async fn print_status(node: &Node) {
    let summary = node.chain_summary().await;
    let balance = node.balance(&node.local_address()).await;
    let pending = node.list_mempool().await.len();
    let listen = node
        .listen_address()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());

    println!("{}", "═══ Node Status ═══".bold());
    println!("  {:<10} {}", "Listening:", listen.cyan());
    println!("  {:<10} {} coins", "Balance:", balance.to_string().green());
    println!("  {:<10} {}", "Peers:", node.list_peers().len().to_string().yellow());
    println!("  {:<10} {} ({})", "Height:", summary.height.to_string().blue(), short_hex(&summary.tip_hash));
    println!("  {:<10} {} pending", "Mempool:", pending.to_string().dimmed());
    println!(
        "  {:<10} {}",
        "Mining:",
        if node.is_mining() { "on".green() } else { "off".dimmed() }
    );
}

async fn print_treasury(node: &Node) {
    let treasury = node.params().treasury_address;
    let account = node.state().await.account(&treasury).copied().unwrap_or_default();

    println!("{}", "═══ Treasury ═══".bold());
    println!("  {:<10} {}", "Address:", address_to_hex(&treasury).cyan());
    println!("  {:<10} {} coins", "Balance:", account.balance.to_string().green());
    println!("  {:<10} {} transfers sent", "Nonce:", account.nonce);
}

/// Runs one command. Returns `false` when the shell should exit.
async fn execute(node: &Node, command: Command) -> bool {
    match command {
        Command::Help => print_help(),
        Command::Status => print_status(node).await,
        Command::Treasury => print_treasury(node).await,
        Command::Address => println!("{}", address_to_hex(&node.local_address()).bright_green()),
        Command::Balance(address) => {
            let address = address.unwrap_or_else(|| node.local_address());
            let balance = node.balance(&address).await;
            let nonce = node.nonce(&address).await;
            println!(
                "{} {} (nonce {})",
                short_hex(&address).cyan(),
                balance.to_string().bright_green().bold(),
                nonce
            );
        }
        Command::Send(to, amount) => match node.transfer(to, amount).await {
            Ok(hash) => println!("{} {}", "✓ Submitted".green(), hex::encode(hash)),
            Err(e) => println!("{} {}", "✗".red(), e),
        },
        Command::Faucet(to, amount) => match node.faucet(to, amount).await {
            Ok(hash) => println!("{} {}", "✓ Faucet transfer".green(), hex::encode(hash)),
            Err(e) => println!("{} {}", "✗".red(), e),
        },
        Command::Mine => {
            println!("{}", "⛏  Mining...".yellow());
            match node.mine_once().await {
                Ok(block) => println!(
                    "{} block #{} {} ({} txs)",
                    "✓ Mined".green(),
                    block.index(),
                    short_hex(&block.hash()),
                    block.transactions.len()
                ),
                Err(e) => println!("{} {}", "✗".red(), e),
            }
        }
        Command::Start => {
            if node.start_mining() {
                println!("{}", "Mining started".green());
            } else {
                println!("{}", "Already mining".yellow());
            }
        }
        Command::Stop => {
            node.stop_mining();
            println!("{}", "Mining stopped".yellow());
        }
        Command::Chain => print_chain(node).await,
        Command::Block(index) => match node.block(index).await {
            Some(block) => match serde_json::to_string_pretty(&block_json(&block)) {
                Ok(json) => println!("{}", json),
                Err(e) => println!("{} {}", "✗".red(), e),
            },
            None => println!("{} no block at index {}", "✗".red(), index),
        },
        Command::Mempool => print_mempool(node).await,
        Command::Peers => print_peers(node),
        Command::Connect(address) => match node.connect_to_peer(&address).await {
            Ok(peer) => println!("{} {}", "✓ Connected to".green(), peer),
            Err(e) => println!("{} {}", "✗".red(), e),
        },
        Command::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(&args.config)?;
    if let Some(port) = args.port {
        config.network.p2p_port = port;
    }
    config.network.bootstrap_peers.extend(args.connect);
    if args.mine {
        config.miner.enabled = true;
    }

    let wallet = match &args.key {
        Some(secret) => KeyPair::from_secret_hex(secret)?,
        None => KeyPair::generate(),
    };

    let node = Node::new(&config, wallet)?;
    let listen = node.start().await?;
    if config.miner.enabled {
        node.start_mining();
    }

    println!("{}", LOGO.bright_magenta());
    println!("{} {}", "Network:".bold(), config.network.network_id);
    println!("{} {}", "Listening:".bold(), listen);
    println!(
        "{} {}",
        "Wallet:".bold(),
        address_to_hex(&node.local_address()).bright_green()
    );
    if args.key.is_none() {
        println!(
            "{} {}",
            "Secret key:".bold(),
            node.wallet().secret_key_hex().dimmed()
        );
    }
    println!("Type {} for a list of commands.", "help".bright_cyan());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", "minichain>".bright_blue().bold());
        std::io::Write::flush(&mut std::io::stdout())?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(command) => {
                if !execute(&node, command).await {
                    break;
                }
            }
            Err(e) => println!("{} {}", "✗".red(), e),
        }
    }

    node.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let address = hex::encode([7u8; 32]);
        assert_eq!(parse_command("help"), Ok(Command::Help));
        assert_eq!(parse_command("balance"), Ok(Command::Balance(None)));
        assert_eq!(
            parse_command(&format!("send {} 100", address)),
            Ok(Command::Send([7u8; 32], 100))
        );
        assert_eq!(parse_command("block 3"), Ok(Command::Block(3)));
        assert_eq!(parse_command("status"), Ok(Command::Status));
        assert_eq!(parse_command("treasury"), Ok(Command::Treasury));
        assert_eq!(
            parse_command("connect 127.0.0.1:9000"),
            Ok(Command::Connect("127.0.0.1:9000".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        let address = hex::encode([7u8; 32]);
        assert!(parse_command("send").is_err());
        assert!(parse_command(&format!("send {} 0", address)).is_err());
        assert!(parse_command(&format!("send {} ten", address)).is_err());
        assert!(parse_command("send abc 5").is_err());
        assert!(parse_command("block x").is_err());
        assert!(parse_command("mine now").is_err());
        assert!(parse_command("treasury all").is_err());
        assert!(parse_command("frobnicate").is_err());
    }
}
