//! Real nodes talking over loopback TCP.

use minichain::config::Config;
use minichain::crypto::KeyPair;
use minichain::miner::mine_block;
use minichain::network::{Hello, Message, PROTOCOL_VERSION};
use minichain::node::Node;
use minichain::transaction::{Transaction, TransferTx};
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn test_config(network_id: &str) -> Config {
    let mut config = Config::default();
    config.network.listen_host = "127.0.0.1".to_string();
    config.network.p2p_port = 0;
    config.network.network_id = network_id.to_string();
    config.chain.difficulty = 8;
    config
}

async fn start_node(network_id: &str) -> Node {
    let node = Node::new(&test_config(network_id), KeyPair::generate()).unwrap();
    node.start().await.unwrap();
    node
}

/// Polls `$condition` (which may `.await`) until it holds.
macro_rules! wait_until {
    ($condition:expr) => {
        while !($condition) {
            sleep(Duration::from_millis(20)).await;
        }
    };
}

fn handshaked(node: &Node) -> bool {
    let peers = node.list_peers();
    !peers.is_empty() && peers.iter().all(|p| p.listen_address.is_some())
}

async fn connect(from: &Node, to: &Node) {
    let address = to.listen_address().unwrap().to_string();
    from.connect_to_peer(&address).await.unwrap();
    wait_until!(handshaked(from) && handshaked(to));
}

#[tokio::test]
async fn test_new_node_syncs_existing_chain() {
    timeout(TEST_TIMEOUT, async {
        let a = start_node("sync-test").await;
        a.mine_once().await.unwrap();
        a.mine_once().await.unwrap();

        let b = start_node("sync-test").await;
        connect(&b, &a).await;

        wait_until!(b.height().await == 2);
        assert_eq!(b.chain_summary().await.tip_hash, a.chain_summary().await.tip_hash);
        assert_eq!(b.state().await, a.state().await);

        a.shutdown();
        b.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_transactions_and_blocks_propagate() {
    timeout(TEST_TIMEOUT, async {
        let a = start_node("relay-test").await;
        let b = start_node("relay-test").await;
        connect(&b, &a).await;

        let recipient = KeyPair::generate().address();
        let hash = b.faucet(recipient, 75).await.unwrap();
        wait_until!(a.list_mempool().await.iter().any(|tx| tx.hash() == hash));

        let block = a.mine_once().await.unwrap();
        assert_eq!(block.transactions.len(), 2);

        wait_until!(b.height().await == 1);
        assert_eq!(b.balance(&recipient).await, 75);
        assert_eq!(b.balance(&a.beneficiary()).await, a.params().mining_reward);
        assert!(b.list_mempool().await.is_empty());

        a.shutdown();
        b.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_tie_keeps_local_chain_then_longer_wins() {
    timeout(TEST_TIMEOUT, async {
        let a = start_node("fork-test").await;
        let b = start_node("fork-test").await;

        // Competing block one on each side, b's carrying a transfer.
        let recipient = KeyPair::generate().address();
        let transfer = b.faucet(recipient, 40).await.unwrap();
        a.mine_once().await.unwrap();
        let b_block = b.mine_once().await.unwrap();
        assert_eq!(b.balance(&recipient).await, 40);

        connect(&b, &a).await;
        // Give the exchanged chains time to be considered and refused.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(b.chain_summary().await.tip_hash, b_block.hash());
        assert_ne!(a.chain_summary().await.tip_hash, b_block.hash());

        let a_tip = a.mine_once().await.unwrap();
        wait_until!(b.chain_summary().await.tip_hash == a_tip.hash());

        assert_eq!(b.height().await, 2);
        assert_eq!(b.state().await, a.state().await);
        assert_eq!(b.balance(&recipient).await, 0);
        assert!(b.list_mempool().await.iter().any(|tx| tx.hash() == transfer));

        a.shutdown();
        b.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_foreign_network_is_refused() {
    timeout(TEST_TIMEOUT, async {
        let a = start_node("home-net").await;
        let stranger = start_node("other-net").await;

        let address = a.listen_address().unwrap().to_string();
        stranger.connect_to_peer(&address).await.unwrap();

        wait_until!(a.list_peers().is_empty() && stranger.list_peers().is_empty());
        assert_eq!(a.height().await, 0);

        a.shutdown();
        stranger.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_background_miner_starts_and_stops() {
    timeout(TEST_TIMEOUT, async {
        let a = start_node("miner-test").await;
        assert!(a.start_mining());
        assert!(!a.start_mining());
        assert!(a.is_mining());

        wait_until!(a.height().await >= 2);
        a.stop_mining();
        assert!(!a.is_mining());

        let summary = a.chain_summary().await;
        assert!(summary.total_supply >= a.params().treasury_balance as u128 + 2 * 50);

        a.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_rejected_copy_does_not_shadow_genuine_objects() {
    timeout(TEST_TIMEOUT, async {
        let config = test_config("shadow-test");
        let a = Node::new(&config, KeyPair::generate()).unwrap();
        let address = a.start().await.unwrap();

        // A bare connection that speaks the wire protocol directly.
        let mut stream = TcpStream::connect(address).await.unwrap();
        Message::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            network_id: "shadow-test".to_string(),
            genesis_hash: a.chain_summary().await.genesis_hash,
            height: 0,
            listen_port: 0,
        })
        .write_to(&mut stream)
        .await
        .unwrap();

        let treasury = config.faucet_keypair().unwrap();
        let transfer = TransferTx::create(&treasury, KeyPair::generate().address(), 30, 1).unwrap();
        let mut forged_transfer = transfer.clone();
        forged_transfer.signature[0] ^= 0xff;
        let genuine: Transaction = transfer.into();
        let forged: Transaction = forged_transfer.into();

        Message::NewTransaction(forged.clone()).write_to(&mut stream).await.unwrap();
        Message::NewTransaction(genuine.clone()).write_to(&mut stream).await.unwrap();
        wait_until!(a.list_mempool().await.iter().any(|tx| tx == &genuine));
        assert_eq!(a.list_mempool().await.len(), 1);

        // Same header, tampered body: the block hash matches the genuine one.
        let genesis = a.block(0).await.unwrap();
        let block = mine_block(
            &genesis,
            vec![genuine],
            KeyPair::generate().address(),
            a.params(),
            &AtomicBool::new(false),
        )
        .unwrap();
        let mut tampered = block.clone();
        tampered.transactions[1] = forged;
        assert_eq!(tampered.hash(), block.hash());

        Message::NewBlock(tampered).write_to(&mut stream).await.unwrap();
        Message::NewBlock(block.clone()).write_to(&mut stream).await.unwrap();
        wait_until!(a.height().await == 1);
        assert_eq!(a.chain_summary().await.tip_hash, block.hash());
        assert!(a.list_mempool().await.is_empty());

        a.shutdown();
    })
    .await
    .expect("test timed out");
}
