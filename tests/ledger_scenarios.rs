//! End-to-end ledger scenarios: transfers, rewards, fork choice and re-validation,
//! driven through the public chain, mempool and miner APIs.

use minichain::blockchain::{validate_chain, Block, Blockchain, ChainParams, ValidatedChain};
use minichain::crypto::KeyPair;
use minichain::error::ChainError;
use minichain::mempool::Mempool;
use minichain::miner::mine_block;
use minichain::transaction::{Transaction, TransferTx};
use std::sync::atomic::AtomicBool;

const TREASURY: u64 = 1_000;

fn test_params(treasury: &KeyPair) -> ChainParams {
    ChainParams::new(treasury.address())
        .with_difficulty(8)
        .with_treasury_balance(TREASURY)
}

/// Mines the mempool's next block on `chain` and appends it, evicting what it settled.
fn mine_and_apply(chain: &mut Blockchain, mempool: &mut Mempool, miner: &KeyPair) -> Block {
    let txs = mempool.take_for_block(chain.state(), chain.params().max_transactions_per_block);
    let block = mine_block(
        chain.tip(),
        txs,
        miner.address(),
        chain.params(),
        &AtomicBool::new(false),
    )
    .unwrap();
    chain.apply_block(block.clone()).unwrap();

    let settled: Vec<_> = block.transfers().map(Transaction::hash).collect();
    mempool.remove(&settled);
    mempool.prune_stale(chain.state());
    block
}

fn assert_supply_conserved(chain: &Blockchain) {
    let expected = TREASURY as u128 + chain.height() as u128 * chain.params().mining_reward as u128;
    assert_eq!(chain.state().total_supply(), expected);
}

#[test]
fn test_single_node_transfer_and_reward() {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let miner = KeyPair::generate();
    let mut chain = Blockchain::new(test_params(&alice)).unwrap();
    let mut mempool = Mempool::new();

    let tx = TransferTx::create(&alice, bob.address(), 100, 1).unwrap();
    mempool.add(tx.into(), chain.state()).unwrap();
    let block = mine_and_apply(&mut chain, &mut mempool, &miner);

    assert_eq!(block.index(), 1);
    assert_eq!(block.transactions.len(), 2);
    assert_eq!(chain.get_balance(&alice.address()), TREASURY - 100);
    assert_eq!(chain.get_balance(&bob.address()), 100);
    assert_eq!(chain.get_balance(&miner.address()), 50);
    assert_eq!(chain.get_nonce(&alice.address()), 1);
    assert!(mempool.is_empty());
    assert_supply_conserved(&chain);
}

#[test]
fn test_nonces_only_move_forward() {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let miner = KeyPair::generate();
    let mut chain = Blockchain::new(test_params(&alice)).unwrap();
    let mut mempool = Mempool::new();

    for nonce in 1..=3 {
        let tx = TransferTx::create(&alice, bob.address(), 10, nonce).unwrap();
        mempool.add(tx.into(), chain.state()).unwrap();
    }
    mine_and_apply(&mut chain, &mut mempool, &miner);
    assert_eq!(chain.get_nonce(&alice.address()), 3);

    // A replayed nonce is refused by the pool and by block validation.
    let replay: Transaction = TransferTx::create(&alice, bob.address(), 10, 2).unwrap().into();
    assert!(matches!(
        mempool.add(replay.clone(), chain.state()),
        Err(ChainError::Rejected(_))
    ));
    let forged = mine_block(
        chain.tip(),
        vec![replay],
        miner.address(),
        chain.params(),
        &AtomicBool::new(false),
    )
    .unwrap();
    assert!(chain.apply_block(forged).is_err());
    assert_eq!(chain.height(), 1);
    assert_supply_conserved(&chain);
}

#[test]
fn test_overspend_never_goes_negative() {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let miner = KeyPair::generate();
    let mut chain = Blockchain::new(test_params(&alice)).unwrap();

    let overspend = TransferTx::create(&alice, bob.address(), TREASURY + 1, 1).unwrap();
    let block = mine_block(
        chain.tip(),
        vec![overspend.into()],
        miner.address(),
        chain.params(),
        &AtomicBool::new(false),
    )
    .unwrap();

    let before = chain.state().clone();
    assert!(chain.apply_block(block).is_err());
    assert_eq!(chain.state(), &before);
    assert_eq!(chain.get_balance(&bob.address()), 0);
}

#[test]
fn test_competing_nodes_fork_choice() {
    let treasury = KeyPair::generate();
    let bob = KeyPair::generate();
    let miner_one = KeyPair::generate();
    let miner_two = KeyPair::generate();
    let params = test_params(&treasury);

    let mut node_one = Blockchain::new(params.clone()).unwrap();
    let mut node_two = Blockchain::new(params.clone()).unwrap();
    let mut pool_one = Mempool::new();
    let mut pool_two = Mempool::new();

    // Node two includes a transfer in its competing block.
    let tx: Transaction = TransferTx::create(&treasury, bob.address(), 25, 1).unwrap().into();
    pool_two.add(tx.clone(), node_two.state()).unwrap();

    mine_and_apply(&mut node_one, &mut pool_one, &miner_one);
    mine_and_apply(&mut node_two, &mut pool_two, &miner_two);
    assert_ne!(node_one.tip().hash(), node_two.tip().hash());

    // Tie: each keeps its own chain.
    let offer = ValidatedChain::validate(node_one.blocks().to_vec(), &params).unwrap();
    let local_tip = node_two.tip().hash();
    assert!(matches!(
        node_two.replace_chain(offer),
        Err(ChainError::StalePeerData(_))
    ));
    assert_eq!(node_two.tip().hash(), local_tip);

    // Node one pulls ahead; node two adopts and replays to the same state.
    mine_and_apply(&mut node_one, &mut pool_one, &miner_one);
    let offer = ValidatedChain::validate(node_one.blocks().to_vec(), &params).unwrap();
    let abandoned = node_two.replace_chain(offer).unwrap();

    assert_eq!(node_two.height(), 2);
    assert_eq!(node_two.tip().hash(), node_one.tip().hash());
    assert_eq!(node_two.state(), node_one.state());
    assert_eq!(node_two.state(), &validate_chain(node_two.blocks(), &params).unwrap());
    assert_eq!(node_two.get_balance(&miner_two.address()), 0);
    assert_eq!(node_two.get_balance(&bob.address()), 0);

    // The abandoned transfer goes back to the pool and lands in the next block.
    let readmitted = pool_two.readmit(
        abandoned.into_iter().flat_map(|b| b.transactions),
        node_two.state(),
    );
    assert_eq!(readmitted, 1);
    assert!(pool_two.contains(&tx.hash()));
    mine_and_apply(&mut node_two, &mut pool_two, &miner_two);
    assert_eq!(node_two.get_balance(&bob.address()), 25);
    assert_supply_conserved(&node_two);
}

#[test]
fn test_revalidation_is_idempotent() {
    let treasury = KeyPair::generate();
    let miner = KeyPair::generate();
    let bob = KeyPair::generate();
    let params = test_params(&treasury);
    let mut chain = Blockchain::new(params.clone()).unwrap();
    let mut mempool = Mempool::new();

    for round in 1..=3u64 {
        let tx = TransferTx::create(&treasury, bob.address(), round, round).unwrap();
        mempool.add(tx.into(), chain.state()).unwrap();
        mine_and_apply(&mut chain, &mut mempool, &miner);
    }

    let first = validate_chain(chain.blocks(), &params).unwrap();
    let second = validate_chain(chain.blocks(), &params).unwrap();
    assert_eq!(first, second);
    assert_eq!(&first, chain.state());
    assert_eq!(chain.replay_state().unwrap(), first);
}

#[test]
fn test_broken_link_invalidates_chain() {
    let treasury = KeyPair::generate();
    let miner = KeyPair::generate();
    let params = test_params(&treasury);
    let mut chain = Blockchain::new(params.clone()).unwrap();
    let mut mempool = Mempool::new();
    mine_and_apply(&mut chain, &mut mempool, &miner);
    mine_and_apply(&mut chain, &mut mempool, &miner);

    let mut blocks = chain.blocks().to_vec();
    blocks[2].header.previous_hash = [0xab; 32];
    assert!(matches!(
        ValidatedChain::validate(blocks, &params),
        Err(ChainError::InvalidChain(_))
    ));

    let mut foreign_genesis = chain.blocks().to_vec();
    foreign_genesis[0].header.timestamp += 1;
    assert!(validate_chain(&foreign_genesis, &params).is_err());
}
