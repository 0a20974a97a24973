//! MiniChain - a minimal account-based Proof-of-Work blockchain node
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Blocks, account state, validation and fork choice
//! - [`transaction`] - Signed transfers and coinbase rewards
//! - [`mempool`] - Pending transfers awaiting inclusion
//!
//! ## Consensus
//! - [`miner`] - Cancellable proof-of-work search
//!
//! ## Cryptography
//! - [`crypto`] - Hashing, addresses and signatures (secp256k1)
//!
//! ## Networking
//! - [`network`] - Framed TCP protocol, peer tasks and relay
//! - [`node`] - The node tying ledger, miner and peers together
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
