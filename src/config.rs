//! Configuration management for MiniChain

use crate::blockchain::{
    ChainParams, DEFAULT_DIFFICULTY, DEFAULT_MAX_TRANSACTIONS_PER_BLOCK, DEFAULT_MINING_REWARD,
    DEFAULT_TREASURY_BALANCE, DEV_TREASURY_SECRET_KEY,
};
use crate::crypto::{address_from_hex, Address, KeyPair};
use crate::error::ChainError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub faucet: FaucetConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default = "default_network_id")]
    pub network_id: String,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default)]
    pub auto_connect: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            p2p_port: default_p2p_port(),
            network_id: default_network_id(),
            bootstrap_peers: Vec::new(),
            max_peers: default_max_peers(),
            auto_connect: false,
        }
    }
}

/// Consensus settings. Nodes that disagree on any of these are on different networks.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_mining_reward")]
    pub mining_reward: u64,
    #[serde(default = "default_max_transactions_per_block")]
    pub max_transactions_per_block: usize,
    #[serde(default = "default_treasury_balance")]
    pub treasury_balance: u64,
    /// Hex address credited at genesis. Defaults to the faucet key's address.
    #[serde(default)]
    pub treasury_address: Option<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            mining_reward: default_mining_reward(),
            max_transactions_per_block: default_max_transactions_per_block(),
            treasury_balance: default_treasury_balance(),
            treasury_address: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MinerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Hex address receiving block rewards. Defaults to the node wallet.
    #[serde(default)]
    pub beneficiary_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FaucetConfig {
    #[serde(default = "default_faucet_key")]
    pub secret_key: String,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            secret_key: default_faucet_key(),
        }
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_p2p_port() -> u16 {
    9000
}

fn default_network_id() -> String {
    "minichain-devnet".to_string()
}

fn default_max_peers() -> usize {
    16
}

fn default_difficulty() -> u32 {
    DEFAULT_DIFFICULTY
}

fn default_mining_reward() -> u64 {
    DEFAULT_MINING_REWARD
}

fn default_max_transactions_per_block() -> usize {
    DEFAULT_MAX_TRANSACTIONS_PER_BLOCK
}

fn default_treasury_balance() -> u64 {
    DEFAULT_TREASURY_BALANCE
}

fn default_faucet_key() -> String {
    DEV_TREASURY_SECRET_KEY.to_string()
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, ChainError> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| ChainError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if !(1..=64).contains(&self.chain.difficulty) {
            return Err(ChainError::ConfigError(format!(
                "chain.difficulty must be between 1 and 64 bits, got {}",
                self.chain.difficulty
            )));
        }
        if self.chain.max_transactions_per_block == 0 {
            return Err(ChainError::ConfigError(
                "chain.max_transactions_per_block must be greater than zero".to_string(),
            ));
        }
        if self.network.network_id.is_empty() {
            return Err(ChainError::ConfigError(
                "network.network_id must not be empty".to_string(),
            ));
        }
        if self.network.max_peers == 0 {
            return Err(ChainError::ConfigError(
                "network.max_peers must be greater than zero".to_string(),
            ));
        }

        self.faucet_keypair()?;
        self.treasury_address()?;
        self.beneficiary()?;
        Ok(())
    }

    pub fn faucet_keypair(&self) -> Result<KeyPair, ChainError> {
        KeyPair::from_secret_hex(&self.faucet.secret_key)
            .map_err(|e| ChainError::ConfigError(format!("faucet.secret_key: {}", e)))
    }

    pub fn treasury_address(&self) -> Result<Address, ChainError> {
        match &self.chain.treasury_address {
            Some(hex) => address_from_hex(hex)
                .map_err(|e| ChainError::ConfigError(format!("chain.treasury_address: {}", e))),
            None => Ok(self.faucet_keypair()?.address()),
        }
    }

    pub fn beneficiary(&self) -> Result<Option<Address>, ChainError> {
        self.miner
            .beneficiary_address
            .as_deref()
            .map(|hex| {
                address_from_hex(hex).map_err(|e| {
                    ChainError::ConfigError(format!("miner.beneficiary_address: {}", e))
                })
            })
            .transpose()
    }

    /// The consensus parameters this configuration describes.
    pub fn chain_params(&self) -> Result<ChainParams, ChainError> {
        let mut params = ChainParams::new(self.treasury_address()?)
            .with_difficulty(self.chain.difficulty)
            .with_mining_reward(self.chain.mining_reward)
            .with_treasury_balance(self.chain.treasury_balance);
        params.max_transactions_per_block = self.chain.max_transactions_per_block;
        Ok(params)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.listen_host, self.network.p2p_port)
    }
}

/// Loads `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let path = path.as_ref();
    if !path.exists() {
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        ChainError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Config::from_toml_str(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.network.p2p_port, 9000);
        assert_eq!(config.chain.difficulty, DEFAULT_DIFFICULTY);
        assert!(!config.miner.enabled);

        let dev = KeyPair::from_secret_hex(DEV_TREASURY_SECRET_KEY).unwrap();
        assert_eq!(config.chain_params().unwrap().treasury_address, dev.address());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[network]
p2p_port = 7100
bootstrap_peers = ["127.0.0.1:7101"]

[chain]
difficulty = 8
mining_reward = 25
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.network.p2p_port, 7100);
        assert_eq!(config.network.bootstrap_peers, vec!["127.0.0.1:7101"]);
        assert_eq!(config.network.max_peers, 16);

        let params = config.chain_params().unwrap();
        assert_eq!(params.difficulty, 8);
        assert_eq!(params.mining_reward, 25);
        assert_eq!(params.treasury_balance, DEFAULT_TREASURY_BALANCE);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_toml_str("[chain]\ndifficulty = 0").is_err());
        assert!(Config::from_toml_str("[chain]\ndifficulty = 65").is_err());
        assert!(Config::from_toml_str("[chain]\nmax_transactions_per_block = 0").is_err());
        assert!(Config::from_toml_str("[chain]\ntreasury_address = \"abcd\"").is_err());
        assert!(Config::from_toml_str("[faucet]\nsecret_key = \"zz\"").is_err());
        assert!(Config::from_toml_str("[miner]\nbeneficiary_address = \"00\"").is_err());
        assert!(Config::from_toml_str("not toml at all [").is_err());
    }

    #[test]
    fn test_explicit_treasury_and_beneficiary() {
        let treasury = KeyPair::generate();
        let miner = KeyPair::generate();
        let toml = format!(
            "[chain]\ntreasury_address = \"{}\"\n[miner]\nenabled = true\nbeneficiary_address = \"{}\"\n",
            hex::encode(treasury.address()),
            hex::encode(miner.address()),
        );
        let config = Config::from_toml_str(&toml).unwrap();

        assert!(config.miner.enabled);
        assert_eq!(config.treasury_address().unwrap(), treasury.address());
        assert_eq!(config.beneficiary().unwrap(), Some(miner.address()));
    }
}
