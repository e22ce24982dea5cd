//! Consensus parameter definitions.

use crate::deployments::DeploymentHeights;
use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub genesis_nonce: u32,
    pub genesis_bits: u32,
    pub genesis_version: i32,
    pub genesis_reward: Amount,
    pub subsidy_halving_interval: i32,
    pub deployments: DeploymentHeights,
    pub checkpoints: Vec<Checkpoint>,
    pub pow_limit: Hash256,
    pub pow_target_timespan: i64,
    pub pow_target_spacing: i64,
    /// Testnet rule: a block more than twice the spacing after its parent may use the limit.
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub minimum_chain_work: Hash256,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.height == height)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hash length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into internal little-endian bytes.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in hex.len()..64 {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Network magic; also prefixes every record in the block files.
    pub message_start: [u8; 4],
    pub default_port: u16,
}

pub fn chain_params(network: Network) -> ChainParams {
    let (message_start, default_port) = match network {
        Network::Mainnet => ([0xf9, 0xbe, 0xb4, 0xd9], 8_333),
        Network::Testnet => ([0x0b, 0x11, 0x09, 0x07], 18_333),
        Network::Regtest => ([0xfa, 0xbf, 0xb5, 0xda], 18_444),
    };
    ChainParams {
        network,
        consensus: consensus_params(network),
        message_start,
        default_port,
    }
}

fn parse_hash(hex: &str) -> Hash256 {
    hash256_from_hex(hex).unwrap_or([0u8; 32])
}

fn parse_checkpoints(entries: &[(i32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hash)| Checkpoint {
            height: *height,
            hash: parse_hash(hash),
        })
        .collect()
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: parse_hash(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        ),
        genesis_time: 1_231_006_505,
        genesis_nonce: 2_083_236_893,
        genesis_bits: 0x1d00_ffff,
        genesis_version: 1,
        genesis_reward: 50 * COIN,
        subsidy_halving_interval: 210_000,
        deployments: DeploymentHeights([227_931, 363_725, 388_381, 419_328, 481_824]),
        checkpoints: parse_checkpoints(&[
            (
                11_111,
                "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
            ),
            (
                33_333,
                "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
            ),
        ]),
        pow_limit: parse_hash("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_target_spacing: 10 * 60,
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        minimum_chain_work: [0u8; 32],
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: parse_hash(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        ),
        genesis_time: 1_296_688_602,
        genesis_nonce: 414_098_458,
        genesis_bits: 0x1d00_ffff,
        genesis_version: 1,
        genesis_reward: 50 * COIN,
        subsidy_halving_interval: 210_000,
        deployments: DeploymentHeights([21_111, 330_776, 581_885, 770_112, 834_624]),
        checkpoints: Vec::new(),
        pow_limit: parse_hash("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_target_spacing: 10 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: false,
        minimum_chain_work: [0u8; 32],
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: parse_hash(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        ),
        genesis_time: 1_296_688_602,
        genesis_nonce: 2,
        genesis_bits: 0x207f_ffff,
        genesis_version: 1,
        genesis_reward: 50 * COIN,
        subsidy_halving_interval: 150,
        deployments: DeploymentHeights([1, 1, 1, 1, 0]),
        checkpoints: Vec::new(),
        pow_limit: parse_hash("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_target_spacing: 10 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        minimum_chain_work: [0u8; 32],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployments::Deployment;

    fn hash256_to_hex(hash: &Hash256) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(64);
        for byte in hash.iter().rev() {
            let _ = write!(out, "{:02x}", byte);
        }
        out
    }

    #[test]
    fn mainnet_params_round_trip_hex() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(
            hash256_to_hex(&params.hash_genesis_block),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            hash256_to_hex(&params.pow_limit),
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"
        );
        assert_eq!(params.difficulty_adjustment_interval(), 2_016);
        assert_eq!(params.deployments.activation_height(Deployment::Csv), 419_328);
        assert!(params.checkpoint_at(11_111).is_some());
        assert!(params.checkpoint_at(11_112).is_none());
    }

    #[test]
    fn hex_parser_pads_and_rejects() {
        let one = hash256_from_hex("0x1").expect("short hex");
        assert_eq!(one[0], 1);
        assert!(one[1..].iter().all(|b| *b == 0));
        assert_eq!(hash256_from_hex(""), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex(&"0".repeat(65)), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex("zz"), Err(HexError::InvalidHex));
    }

    #[test]
    fn network_parse_accepts_aliases() {
        assert_eq!(Network::parse("Main"), Some(Network::Mainnet));
        assert_eq!(Network::parse("test"), Some(Network::Testnet));
        assert_eq!(Network::parse("regtest"), Some(Network::Regtest));
        assert_eq!(Network::parse("signet"), None);
        assert_eq!(
            chain_params(Network::Regtest).message_start,
            [0xfa, 0xbf, 0xb5, 0xda]
        );
    }
}
