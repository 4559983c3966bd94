//! Per-network chain parameters.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Base58check version byte for pay-to-pubkey-hash addresses.
    pub pubkey_prefix: u8,
    /// Base58check version byte for pay-to-script-hash addresses.
    pub script_prefix: u8,
    /// WIF version byte.
    pub wif_prefix: u8,
    /// Bech32 human-readable part for stealth addresses.
    pub stealth_hrp: &'static str,
    /// Seconds an output must age before staking. Short on regtest so tests
    /// can stake without multi-hour fixtures.
    pub stake_min_age: i64,
    pub stake_max_age: i64,
    pub stake_split_age: i64,
    pub coinbase_maturity: i32,
}

const MAINNET: ChainParams = ChainParams {
    network: Network::Mainnet,
    pubkey_prefix: 0x44,
    script_prefix: 0x4e,
    wif_prefix: 0xc4,
    stealth_hrp: "usx",
    stake_min_age: crate::constants::STAKE_MIN_AGE,
    stake_max_age: crate::constants::STAKE_MAX_AGE,
    stake_split_age: crate::constants::STAKE_SPLIT_AGE,
    coinbase_maturity: crate::constants::COINBASE_MATURITY,
};

const TESTNET: ChainParams = ChainParams {
    network: Network::Testnet,
    pubkey_prefix: 0x6f,
    script_prefix: 0xc4,
    wif_prefix: 0xef,
    stealth_hrp: "tusx",
    stake_min_age: 60 * 60,
    stake_max_age: crate::constants::STAKE_MAX_AGE,
    stake_split_age: crate::constants::STAKE_SPLIT_AGE,
    coinbase_maturity: 10,
};

const REGTEST: ChainParams = ChainParams {
    network: Network::Regtest,
    pubkey_prefix: 0x6f,
    script_prefix: 0xc4,
    wif_prefix: 0xef,
    stealth_hrp: "rusx",
    stake_min_age: 60,
    stake_max_age: crate::constants::STAKE_MAX_AGE,
    stake_split_age: crate::constants::STAKE_SPLIT_AGE,
    coinbase_maturity: 2,
};

pub fn chain_params(network: Network) -> &'static ChainParams {
    match network {
        Network::Mainnet => &MAINNET,
        Network::Testnet => &TESTNET,
        Network::Regtest => &REGTEST,
    }
}
