use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// ERC20 token metadata scoped to one chain.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Token {
    chain_id: u64,
    address: Address,
    decimals: u8,
    symbol: Option<String>,
    name: Option<String>,
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.chain_id.hash(state);
        self.address.hash(state)
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.chain_id == other.chain_id && self.address == other.address
    }
}

impl Eq for Token {}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        self.chain_id.cmp(&other.chain_id).then_with(|| self.address.cmp(&other.address))
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Token {
    pub fn new(chain_id: u64, address: Address) -> Token {
        Token { chain_id, address, decimals: 18, ..Token::default() }
    }

    pub fn new_with_data(
        chain_id: u64,
        address: Address,
        symbol: Option<String>,
        name: Option<String>,
        decimals: Option<u8>,
    ) -> Token {
        Token { chain_id, address, symbol, name, decimals: decimals.unwrap_or(18) }
    }

    /// Token whose address repeats `byte`, for fixtures.
    pub fn repeat_byte(chain_id: u64, byte: u8) -> Token {
        Token::new(chain_id, Address::repeat_byte(byte))
    }

    pub fn get_chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn get_symbol(&self) -> String {
        self.symbol.clone().unwrap_or(self.address.to_string())
    }

    pub fn get_name(&self) -> String {
        self.name.clone().unwrap_or(self.address.to_string())
    }

    pub fn get_decimals(&self) -> u8 {
        self.decimals
    }

    pub fn get_address(&self) -> Address {
        self.address
    }

    pub fn is_native(&self) -> bool {
        self.address.is_zero()
    }
}
