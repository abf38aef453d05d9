use crate::errors::ExtractorResult;
use crate::utils::constants::{DEFAULT_FEE_TIERS, EthFactoryAddress};
use crate::utils::token::Token;
use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use strum_macros::{Display, EnumIter, EnumString, VariantNames};

pub fn get_protocol_by_factory(factory_address: Address) -> PoolProtocol {
    if factory_address == EthFactoryAddress::UNISWAP_V2 {
        PoolProtocol::UniswapV2
    } else if factory_address == EthFactoryAddress::SUSHISWAP_V2 {
        PoolProtocol::SushiswapV2
    } else if factory_address == EthFactoryAddress::UNISWAP_V3 {
        PoolProtocol::UniswapV3
    } else if factory_address == EthFactoryAddress::SUSHISWAP_V3 {
        PoolProtocol::SushiswapV3
    } else {
        PoolProtocol::Unknown
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Hash, Eq, EnumString, VariantNames, Deserialize, Serialize, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolClass {
    /// Pair-style `x * y = k` pools (Uniswap V2 and forks).
    ConstantProduct,
    /// Tick-based pools (Uniswap V3 and forks).
    ConcentratedLiquidity,
}

#[derive(Copy, Clone, Debug, Display, Default, PartialEq, Hash, Eq, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolProtocol {
    #[default]
    Unknown,
    UniswapV2,
    SushiswapV2,
    UniswapV3,
    SushiswapV3,
}

fn default_pair_fee() -> u32 {
    3000
}

/// Static description of a pool factory. Supplied at startup, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryInfo {
    pub address: Address,
    pub class: PoolClass,
    #[serde(default)]
    pub protocol: PoolProtocol,
    /// Swap fee of pair-style pools, parts per million.
    #[serde(default = "default_pair_fee")]
    pub fee: u32,
    /// CREATE2 init code hash; when present pair addresses are derived instead of queried.
    #[serde(default)]
    pub init_code_hash: Option<B256>,
    #[serde(default)]
    pub fee_tiers: Vec<u32>,
}

impl FactoryInfo {
    pub fn constant_product(address: Address, fee: u32) -> Self {
        Self {
            address,
            class: PoolClass::ConstantProduct,
            protocol: get_protocol_by_factory(address),
            fee,
            init_code_hash: None,
            fee_tiers: Vec::new(),
        }
    }

    pub fn concentrated(address: Address, fee_tiers: Vec<u32>) -> Self {
        Self {
            address,
            class: PoolClass::ConcentratedLiquidity,
            protocol: get_protocol_by_factory(address),
            fee: 0,
            init_code_hash: None,
            fee_tiers,
        }
    }

    pub fn with_init_code_hash(self, init_code_hash: B256) -> Self {
        Self { init_code_hash: Some(init_code_hash), ..self }
    }

    pub fn with_protocol(self, protocol: PoolProtocol) -> Self {
        Self { protocol, ..self }
    }

    pub fn fee_tiers(&self) -> Vec<u32> {
        if self.fee_tiers.is_empty() { DEFAULT_FEE_TIERS.to_vec() } else { self.fee_tiers.clone() }
    }

    /// CREATE2 address of the pair for `(token0, token1)`, tokens already sorted.
    pub fn compute_pair_address(&self, token0: Address, token1: Address) -> Option<Address> {
        let init_code_hash = self.init_code_hash?;
        let salt = keccak256([token0.as_slice(), token1.as_slice()].concat());
        Some(self.address.create2(salt, init_code_hash))
    }
}

/// Identity of a discovered pool. Created once, never destroyed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolInfo {
    pub address: Address,
    pub token0: Arc<Token>,
    pub token1: Arc<Token>,
    pub fee: u32,
    pub factory: FactoryInfo,
    pub tick_spacing: Option<i32>,
}

impl PoolInfo {
    /// Builds the identity with tokens ordered by address.
    pub fn new(address: Address, token_a: Arc<Token>, token_b: Arc<Token>, fee: u32, factory: FactoryInfo) -> Self {
        let (token0, token1) = if token_a.get_address() <= token_b.get_address() { (token_a, token_b) } else { (token_b, token_a) };
        Self { address, token0, token1, fee, factory, tick_spacing: None }
    }

    pub fn with_tick_spacing(self, tick_spacing: i32) -> Self {
        Self { tick_spacing: Some(tick_spacing), ..self }
    }

    pub fn get_class(&self) -> PoolClass {
        self.factory.class
    }

    pub fn get_protocol(&self) -> PoolProtocol {
        self.factory.protocol
    }

    pub fn get_tokens(&self) -> Vec<Address> {
        vec![self.token0.get_address(), self.token1.get_address()]
    }

    pub fn has_token(&self, token: &Address) -> bool {
        self.token0.get_address() == *token || self.token1.get_address() == *token
    }

    pub fn get_swap_directions(&self) -> Vec<(Address, Address)> {
        vec![(self.token0.get_address(), self.token1.get_address()), (self.token1.get_address(), self.token0.get_address())]
    }

    /// True when swapping `token_from` moves token0 into the pool.
    pub fn zero_for_one(&self, token_from: Address) -> bool {
        token_from == self.token0.get_address()
    }
}

impl Display for PoolInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}/{}, fee={})@{}", self.get_protocol(), self.token0.get_symbol(), self.token1.get_symbol(), self.fee, self.address)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PreswapRequirement {
    Unknown,
    Transfer(Address),
    Allowance,
    Callback,
    Base,
}

pub trait AbiSwapEncoder {
    fn encode_swap_in_amount_provided(
        &self,
        token_from_address: Address,
        token_to_address: Address,
        amount: U256,
        recipient: Address,
        payload: Bytes,
    ) -> ExtractorResult<Bytes>;

    fn encode_swap_out_amount_provided(
        &self,
        token_from_address: Address,
        token_to_address: Address,
        amount: U256,
        recipient: Address,
        payload: Bytes,
    ) -> ExtractorResult<Bytes>;

    fn preswap_requirement(&self) -> PreswapRequirement {
        PreswapRequirement::Unknown
    }
}
