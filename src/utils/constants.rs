use alloy_primitives::{Address, B256, U256, address, b256, uint};

/// Multicall3, deployed at the same address on most chains.
pub const MULTICALL3: Address = address!("0xcA11bde05977b3631167028862bE2a173976CA11");

pub const NATIVE: Address = Address::ZERO;

pub const MIN_TICK: i32 = -887272;
pub const MAX_TICK: i32 = 887272;

/// `getSqrtRatioAtTick(MIN_TICK)` and `getSqrtRatioAtTick(MAX_TICK)`.
pub const MIN_SQRT_RATIO: U256 = uint!(4295128739_U256);
pub const MAX_SQRT_RATIO: U256 = uint!(1461446703485210103287273052203988822378723970342_U256);

/// Fee denominator: fees are expressed in parts per million.
pub const FEE_DENOMINATOR: u32 = 1_000_000;

/// Number of most valuable tokens listed in the pool-count report.
pub const TOKENS_STATUS_TOP: usize = 30;

#[non_exhaustive]
pub struct EthFactoryAddress;

impl EthFactoryAddress {
    // Uniswap V2 compatible
    pub const UNISWAP_V2: Address = address!("0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f");
    pub const SUSHISWAP_V2: Address = address!("0xC0AEe478e3658e2610c5F7A4A2E1777cE9e4f2Ac");

    // Uniswap V3 compatible
    pub const UNISWAP_V3: Address = address!("0x1F98431c8aD98523631AE4a59f267346ea31F984");
    pub const SUSHISWAP_V3: Address = address!("0xbACEB8eC6b9355Dfc0269C18bac9d6E2Bdc29C4F");
}

#[non_exhaustive]
pub struct EthInitCodeHash;

impl EthInitCodeHash {
    pub const UNISWAP_V2: B256 = b256!("0x96e8ac4277198ff8b6f785478aa9a39f403cb768dd02cbee326c3e7da348845f");
}

/// Fee tiers queried for concentrated-liquidity factories when none are configured.
pub const DEFAULT_FEE_TIERS: [u32; 4] = [100, 500, 3000, 10000];
