use super::contracts::{IUniswapV2Factory, IUniswapV2Pair, IUniswapV3Factory, IUniswapV3Pool};
use crate::errors::{ExtractorError, ExtractorResult};
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::SolEvent;

/// Position of a log in the chain. Ordering is (block, log index).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl EventPosition {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self { block_number, log_index }
    }

    /// Position preceding every log of `block_number + 1`.
    pub fn end_of_block(block_number: u64) -> Self {
        Self { block_number, log_index: u64::MAX }
    }
}

/// A log as delivered by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub log_index: u64,
}

impl RawLog {
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.block_number, self.log_index)
    }

    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

/// Input of the extractor's event loop, consumed in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// New logs, ordered by (block, log index).
    Logs(Vec<RawLog>),
    /// Every block after `common_ancestor` was replaced.
    Rollback { common_ancestor: u64 },
    /// The feed lost continuity; every tracked pool must be refreshed.
    Resync,
}

/// A decoded pool or factory event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Sync { reserve0: U256, reserve1: U256 },
    PairCreated { token0: Address, token1: Address, pair: Address },
    PoolCreated { token0: Address, token1: Address, fee: u32, tick_spacing: i32, pool: Address },
    Initialize { sqrt_price_x96: U256, tick: i32 },
    Swap { sqrt_price_x96: U256, liquidity: u128, tick: i32 },
    Mint { tick_lower: i32, tick_upper: i32, amount: u128 },
    Burn { tick_lower: i32, tick_upper: i32, amount: u128 },
}

pub fn pair_event_topics() -> Vec<B256> {
    vec![IUniswapV2Pair::Sync::SIGNATURE_HASH, IUniswapV2Factory::PairCreated::SIGNATURE_HASH]
}

pub fn concentrated_event_topics() -> Vec<B256> {
    vec![
        IUniswapV3Pool::Swap::SIGNATURE_HASH,
        IUniswapV3Pool::Mint::SIGNATURE_HASH,
        IUniswapV3Pool::Burn::SIGNATURE_HASH,
        IUniswapV3Pool::Initialize::SIGNATURE_HASH,
        IUniswapV3Factory::PoolCreated::SIGNATURE_HASH,
    ]
}

fn decode<E: SolEvent>(log: &RawLog) -> ExtractorResult<E> {
    E::decode_raw_log(log.topics.iter().copied(), &log.data)
        .map_err(|e| ExtractorError::InvalidEvent(format!("{} at {}:{}: {}", E::SIGNATURE, log.block_number, log.log_index, e)))
}

impl PoolEvent {
    /// Decodes a log. `Ok(None)` for logs with a topic the core does not consume.
    pub fn decode(log: &RawLog) -> ExtractorResult<Option<PoolEvent>> {
        let Some(topic0) = log.topic0() else {
            return Ok(None);
        };

        let event = if topic0 == IUniswapV2Pair::Sync::SIGNATURE_HASH {
            let e = decode::<IUniswapV2Pair::Sync>(log)?;
            PoolEvent::Sync { reserve0: U256::from(e.reserve0), reserve1: U256::from(e.reserve1) }
        } else if topic0 == IUniswapV2Factory::PairCreated::SIGNATURE_HASH {
            let e = decode::<IUniswapV2Factory::PairCreated>(log)?;
            PoolEvent::PairCreated { token0: e.token0, token1: e.token1, pair: e.pair }
        } else if topic0 == IUniswapV3Factory::PoolCreated::SIGNATURE_HASH {
            let e = decode::<IUniswapV3Factory::PoolCreated>(log)?;
            PoolEvent::PoolCreated {
                token0: e.token0,
                token1: e.token1,
                fee: e.fee.to::<u32>(),
                tick_spacing: e.tickSpacing.as_i32(),
                pool: e.pool,
            }
        } else if topic0 == IUniswapV3Pool::Initialize::SIGNATURE_HASH {
            let e = decode::<IUniswapV3Pool::Initialize>(log)?;
            PoolEvent::Initialize { sqrt_price_x96: U256::from(e.sqrtPriceX96), tick: e.tick.as_i32() }
        } else if topic0 == IUniswapV3Pool::Swap::SIGNATURE_HASH {
            let e = decode::<IUniswapV3Pool::Swap>(log)?;
            PoolEvent::Swap { sqrt_price_x96: U256::from(e.sqrtPriceX96), liquidity: e.liquidity, tick: e.tick.as_i32() }
        } else if topic0 == IUniswapV3Pool::Mint::SIGNATURE_HASH {
            let e = decode::<IUniswapV3Pool::Mint>(log)?;
            PoolEvent::Mint { tick_lower: e.tickLower.as_i32(), tick_upper: e.tickUpper.as_i32(), amount: e.amount }
        } else if topic0 == IUniswapV3Pool::Burn::SIGNATURE_HASH {
            let e = decode::<IUniswapV3Pool::Burn>(log)?;
            PoolEvent::Burn { tick_lower: e.tickLower.as_i32(), tick_upper: e.tickUpper.as_i32(), amount: e.amount }
        } else {
            return Ok(None);
        };
        Ok(Some(event))
    }
}

/// Log builders shared by the test suites.
#[cfg(test)]
pub(crate) mod test_logs {
    use super::*;
    use alloy_primitives::aliases::{I24, U112, U160};
    use alloy_primitives::{I256, LogData};

    fn raw(address: Address, data: LogData, block_number: u64, log_index: u64) -> RawLog {
        RawLog { address, topics: data.topics().to_vec(), data: data.data.clone(), block_number, log_index }
    }

    fn i24(value: i32) -> I24 {
        I24::try_from(value).unwrap()
    }

    pub fn sync_log(pair: Address, reserve0: u64, reserve1: u64, block_number: u64, log_index: u64) -> RawLog {
        let event = IUniswapV2Pair::Sync { reserve0: U112::from(reserve0), reserve1: U112::from(reserve1) };
        raw(pair, event.encode_log_data(), block_number, log_index)
    }

    pub fn pair_created_log(factory: Address, token0: Address, token1: Address, pair: Address, block_number: u64) -> RawLog {
        let event = IUniswapV2Factory::PairCreated { token0, token1, pair, allPairsLength: U256::from(1) };
        raw(factory, event.encode_log_data(), block_number, 0)
    }

    pub fn pool_created_log(
        factory: Address,
        token0: Address,
        token1: Address,
        fee: u32,
        tick_spacing: i32,
        pool: Address,
        block_number: u64,
    ) -> RawLog {
        let event = IUniswapV3Factory::PoolCreated {
            token0,
            token1,
            fee: alloy_primitives::aliases::U24::from(fee),
            tickSpacing: i24(tick_spacing),
            pool,
        };
        raw(factory, event.encode_log_data(), block_number, 0)
    }

    pub fn swap_log(pool: Address, sqrt_price_x96: U256, liquidity: u128, tick: i32, block_number: u64, log_index: u64) -> RawLog {
        let event = IUniswapV3Pool::Swap {
            sender: Address::ZERO,
            recipient: Address::ZERO,
            amount0: I256::ZERO,
            amount1: I256::ZERO,
            sqrtPriceX96: U160::from(sqrt_price_x96),
            liquidity,
            tick: i24(tick),
        };
        raw(pool, event.encode_log_data(), block_number, log_index)
    }

    pub fn mint_log(pool: Address, tick_lower: i32, tick_upper: i32, amount: u128, block_number: u64, log_index: u64) -> RawLog {
        let event = IUniswapV3Pool::Mint {
            sender: Address::ZERO,
            owner: Address::ZERO,
            tickLower: i24(tick_lower),
            tickUpper: i24(tick_upper),
            amount,
            amount0: U256::ZERO,
            amount1: U256::ZERO,
        };
        raw(pool, event.encode_log_data(), block_number, log_index)
    }

    pub fn burn_log(pool: Address, tick_lower: i32, tick_upper: i32, amount: u128, block_number: u64, log_index: u64) -> RawLog {
        let event = IUniswapV3Pool::Burn {
            owner: Address::ZERO,
            tickLower: i24(tick_lower),
            tickUpper: i24(tick_upper),
            amount,
            amount0: U256::ZERO,
            amount1: U256::ZERO,
        };
        raw(pool, event.encode_log_data(), block_number, log_index)
    }
}
