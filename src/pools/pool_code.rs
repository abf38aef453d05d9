use super::concentrated::ConcentratedState;
use super::constant_product::ConstantProductState;
use super::pool::{AbiSwapEncoder, PoolClass, PoolInfo, PreswapRequirement};
use crate::data_sync::contracts::{IUniswapV2Pair, IUniswapV3Pool};
use crate::errors::{ExtractorError, ExtractorResult};
use crate::utils::constants::{MAX_SQRT_RATIO, MIN_SQRT_RATIO};
use alloy_primitives::aliases::U160;
use alloy_primitives::{Address, Bytes, I256, U256};
use alloy_sol_types::SolCall;
use std::fmt::{Display, Formatter};

/// Mutable part of a pool, one variant per pool family.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PoolState {
    ConstantProduct(ConstantProductState),
    Concentrated(ConcentratedState),
}

impl PoolState {
    pub fn class(&self) -> PoolClass {
        match self {
            PoolState::ConstantProduct(_) => PoolClass::ConstantProduct,
            PoolState::Concentrated(_) => PoolClass::ConcentratedLiquidity,
        }
    }
}

/// Immutable snapshot of one pool handed to consumers. A newer snapshot supersedes it.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolCode {
    pub info: PoolInfo,
    pub state: PoolState,
    /// Block of the last event (or fetch) reflected in `state`.
    pub block_number: u64,
}

impl PoolCode {
    pub fn new(info: PoolInfo, state: PoolState, block_number: u64) -> Self {
        Self { info, state, block_number }
    }

    pub fn get_address(&self) -> Address {
        self.info.address
    }

    pub fn get_class(&self) -> PoolClass {
        self.state.class()
    }

    pub fn constant_product(&self) -> Option<&ConstantProductState> {
        match &self.state {
            PoolState::ConstantProduct(state) => Some(state),
            PoolState::Concentrated(_) => None,
        }
    }

    pub fn concentrated(&self) -> Option<&ConcentratedState> {
        match &self.state {
            PoolState::Concentrated(state) => Some(state),
            PoolState::ConstantProduct(_) => None,
        }
    }

    fn check_direction(&self, token_from: Address, token_to: Address) -> ExtractorResult<bool> {
        if !self.info.get_swap_directions().contains(&(token_from, token_to)) {
            return Err(ExtractorError::InvalidSwap(format!("pool {} does not swap {} -> {}", self.info.address, token_from, token_to)));
        }
        Ok(self.info.zero_for_one(token_from))
    }

    fn encode_concentrated_swap(&self, zero_for_one: bool, amount_specified: I256, recipient: Address, payload: Bytes) -> Bytes {
        let limit = if zero_for_one { MIN_SQRT_RATIO + U256::from(1) } else { MAX_SQRT_RATIO - U256::from(1) };
        let call = IUniswapV3Pool::swapCall {
            recipient,
            zeroForOne: zero_for_one,
            amountSpecified: amount_specified,
            sqrtPriceLimitX96: U160::from(limit),
            data: payload,
        };
        Bytes::from(call.abi_encode())
    }
}

impl Display for PoolCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.info, self.block_number)
    }
}

impl AbiSwapEncoder for PoolCode {
    fn encode_swap_in_amount_provided(
        &self,
        token_from_address: Address,
        token_to_address: Address,
        amount: U256,
        recipient: Address,
        payload: Bytes,
    ) -> ExtractorResult<Bytes> {
        let zero_for_one = self.check_direction(token_from_address, token_to_address)?;
        match &self.state {
            PoolState::ConstantProduct(state) => {
                let amount_out = state
                    .get_amount_out(amount, zero_for_one, self.info.fee)
                    .ok_or_else(|| ExtractorError::InvalidSwap(format!("pool {} has no liquidity for {}", self.info.address, amount)))?;
                let (amount0_out, amount1_out) = if zero_for_one { (U256::ZERO, amount_out) } else { (amount_out, U256::ZERO) };
                let call = IUniswapV2Pair::swapCall { amount0Out: amount0_out, amount1Out: amount1_out, to: recipient, data: payload };
                Ok(Bytes::from(call.abi_encode()))
            }
            PoolState::Concentrated(_) => {
                let amount_specified = I256::try_from(amount).map_err(|e| ExtractorError::InvalidSwap(e.to_string()))?;
                Ok(self.encode_concentrated_swap(zero_for_one, amount_specified, recipient, payload))
            }
        }
    }

    fn encode_swap_out_amount_provided(
        &self,
        token_from_address: Address,
        token_to_address: Address,
        amount: U256,
        recipient: Address,
        payload: Bytes,
    ) -> ExtractorResult<Bytes> {
        let zero_for_one = self.check_direction(token_from_address, token_to_address)?;
        match &self.state {
            PoolState::ConstantProduct(_) => {
                let (amount0_out, amount1_out) = if zero_for_one { (U256::ZERO, amount) } else { (amount, U256::ZERO) };
                let call = IUniswapV2Pair::swapCall { amount0Out: amount0_out, amount1Out: amount1_out, to: recipient, data: payload };
                Ok(Bytes::from(call.abi_encode()))
            }
            PoolState::Concentrated(_) => {
                let amount_specified = -I256::try_from(amount).map_err(|e| ExtractorError::InvalidSwap(e.to_string()))?;
                Ok(self.encode_concentrated_swap(zero_for_one, amount_specified, recipient, payload))
            }
        }
    }

    fn preswap_requirement(&self) -> PreswapRequirement {
        match self.state {
            PoolState::ConstantProduct(_) => PreswapRequirement::Transfer(self.info.address),
            PoolState::Concentrated(_) => PreswapRequirement::Callback,
        }
    }
}
