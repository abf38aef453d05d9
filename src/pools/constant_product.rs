use crate::utils::constants::FEE_DENOMINATOR;
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// Reserves of a pair-style pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstantProductState {
    pub reserve0: U256,
    pub reserve1: U256,
}

impl ConstantProductState {
    pub fn new(reserve0: U256, reserve1: U256) -> Self {
        Self { reserve0, reserve1 }
    }

    /// A `Sync` event replaces both reserves at once.
    pub fn apply_sync(&mut self, reserve0: U256, reserve1: U256) {
        self.reserve0 = reserve0;
        self.reserve1 = reserve1;
    }

    fn reserves(&self, zero_for_one: bool) -> (U256, U256) {
        if zero_for_one { (self.reserve0, self.reserve1) } else { (self.reserve1, self.reserve0) }
    }

    pub fn get_amount_out(&self, amount_in: U256, zero_for_one: bool, fee: u32) -> Option<U256> {
        let (reserve_in, reserve_out) = self.reserves(zero_for_one);
        if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
            return None;
        }
        let amount_in_with_fee = amount_in.checked_mul(U256::from(FEE_DENOMINATOR.checked_sub(fee)?))?;
        let numerator = amount_in_with_fee.checked_mul(reserve_out)?;
        let denominator = reserve_in.checked_mul(U256::from(FEE_DENOMINATOR))?.checked_add(amount_in_with_fee)?;
        Some(numerator / denominator)
    }

    pub fn get_amount_in(&self, amount_out: U256, zero_for_one: bool, fee: u32) -> Option<U256> {
        let (reserve_in, reserve_out) = self.reserves(zero_for_one);
        if amount_out.is_zero() || amount_out >= reserve_out {
            return None;
        }
        let numerator = reserve_in.checked_mul(amount_out)?.checked_mul(U256::from(FEE_DENOMINATOR))?;
        let denominator = (reserve_out - amount_out).checked_mul(U256::from(FEE_DENOMINATOR.checked_sub(fee)?))?;
        if denominator.is_zero() {
            return None;
        }
        Some(numerator / denominator + U256::from(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_out_matches_router_formula() {
        let state = ConstantProductState::new(U256::from(1_000_000u64), U256::from(2_000_000u64));
        // 1000 * 997 * 2_000_000 / (1_000_000 * 1000 + 1000 * 997)
        let out = state.get_amount_out(U256::from(1000u64), true, 3000).unwrap();
        assert_eq!(out, U256::from(1992u64));

        let back = state.get_amount_out(U256::from(1000u64), false, 3000).unwrap();
        assert_eq!(back, U256::from(498u64));
    }

    #[test]
    fn test_amount_in_covers_amount_out() {
        let state = ConstantProductState::new(U256::from(1_000_000u64), U256::from(2_000_000u64));
        let amount_in = state.get_amount_in(U256::from(1992u64), true, 3000).unwrap();
        assert!(state.get_amount_out(amount_in, true, 3000).unwrap() >= U256::from(1992u64));
        assert_eq!(state.get_amount_in(U256::from(2_000_000u64), true, 3000), None);
    }

    #[test]
    fn test_empty_pool_quotes_nothing() {
        let state = ConstantProductState::default();
        assert_eq!(state.get_amount_out(U256::from(1u64), true, 3000), None);
    }

    #[test]
    fn test_apply_sync() {
        let mut state = ConstantProductState::new(U256::from(1000u64), U256::from(2000u64));
        state.apply_sync(U256::from(1100u64), U256::from(1818u64));
        assert_eq!(state, ConstantProductState::new(U256::from(1100u64), U256::from(1818u64)));
    }
}
