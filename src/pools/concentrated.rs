use crate::errors::{ExtractorError, ExtractorResult};
use crate::utils::constants::{MAX_TICK, MIN_TICK};
use alloy_primitives::U256;
use std::collections::BTreeMap;

/// Bitmap word holding `tick`: ticks are compressed by the spacing, 256 per word.
pub fn tick_to_word(tick: i32, tick_spacing: i32) -> i16 {
    let compressed = tick.div_euclid(tick_spacing.max(1));
    (compressed >> 8) as i16
}

/// Every word a pool with this spacing can use.
pub fn full_word_range(tick_spacing: i32) -> (i16, i16) {
    (tick_to_word(MIN_TICK, tick_spacing), tick_to_word(MAX_TICK, tick_spacing))
}

/// Words within `radius` of the word holding `tick`, clamped to the usable range.
pub fn word_range_around(tick: i32, tick_spacing: i32, radius: u16) -> (i16, i16) {
    let (min_word, max_word) = full_word_range(tick_spacing);
    let center = tick_to_word(tick, tick_spacing) as i32;
    let lower = (center - radius as i32).max(min_word as i32);
    let upper = (center + radius as i32).min(max_word as i32);
    (lower as i16, upper as i16)
}

/// Price, active liquidity and the known part of the tick map of a concentrated pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConcentratedState {
    pub sqrt_price_x96: U256,
    pub tick: i32,
    pub liquidity: u128,
    pub tick_spacing: i32,
    /// Initialized ticks inside `fetched_words` and their net liquidity.
    pub ticks: BTreeMap<i32, i128>,
    /// Inclusive range of bitmap words the tick map was read for.
    pub fetched_words: (i16, i16),
}

impl ConcentratedState {
    pub fn covers_tick(&self, tick: i32) -> bool {
        let word = tick_to_word(tick, self.tick_spacing);
        word >= self.fetched_words.0 && word <= self.fetched_words.1
    }

    pub fn covers_all_words(&self) -> bool {
        self.fetched_words == full_word_range(self.tick_spacing)
    }

    pub fn apply_swap(&mut self, sqrt_price_x96: U256, tick: i32, liquidity: u128) {
        self.sqrt_price_x96 = sqrt_price_x96;
        self.tick = tick;
        self.liquidity = liquidity;
    }

    pub fn apply_initialize(&mut self, sqrt_price_x96: U256, tick: i32) {
        self.sqrt_price_x96 = sqrt_price_x96;
        self.tick = tick;
    }

    /// Mint (positive `delta`) or burn (negative `delta`) of a position.
    ///
    /// Net liquidity is only tracked for ticks inside the fetched words. An underflow means
    /// the local view diverged from the chain and is reported as an invalid event.
    pub fn apply_liquidity_change(&mut self, tick_lower: i32, tick_upper: i32, delta: i128) -> ExtractorResult<()> {
        if tick_lower >= tick_upper {
            return Err(ExtractorError::InvalidEvent(format!("position range {tick_lower}..{tick_upper} is empty")));
        }
        if delta == 0 {
            return Ok(());
        }

        if self.tick >= tick_lower && self.tick < tick_upper {
            self.liquidity = if delta > 0 {
                self.liquidity.checked_add(delta.unsigned_abs())
            } else {
                self.liquidity.checked_sub(delta.unsigned_abs())
            }
            .ok_or_else(|| ExtractorError::InvalidEvent(format!("active liquidity {} cannot absorb {}", self.liquidity, delta)))?;
        }

        let lower_delta = delta;
        let upper_delta = delta.checked_neg().ok_or_else(|| ExtractorError::InvalidEvent(format!("liquidity delta {delta} overflows")))?;
        self.update_tick(tick_lower, lower_delta)?;
        self.update_tick(tick_upper, upper_delta)?;
        Ok(())
    }

    fn update_tick(&mut self, tick: i32, delta: i128) -> ExtractorResult<()> {
        if !self.covers_tick(tick) {
            return Ok(());
        }
        let current = self.ticks.get(&tick).copied().unwrap_or_default();
        let updated = current
            .checked_add(delta)
            .ok_or_else(|| ExtractorError::InvalidEvent(format!("net liquidity overflow at tick {tick}")))?;
        if updated == 0 {
            self.ticks.remove(&tick);
        } else {
            self.ticks.insert(tick, updated);
        }
        Ok(())
    }
}
