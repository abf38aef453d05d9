use alloy_primitives::aliases::{I24, U112};
use alloy_primitives::{Address, U256};
use alloy_sol_types::SolEvent;
use criterion::{Criterion, criterion_group, criterion_main};
use lazy_static::lazy_static;
use pool_extractor::data_sync::contracts::{IUniswapV2Pair, IUniswapV3Pool};
use pool_extractor::data_sync::{EventPosition, LogWindow, PoolEvent, RawLog};
use pool_extractor::pools::{ConcentratedState, full_word_range};
use std::collections::BTreeMap;

const BLOCKS: u64 = 1_000;
const LOGS_PER_BLOCK: u64 = 20;

fn raw(address: Address, data: alloy_primitives::LogData, block_number: u64, log_index: u64) -> RawLog {
    RawLog { address, topics: data.topics().to_vec(), data: data.data.clone(), block_number, log_index }
}

lazy_static! {
    static ref SYNC_LOGS: Vec<RawLog> = (1..=BLOCKS)
        .flat_map(|block| {
            (0..LOGS_PER_BLOCK).map(move |index| {
                let event = IUniswapV2Pair::Sync { reserve0: U112::from(block * 1_000 + index), reserve1: U112::from(block) };
                raw(Address::with_last_byte((index % 8) as u8), event.encode_log_data(), block, index)
            })
        })
        .collect();
    static ref MINT_LOGS: Vec<RawLog> = (0..1_000i32)
        .map(|i| {
            let event = IUniswapV3Pool::Mint {
                sender: Address::ZERO,
                owner: Address::ZERO,
                tickLower: I24::try_from(-60 * (i % 100 + 1)).unwrap(),
                tickUpper: I24::try_from(60 * (i % 100 + 1)).unwrap(),
                amount: 1_000,
                amount0: U256::ZERO,
                amount1: U256::ZERO,
            };
            raw(Address::repeat_byte(0x33), event.encode_log_data(), 1, i as u64)
        })
        .collect();
}

fn fill_window() {
    let mut window = LogWindow::new(50);
    let mut finalized = 0;
    for log in SYNC_LOGS.iter() {
        finalized += window.push(log.clone()).len();
    }
    assert!(finalized > 0);
    assert!(!window.logs_for(Address::with_last_byte(1), EventPosition::end_of_block(BLOCKS - 10)).is_empty());
}

fn apply_mints() {
    let mut state = ConcentratedState {
        sqrt_price_x96: U256::from(1u64) << 96,
        tick: 0,
        liquidity: 0,
        tick_spacing: 60,
        ticks: BTreeMap::new(),
        fetched_words: full_word_range(60),
    };
    for log in MINT_LOGS.iter() {
        if let Ok(Some(PoolEvent::Mint { tick_lower, tick_upper, amount })) = PoolEvent::decode(log) {
            state.apply_liquidity_change(tick_lower, tick_upper, amount as i128).unwrap();
        }
    }
    assert_eq!(state.liquidity, 1_000_000);
}

fn benchmark_log_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_window");
    group.sample_size(10);

    group.bench_function("fill_window", |b| b.iter(fill_window));
    group.bench_function("apply_mints", |b| b.iter(apply_mints));
    group.finish();
}

criterion_group!(benches, benchmark_log_window);
criterion_main!(benches);
