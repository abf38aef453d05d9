pub mod concentrated;
pub mod constant_product;
pub mod pool;
pub mod pool_code;

pub use concentrated::{ConcentratedState, full_word_range, tick_to_word, word_range_around};
pub use constant_product::ConstantProductState;
pub use pool::{AbiSwapEncoder, FactoryInfo, PoolClass, PoolInfo, PoolProtocol, PreswapRequirement, get_protocol_by_factory};
pub use pool_code::{PoolCode, PoolState};
