//! Chain storage.

pub mod chain;

pub use chain::{AddBlockResult, BlockChain};
