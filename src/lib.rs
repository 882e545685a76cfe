//! nocta-node — a CryptoNote-family cryptocurrency node.
//!
//! The crate centers on chain synchronization: a multi-peer block
//! downloader that discovers the best chain through sparse locators,
//! fetches blocks in parallel with per-peer fairness and slacker
//! eviction, verifies proof-of-work on a dedicated worker pool, and
//! applies blocks to the chain store in strict height order.
//!
//! ## Layout
//!
//! - [`primitives`] — hashes, serialization, block types
//! - [`pow`] — the slow hash and target checks
//! - [`storage`] — the chain store
//! - [`network`] — framing, protocol messages, connection lifecycle
//! - [`node`] — the event loop, the downloader, the PoW worker pool
//! - [`config`] — network parameters and node configuration

pub mod config;
pub mod network;
pub mod node;
pub mod pow;
pub mod primitives;
pub mod storage;

pub use config::{NetworkParams, NodeConfig, SyncConfig};
pub use node::downloader::Downloader;
pub use node::Node;
pub use primitives::{Hash, Height, PreparedBlock, RawBlock};
pub use storage::{AddBlockResult, BlockChain};
