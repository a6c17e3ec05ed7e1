//! RocksDB storage backends
//!
//! One RocksDB instance holds every partition log of a node (one column
//! family per namespace plus a `{namespace}_meta` family for metadata)
//! and, optionally, the partition state in a `state` column family.

pub mod config;
mod log;
mod state;

pub use config::RocksDbConfig;
pub use log::RocksDbStorage;
pub use state::RocksDbStateBackend;
