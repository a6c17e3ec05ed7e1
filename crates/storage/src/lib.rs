//! Log storage for conductor partitions
//!
//! This crate provides two layers:
//! - an index-addressed [`LogStorage`] trait that backends implement
//!   (memory, RocksDB), storing opaque byte entries per namespace
//! - a position-addressed [`BlockLog`] on top of it, which stores
//!   [`LogBlock`]s, maintains a position index, tracks the commit
//!   watermark and hands out seekable [`LogReader`]s
//!
//! Appends from the processing side go through the [`LogAppender`], a
//! single writer task that writes blocks in submission order and reports
//! completion through an [`AppendListener`].

pub mod adaptor;
pub mod appender;
pub mod block;
pub mod block_log;
pub mod log;
pub mod manager;
pub mod position;
pub mod reader;

// Re-export the essential types
pub use adaptor::StorageAdaptor;
pub use appender::{AppendListener, CommitMode, LogAppender};
pub use block::{BlockKind, LogBlock};
pub use block_log::{BlockAddress, BlockLog, CommitWatermark};
pub use log::{
    LogStorage, LogStorageStreaming, StorageError, StorageNamespace, StorageResult,
};
pub use manager::StorageManager;
pub use position::{NO_POSITION, Position, PositionAllocator};
pub use reader::LogReader;
