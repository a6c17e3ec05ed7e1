//! Leader-based replication of a partition's block log
//!
//! One [`RaftServer`] task runs per partition member. The leader validates
//! and appends blocks, replicates them to followers over a
//! [`conductor_transport::Transport`] and advances the log's commit
//! watermark once a quorum holds an entry. Followers validate every block
//! they receive before writing it.

pub mod config;
pub mod election;
pub mod error;
pub mod handle;
pub mod message;
mod metadata;
pub mod quorum;
pub mod server;
pub mod validator;

pub use config::RaftConfig;
pub use election::{Election, ElectionOutcome};
pub use error::{RaftError, RaftResult};
pub use handle::{RaftHandle, RaftStatus, Role};
pub use message::RaftMessage;
pub use quorum::Quorum;
pub use server::RaftServer;
pub use validator::{EntryValidator, GapValidator, ValidationError};
