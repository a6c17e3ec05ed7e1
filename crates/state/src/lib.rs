//! Embedded, column-family partitioned state store
//!
//! All derived state of a partition lives here. Column families are
//! namespaces inside one ordered key space: every stored key is
//! `[column family id: u16 BE][encoded entity key]`.
//!
//! Processors read through [`StateRead`]; only the engine's event
//! application step writes, through a [`Transaction`] that commits
//! atomically together with the [`ProcessingPosition`] marker.

pub mod backend;
pub mod column;
pub mod column_family;
pub mod error;
pub mod exporter;
pub mod key_generator;
pub mod position;
pub mod snapshot;
pub mod store;

pub use backend::{MemoryStateBackend, StateBackend, WriteOp};
pub use column::Column;
pub use column_family::{ColumnFamily, DbKey};
pub use error::{StateError, StateResult};
pub use exporter::ExporterPositions;
pub use key_generator::{KeyGenerator, MAX_PARTITION_ID, partition_id_of};
pub use position::ProcessingPosition;
pub use snapshot::StateSnapshot;
pub use store::{SCHEMA_VERSION, StateRead, StateStore, StateView, Transaction};
