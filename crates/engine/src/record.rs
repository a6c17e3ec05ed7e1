//! Records: the unit of processing.
//!
//! An application block of the log carries a CBOR encoded list of records
//! whose positions cover exactly the block's position range.

use std::fmt;

use bytes::Bytes;
use conductor_storage::{LogBlock, NO_POSITION, Position};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, Error};

/// Current version of records written by this build
pub const RECORD_VERSION: u16 = 1;

/// What a record is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// A request to change state
    Command,
    /// A state change that happened
    Event,
    /// A command that was refused
    CommandRejection,
}

/// Why a command was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionType {
    /// The command's value is malformed
    InvalidArgument,
    /// The referenced entity does not exist
    NotFound,
    /// The entity exists already
    AlreadyExists,
    /// The entity is in the wrong state
    InvalidState,
    /// The processor failed
    ProcessingError,
    /// The command produced more records than one batch holds
    ExceededBatchRecordSize,
    /// No processor handles the command
    Unimplemented,
}

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create from a name
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// The name
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(name)
            }
        }
    };
}

name_type!(
    /// Kind of entity a record is about, such as `JOB` or `TIMER`
    ValueType
);

name_type!(
    /// What a record says about its entity, such as `CREATE` or `CREATED`
    Intent
);

/// One entry of a partition's record stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Position in the log, [`NO_POSITION`] until written
    pub position: Position,
    /// Position of the command this record was produced for
    pub source_record_position: Position,
    /// Key of the entity, `-1` when none is assigned
    pub key: i64,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    /// Partition the record belongs to
    pub partition_id: u32,
    /// Record type
    pub record_type: RecordType,
    /// Value type
    pub value_type: ValueType,
    /// Intent
    pub intent: Intent,
    /// Version of the record's schema, selects the event applier
    pub record_version: u16,
    /// Set on rejections
    pub rejection_type: Option<RejectionType>,
    /// Set on rejections
    pub rejection_reason: Option<String>,
    /// Request the response is routed to
    pub request_id: Option<u64>,
    /// Stream the request arrived on
    pub request_stream_id: Option<u32>,
    /// Payload
    pub value: serde_json::Value,
}

impl Record {
    /// A client command, not yet written
    pub fn command(
        value_type: impl Into<ValueType>,
        intent: impl Into<Intent>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            position: NO_POSITION,
            source_record_position: NO_POSITION,
            key: -1,
            timestamp: chrono::Utc::now().timestamp_millis(),
            partition_id: 0,
            record_type: RecordType::Command,
            value_type: value_type.into(),
            intent: intent.into(),
            record_version: RECORD_VERSION,
            rejection_type: None,
            rejection_reason: None,
            request_id: None,
            request_stream_id: None,
            value,
        }
    }

    /// Address the command to an existing entity
    pub fn with_key(mut self, key: i64) -> Self {
        self.key = key;
        self
    }

    /// Whether this is a command
    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    /// Whether this is an event
    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }

    /// Whether this is a rejection
    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }

    /// Whether a processor wrote this record
    pub fn is_follow_up(&self) -> bool {
        self.source_record_position >= 0
    }

    /// Deserialize the value
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }
}

/// Encode records as a block payload
pub(crate) fn encode_records(records: &[Record]) -> EngineResult<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(records, &mut buf)
        .map_err(|e| Error::codec(format!("Failed to encode records: {e}")))?;
    Ok(buf.into())
}

/// Encoded size of one record
pub(crate) fn encoded_len(record: &Record) -> EngineResult<usize> {
    let mut buf = Vec::new();
    ciborium::into_writer(record, &mut buf)
        .map_err(|e| Error::codec(format!("Failed to encode record: {e}")))?;
    Ok(buf.len())
}

/// Decode the records of an application block.
///
/// The records must cover the block's position range one by one.
pub fn decode_records(block: &LogBlock) -> EngineResult<Vec<Record>> {
    let records: Vec<Record> = ciborium::from_reader(block.payload.as_ref()).map_err(|e| {
        Error::codec(format!(
            "Failed to decode block [{}, {}]: {e}",
            block.lowest_position, block.highest_position
        ))
    })?;

    let expected = (block.lowest_position..=block.highest_position).count();
    let contiguous = records
        .iter()
        .zip(block.lowest_position..)
        .all(|(record, position)| record.position == position);
    if records.len() != expected || !contiguous {
        return Err(Error::codec(format!(
            "Block [{}, {}] holds {} records with mismatching positions",
            block.lowest_position,
            block.highest_position,
            records.len()
        )));
    }

    Ok(records)
}
