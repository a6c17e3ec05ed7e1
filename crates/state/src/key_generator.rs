//! Partition-scoped key generation.
//!
//! Keys carry the partition id in their upper bits so that a key alone
//! identifies the partition owning the entity:
//! `key = (partition_id << 51) + counter`.

use tracing::trace;

use crate::{Column, ColumnFamily, StateError, StateRead, StateResult, Transaction};

const PARTITION_BIT_OFFSET: u32 = 51;

/// Highest partition id whose keys stay positive.
pub const MAX_PARTITION_ID: u32 = (1 << (63 - PARTITION_BIT_OFFSET)) - 1;
const COUNTER_MASK: i64 = (1 << PARTITION_BIT_OFFSET) - 1;

const LATEST_KEY: Column<str, i64> = Column::new(ColumnFamily::KEY);
const LATEST_KEY_NAME: &str = "latest";

/// Partition encoded in `key`.
pub fn partition_id_of(key: i64) -> u32 {
    (key >> PARTITION_BIT_OFFSET) as u32
}

fn first_key(partition_id: u32) -> StateResult<i64> {
    if partition_id > MAX_PARTITION_ID {
        return Err(StateError::PartitionOutOfRange(partition_id));
    }
    Ok((i64::from(partition_id) << PARTITION_BIT_OFFSET) + 1)
}

/// Hands out keys during one processing step.
///
/// The generator is loaded from state before a command is processed; keys
/// become durable only through [`KeyGenerator::set_key_if_higher`] when the
/// resulting events are applied, so a discarded attempt reuses its keys.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    partition_id: u32,
    next: i64,
}

impl KeyGenerator {
    /// Load the generator of `partition_id`.
    ///
    /// Fails for ids above [`MAX_PARTITION_ID`].
    pub fn load<R: StateRead + ?Sized>(partition_id: u32, state: &R) -> StateResult<Self> {
        let first = first_key(partition_id)?;
        let next = match LATEST_KEY.get(state, LATEST_KEY_NAME)? {
            Some(latest) => latest + 1,
            None => first,
        };
        Ok(Self { partition_id, next })
    }

    /// Partition the generator belongs to
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Peek at the key the next call to [`KeyGenerator::next_key`] returns.
    pub fn peek(&self) -> i64 {
        self.next
    }

    /// Hand out the next key.
    pub fn next_key(&mut self) -> StateResult<i64> {
        let key = self.next;
        if key & COUNTER_MASK == COUNTER_MASK {
            return Err(StateError::KeySpaceExhausted(self.partition_id));
        }
        self.next += 1;
        Ok(key)
    }

    /// Record `key` as used if it belongs to `partition_id` and is above the
    /// stored latest key.
    pub fn set_key_if_higher(
        txn: &mut Transaction<'_>,
        partition_id: u32,
        key: i64,
    ) -> StateResult<()> {
        if key < 0 || partition_id_of(key) != partition_id {
            return Ok(());
        }

        let latest = LATEST_KEY.get(txn, LATEST_KEY_NAME)?;
        if latest.is_none_or(|latest| key > latest) {
            trace!(partition_id, key, "Advancing latest key");
            LATEST_KEY.put(txn, LATEST_KEY_NAME, &key)?;
        }
        Ok(())
    }
}
