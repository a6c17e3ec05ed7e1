//! Log blocks: the unit of storage and replication.
//!
//! Wire layout (big endian):
//!
//! ```text
//! | version u8 | kind u8 | term u64 | lowest i64 | highest i64 | len u32 | payload | crc32 u32 |
//! ```
//!
//! The checksum covers every byte before it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{NO_POSITION, Position, StorageError, StorageResult};

const BLOCK_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 1 + 8 + 8 + 8 + 4;
const CHECKSUM_LEN: usize = 4;

/// What a block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// No-op entry appended by a new leader; carries no positions and is
    /// skipped by readers.
    Initial,
    /// Application payload covering `[lowest_position, highest_position]`.
    Application,
}

impl BlockKind {
    fn as_byte(self) -> u8 {
        match self {
            BlockKind::Initial => 0,
            BlockKind::Application => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(BlockKind::Initial),
            1 => Some(BlockKind::Application),
            _ => None,
        }
    }
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlock {
    /// Raft term the block was appended in
    pub term: u64,
    /// Block kind
    pub kind: BlockKind,
    /// First record position in the payload
    pub lowest_position: Position,
    /// Last record position in the payload
    pub highest_position: Position,
    /// Opaque payload, an encoded record batch for application blocks
    pub payload: Bytes,
}

impl LogBlock {
    /// Application block covering `[lowest, highest]`.
    pub fn application(term: u64, lowest: Position, highest: Position, payload: Bytes) -> Self {
        Self {
            term,
            kind: BlockKind::Application,
            lowest_position: lowest,
            highest_position: highest,
            payload,
        }
    }

    /// The no-op block a leader appends when it takes over.
    pub fn initial(term: u64) -> Self {
        Self {
            term,
            kind: BlockKind::Initial,
            lowest_position: NO_POSITION,
            highest_position: NO_POSITION,
            payload: Bytes::new(),
        }
    }

    /// Whether this block carries records.
    pub fn is_application(&self) -> bool {
        self.kind == BlockKind::Application
    }

    /// Whether `position` falls inside this block.
    pub fn contains(&self, position: Position) -> bool {
        self.is_application()
            && self.lowest_position <= position
            && position <= self.highest_position
    }

    /// Serialize the block including its checksum.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        buf.put_u8(BLOCK_VERSION);
        buf.put_u8(self.kind.as_byte());
        buf.put_u64(self.term);
        buf.put_i64(self.lowest_position);
        buf.put_i64(self.highest_position);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        buf.freeze()
    }

    /// Deserialize a block stored at `index`.
    ///
    /// Any structural problem or checksum mismatch is reported as
    /// [`StorageError::Corrupted`].
    pub fn decode(index: u64, data: &Bytes) -> StorageResult<Self> {
        let corrupted = |reason: &str| StorageError::Corrupted {
            index,
            reason: reason.to_string(),
        };

        if data.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(corrupted("block shorter than header"));
        }

        let body_len = data.len() - CHECKSUM_LEN;
        let expected = (&data[body_len..]).get_u32();
        if crc32fast::hash(&data[..body_len]) != expected {
            return Err(corrupted("checksum mismatch"));
        }

        let mut header = &data[..HEADER_LEN];
        let version = header.get_u8();
        if version != BLOCK_VERSION {
            return Err(corrupted(&format!("unknown block version {version}")));
        }
        let kind = BlockKind::from_byte(header.get_u8()).ok_or_else(|| corrupted("bad kind"))?;
        let term = header.get_u64();
        let lowest_position = header.get_i64();
        let highest_position = header.get_i64();
        let len = header.get_u32() as usize;

        if HEADER_LEN + len != body_len {
            return Err(corrupted("payload length mismatch"));
        }
        if kind == BlockKind::Application && lowest_position > highest_position {
            return Err(corrupted("inverted position range"));
        }

        Ok(Self {
            term,
            kind,
            lowest_position,
            highest_position,
            payload: data.slice(HEADER_LEN..body_len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_block_codec() {
        let block = LogBlock::application(3, 10, 12, Bytes::from_static(b"records"));
        let decoded = LogBlock::decode(7, &block.encode()).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.contains(11));
        assert!(!decoded.contains(13));
    }

    #[test]
    fn test_initial_block_has_no_positions() {
        let block = LogBlock::initial(2);
        let decoded = LogBlock::decode(1, &block.encode()).unwrap();
        assert_eq!(decoded.kind, BlockKind::Initial);
        assert!(!decoded.contains(NO_POSITION));
    }

    #[test]
    fn test_flipped_bit_is_corruption() {
        let mut raw = LogBlock::application(1, 1, 1, Bytes::from_static(b"x"))
            .encode()
            .to_vec();
        raw[HEADER_LEN] ^= 0xff;

        let err = LogBlock::decode(4, &Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { index: 4, .. }));
    }

    #[test]
    fn test_truncated_block_is_corruption() {
        let raw = LogBlock::application(1, 1, 1, Bytes::new()).encode();
        let err = LogBlock::decode(1, &raw.slice(..10)).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. }));
    }
}
