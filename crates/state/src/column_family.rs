//! Column family identifiers and key encoding.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A namespace in the state key space.
///
/// Ids below [`ColumnFamily::FIRST_APPLICATION_ID`] are reserved for the
/// engine's own bookkeeping; processors define theirs with
/// [`ColumnFamily::application`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnFamily(u16);

impl ColumnFamily {
    /// Catch-all family
    pub const DEFAULT: Self = Self(0);
    /// Key generator state
    pub const KEY: Self = Self(1);
    /// Engine metadata: schema version and processing position
    pub const META: Self = Self(2);
    /// Acknowledged exporter positions
    pub const EXPORTER: Self = Self(3);

    /// First id handed to application column families
    pub const FIRST_APPLICATION_ID: u16 = 64;

    /// Application column family number `id`.
    pub const fn application(id: u16) -> Self {
        Self(Self::FIRST_APPLICATION_ID.saturating_add(id))
    }

    /// Raw id
    pub const fn id(self) -> u16 {
        self.0
    }

    /// The two-byte prefix every key of this family starts with.
    pub fn prefix(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Full backend key for `key` in this family.
    pub fn key<K: DbKey + ?Sized>(self, key: &K) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.prefix());
        key.write_key(&mut buf);
        buf
    }
}

impl fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DEFAULT => write!(f, "default"),
            Self::KEY => write!(f, "key"),
            Self::META => write!(f, "meta"),
            Self::EXPORTER => write!(f, "exporter"),
            Self(id) => write!(f, "cf-{id}"),
        }
    }
}

/// Order-preserving key encoding.
///
/// Integers are big endian (signed ones with the sign bit flipped), strings
/// are length prefixed so that composite keys stay prefix free.
pub trait DbKey {
    /// Append the encoded key to `buf`
    fn write_key(&self, buf: &mut Vec<u8>);
}

impl DbKey for () {
    fn write_key(&self, _buf: &mut Vec<u8>) {}
}

impl DbKey for u64 {
    fn write_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }
}

impl DbKey for i64 {
    fn write_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&((*self as u64) ^ (1 << 63)).to_be_bytes());
    }
}

impl DbKey for u32 {
    fn write_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }
}

impl DbKey for str {
    fn write_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.as_bytes());
    }
}

impl DbKey for String {
    fn write_key(&self, buf: &mut Vec<u8>) {
        self.as_str().write_key(buf);
    }
}

impl<A: DbKey, B: DbKey> DbKey for (A, B) {
    fn write_key(&self, buf: &mut Vec<u8>) {
        self.0.write_key(buf);
        self.1.write_key(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefixed_by_family() {
        let key = ColumnFamily::KEY.key(&7u64);
        assert_eq!(&key[..2], &[0, 1]);
        assert_eq!(&key[2..], &7u64.to_be_bytes());
    }

    #[test]
    fn test_signed_keys_keep_order() {
        let neg = ColumnFamily::DEFAULT.key(&-5i64);
        let zero = ColumnFamily::DEFAULT.key(&0i64);
        let pos = ColumnFamily::DEFAULT.key(&5i64);
        assert!(neg < zero && zero < pos);
    }

    #[test]
    fn test_composite_string_keys_are_prefix_free() {
        let a = ColumnFamily::application(1).key(&("ab".to_string(), 1u64));
        let b = ColumnFamily::application(1).key(&("a".to_string(), 1u64));
        assert!(!a.starts_with(&b));
    }

    #[test]
    fn test_application_ids_skip_reserved_range() {
        assert_eq!(ColumnFamily::application(0).id(), 64);
        assert_eq!(ColumnFamily::application(0).to_string(), "cf-64");
    }
}
