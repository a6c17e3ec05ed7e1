//! Typed access to one column family.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

use crate::store::{decode_value, encode_value};
use crate::{ColumnFamily, DbKey, StateRead, StateResult, Transaction};

/// Keys of type `K` mapped to CBOR-encoded values of type `V` within one
/// column family.
pub struct Column<K: ?Sized, V> {
    cf: ColumnFamily,
    _marker: PhantomData<fn(&K) -> V>,
}

impl<K: ?Sized, V> Clone for Column<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: ?Sized, V> Copy for Column<K, V> {}

impl<K: ?Sized, V> std::fmt::Debug for Column<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Column").field(&self.cf).finish()
    }
}

impl<K, V> Column<K, V>
where
    K: DbKey + ?Sized,
    V: Serialize + DeserializeOwned,
{
    /// Column over `cf`
    pub const fn new(cf: ColumnFamily) -> Self {
        Self {
            cf,
            _marker: PhantomData,
        }
    }

    /// The column family
    pub fn column_family(&self) -> ColumnFamily {
        self.cf
    }

    /// Look a value up
    pub fn get<R: StateRead + ?Sized>(&self, state: &R, key: &K) -> StateResult<Option<V>> {
        state
            .get_raw(&self.cf.key(key))?
            .map(|bytes| decode_value(self.cf, &bytes))
            .transpose()
    }

    /// Whether `key` is present
    pub fn exists<R: StateRead + ?Sized>(&self, state: &R, key: &K) -> StateResult<bool> {
        Ok(state.get_raw(&self.cf.key(key))?.is_some())
    }

    /// Insert or overwrite
    pub fn put(&self, txn: &mut Transaction<'_>, key: &K, value: &V) -> StateResult<()> {
        txn.put_raw(self.cf.key(key), encode_value(value)?);
        Ok(())
    }

    /// Remove a key
    pub fn delete(&self, txn: &mut Transaction<'_>, key: &K) {
        txn.delete_raw(self.cf.key(key));
    }

    /// All values in key order
    pub fn values<R: StateRead + ?Sized>(&self, state: &R) -> StateResult<Vec<V>> {
        state
            .scan_raw(&self.cf.prefix())?
            .into_iter()
            .map(|(_, bytes)| decode_value(self.cf, &bytes))
            .collect()
    }

    /// Number of stored keys
    pub fn count<R: StateRead + ?Sized>(&self, state: &R) -> StateResult<usize> {
        Ok(state.scan_raw(&self.cf.prefix())?.len())
    }
}
