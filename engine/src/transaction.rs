//! Read and write transactions over a store snapshot.
//!
//! A transaction records which keys it read (`get`/`has`) and which keys it
//! walked while scanning. The two sets are kept apart because subscriptions
//! use them differently: a read-set hit means a value the query consumed
//! changed, while scan-set drift means range membership changed.
//!
//! Write transactions never touch the store. Their writes land in a
//! transaction-local override map that reads consult first, and in an
//! ordered operation buffer the mutation engine turns into a pending
//! mutation on commit.

use crate::{
    entry::KvUpdate,
    error::Result,
    store::Snapshot,
    ClientId, Key, Operation,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::sync::Arc;

/// Where a scan starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStart {
    pub key: Key,
    #[serde(default)]
    pub exclusive: bool,
}

/// Options for [`ReadTransaction::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<ScanStart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ScanOptions {
    /// Scan every key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only keys starting with `prefix`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Start at the first key `>= key`.
    ///
    /// `key` need not exist; a missing key does not widen the scan to the
    /// whole range.
    pub fn start_at(mut self, key: impl Into<Key>) -> Self {
        self.start = Some(ScanStart {
            key: key.into(),
            exclusive: false,
        });
        self
    }

    /// Start at the first key `> key`. `key` need not exist.
    pub fn start_after(mut self, key: impl Into<Key>) -> Self {
        self.start = Some(ScanStart {
            key: key.into(),
            exclusive: true,
        });
        self
    }

    /// Return at most `limit` keys.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn admits(&self, key: &str) -> bool {
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        match &self.start {
            Some(start) if start.exclusive => key > start.key.as_str(),
            Some(start) => key >= start.key.as_str(),
            None => true,
        }
    }
}

impl From<&str> for ScanOptions {
    fn from(prefix: &str) -> Self {
        ScanOptions::new().prefix(prefix)
    }
}

impl From<String> for ScanOptions {
    fn from(prefix: String) -> Self {
        ScanOptions::new().prefix(prefix)
    }
}

#[derive(Debug, Default)]
struct TxState {
    overrides: BTreeMap<Key, KvUpdate>,
    operations: Vec<Operation>,
    read_keys: BTreeSet<Key>,
    scanned_keys: BTreeSet<Key>,
}

#[derive(Debug)]
struct TxInner {
    snapshot: Snapshot,
    client_id: ClientId,
    state: Mutex<TxState>,
}

/// A read-only view that records what it reads.
///
/// Cloning is cheap and clones share the same read-set and scan-set.
#[derive(Debug, Clone)]
pub struct ReadTransaction {
    inner: Arc<TxInner>,
}

impl ReadTransaction {
    /// Create a transaction over a snapshot.
    pub fn new(snapshot: Snapshot, client_id: impl Into<ClientId>) -> Self {
        Self {
            inner: Arc::new(TxInner {
                snapshot,
                client_id: client_id.into(),
                state: Mutex::new(TxState::default()),
            }),
        }
    }

    /// Id of the client running this transaction.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Get the value of `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.inner.state.lock();
        state.read_keys.insert(key.to_string());
        self.inner
            .snapshot
            .get_with(&state.overrides, key)
            .cloned()
    }

    /// Get the value of `key` decoded into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Check if `key` has a visible value.
    pub fn has(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        state.read_keys.insert(key.to_string());
        self.inner.snapshot.get_with(&state.overrides, key).is_some()
    }

    /// Check if no key is visible.
    ///
    /// The first visible key is recorded in the scan-set, so the answer is
    /// invalidated when the space becomes empty or non-empty.
    pub fn is_empty(&self) -> bool {
        let mut state = self.inner.state.lock();
        let first = self
            .inner
            .snapshot
            .keys_with(&state.overrides)
            .into_iter()
            .next();
        match first {
            Some(key) => {
                state.scanned_keys.insert(key);
                false
            }
            None => true,
        }
    }

    /// Scan a sorted range of keys.
    ///
    /// The key range is fixed when `scan` is called. Keys are recorded in the
    /// scan-set only as they are iterated.
    pub fn scan(&self, options: impl Into<ScanOptions>) -> ScanResult {
        let options = options.into();
        let keys: Vec<Key> = {
            let state = self.inner.state.lock();
            self.inner
                .snapshot
                .keys_with(&state.overrides)
                .into_iter()
                .filter(|key| options.admits(key))
                .take(options.limit.unwrap_or(usize::MAX))
                .collect()
        };
        ScanResult {
            keys,
            tx: self.clone(),
        }
    }

    /// Keys consulted through `get`/`has` so far.
    pub fn read_keys(&self) -> BTreeSet<Key> {
        self.inner.state.lock().read_keys.clone()
    }

    /// Keys walked by scans so far.
    pub fn scanned_keys(&self) -> BTreeSet<Key> {
        self.inner.state.lock().scanned_keys.clone()
    }

    fn record_scanned(&self, key: &str) {
        self.inner.state.lock().scanned_keys.insert(key.to_string());
    }

    fn write(&self, op: Operation) {
        let mut state = self.inner.state.lock();
        let update = match &op {
            Operation::Set { value, .. } => KvUpdate::Set(value.clone()),
            Operation::Del { .. } => KvUpdate::Delete,
        };
        state.overrides.insert(op.key().clone(), update);
        state.operations.push(op);
    }

    fn operations(&self) -> Vec<Operation> {
        self.inner.state.lock().operations.clone()
    }
}

/// A transaction that buffers writes on top of a snapshot.
///
/// Reads see the transaction's own writes. Nothing is visible to other
/// transactions until the mutation engine commits the buffer.
#[derive(Debug, Clone)]
pub struct WriteTransaction {
    tx: ReadTransaction,
}

impl WriteTransaction {
    /// Create a write transaction over a snapshot.
    pub fn new(snapshot: Snapshot, client_id: impl Into<ClientId>) -> Self {
        Self {
            tx: ReadTransaction::new(snapshot, client_id),
        }
    }

    /// Store `value` under `key`.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) {
        self.tx.write(Operation::set(key, value.into()));
    }

    /// Alias for [`WriteTransaction::set`].
    pub fn put(&self, key: impl Into<Key>, value: impl Into<Value>) {
        self.set(key, value);
    }

    /// Store any serializable value under `key`.
    pub fn set_as<T: Serialize>(&self, key: impl Into<Key>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    /// Remove `key`.
    pub fn delete(&self, key: impl Into<Key>) {
        self.tx.write(Operation::del(key));
    }

    /// Alias for [`WriteTransaction::delete`].
    pub fn del(&self, key: impl Into<Key>) {
        self.delete(key);
    }

    /// Buffered writes, in call order.
    pub fn operations(&self) -> Vec<Operation> {
        self.tx.operations()
    }
}

impl Deref for WriteTransaction {
    type Target = ReadTransaction;

    fn deref(&self) -> &ReadTransaction {
        &self.tx
    }
}

/// The result of a scan, consumed through one of its views.
#[derive(Debug)]
pub struct ScanResult {
    keys: Vec<Key>,
    tx: ReadTransaction,
}

impl ScanResult {
    /// Iterate over keys only. Values are not read.
    pub fn keys(self) -> ScanKeys {
        ScanKeys {
            keys: self.keys.into_iter(),
            tx: self.tx,
        }
    }

    /// Iterate over values. Each value is read through the transaction.
    pub fn values(self) -> ScanValues {
        ScanValues {
            keys: self.keys.into_iter(),
            tx: self.tx,
        }
    }

    /// Iterate over `(key, value)` pairs.
    pub fn entries(self) -> ScanEntries {
        ScanEntries {
            keys: self.keys.into_iter(),
            tx: self.tx,
        }
    }
}

impl IntoIterator for ScanResult {
    type Item = Value;
    type IntoIter = ScanValues;

    fn into_iter(self) -> ScanValues {
        self.values()
    }
}

/// Lazy key view of a scan.
#[derive(Debug)]
pub struct ScanKeys {
    keys: std::vec::IntoIter<Key>,
    tx: ReadTransaction,
}

impl ScanKeys {
    /// Drain the remaining keys.
    pub fn to_array(self) -> Vec<Key> {
        self.collect()
    }
}

impl Iterator for ScanKeys {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        let key = self.keys.next()?;
        self.tx.record_scanned(&key);
        Some(key)
    }
}

/// Lazy value view of a scan.
#[derive(Debug)]
pub struct ScanValues {
    keys: std::vec::IntoIter<Key>,
    tx: ReadTransaction,
}

impl ScanValues {
    /// Drain the remaining values.
    pub fn to_array(self) -> Vec<Value> {
        self.collect()
    }
}

impl Iterator for ScanValues {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        for key in self.keys.by_ref() {
            self.tx.record_scanned(&key);
            if let Some(value) = self.tx.get(&key) {
                return Some(value);
            }
        }
        None
    }
}

/// Lazy entry view of a scan.
#[derive(Debug)]
pub struct ScanEntries {
    keys: std::vec::IntoIter<Key>,
    tx: ReadTransaction,
}

impl ScanEntries {
    /// Drain the remaining entries.
    pub fn to_array(self) -> Vec<(Key, Value)> {
        self.collect()
    }
}

impl Iterator for ScanEntries {
    type Item = (Key, Value);

    fn next(&mut self) -> Option<(Key, Value)> {
        for key in self.keys.by_ref() {
            self.tx.record_scanned(&key);
            if let Some(value) = self.tx.get(&key) {
                return Some((key, value));
            }
        }
        None
    }
}
