// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Local storage of cache entries.
use crate::command::{Key, Value};
use fnv::FnvHashMap;
use std::sync::{PoisonError, RwLock};

/// A member's local store of cache entries.
///
/// Implementations must be safe to call from many tasks at once; the rehash protocol reads
/// and writes entries while normal cache traffic is ongoing.
pub trait DataContainer: Send + Sync + 'static {
    /// Returns the value stored for `key`.
    fn get(&self, key: &[u8]) -> Option<Value>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: Key, value: Value);

    /// Remove the entry for `key`, returning its value.
    fn remove(&self, key: &[u8]) -> Option<Value>;

    /// Returns a snapshot of all stored keys.
    fn keys(&self) -> Vec<Key>;

    /// Returns a snapshot of all stored entries.
    fn entries(&self) -> Vec<(Key, Value)>;

    /// Returns the number of stored entries.
    fn len(&self) -> usize;

    /// Returns true if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [DataContainer] backed by a hash map.
#[derive(Default)]
pub struct MemoryContainer {
    map: RwLock<FnvHashMap<Key, Value>>,
}

impl MemoryContainer {
    /// Returns an empty container.
    pub fn new() -> Self {
        Self::default()
    }
}

// a panic while holding the lock can't leave the map itself in a torn state
macro_rules! read {
    ($lock:expr) => {
        $lock.read().unwrap_or_else(PoisonError::into_inner)
    };
}

macro_rules! write {
    ($lock:expr) => {
        $lock.write().unwrap_or_else(PoisonError::into_inner)
    };
}

impl DataContainer for MemoryContainer {
    fn get(&self, key: &[u8]) -> Option<Value> {
        read!(self.map).get(key).cloned()
    }

    fn put(&self, key: Key, value: Value) {
        write!(self.map).insert(key, value);
    }

    fn remove(&self, key: &[u8]) -> Option<Value> {
        write!(self.map).remove(key)
    }

    fn keys(&self) -> Vec<Key> {
        read!(self.map).keys().cloned().collect()
    }

    fn entries(&self) -> Vec<(Key, Value)> {
        (read!(self.map).iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        read!(self.map).len()
    }
}
