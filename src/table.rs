use std::collections::HashMap;
use std::mem;

use itertools::Itertools as _;

use crate::error::{Error, Result};

/// In-memory key table for the reduce and group passes. Ids are handed out
/// in first-arrival order and `iter` replays that order, so emission is
/// deterministic regardless of hash-map layout. Growth is charged against
/// a byte budget; exceeding it is a hard error, not a spill.
pub struct KeyTable<V> {
    index: HashMap<Vec<u8>, u32>,
    values: Vec<V>,
    used: usize,
    limit: usize,
}

impl<V> KeyTable<V> {
    pub fn with_budget(limit: usize) -> Self {
        Self {
            index: HashMap::new(),
            values: Vec::new(),
            used: 0,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Charges arena growth held outside the table (value chains) against
    /// the same budget.
    pub fn charge(&mut self, bytes: usize) -> Result<()> {
        self.used += bytes;
        if self.used > self.limit {
            return Err(Error::MemoryBudget {
                used: self.used,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Value slot for `key`, inserting `init()` on first arrival.
    pub fn upsert_with(&mut self, key: &[u8], init: impl FnOnce() -> V) -> Result<&mut V> {
        let id = match self.index.get(key) {
            Some(&id) => id,
            None => {
                let id = self.values.len() as u32;
                self.index.insert(key.to_vec(), id);
                self.values.push(init());
                self.charge(key.len() + mem::size_of::<V>())?;
                id
            }
        };
        Ok(&mut self.values[id as usize])
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.index.get(key).map(|&id| &self.values[id as usize])
    }

    /// Entries in first-arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &V)> {
        self.index
            .iter()
            .map(|(key, &id)| (id, key))
            .sorted_by_key(|&(id, _)| id)
            .map(|(id, key)| (key.as_slice(), &self.values[id as usize]))
    }
}
