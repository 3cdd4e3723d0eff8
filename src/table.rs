//! Fixed-capacity keyed slot tables
//!
//! A `SlotTable` owns a bounded array of rows addressed by 1-based ids.
//! Freed ids are reused lowest-first, so the id space observed by readers
//! never grows past the configured capacity. Rows that expose a business
//! key are indexed for constant-time lookup.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;
use thiserror::Error;

/// A row that can live in a [`SlotTable`]
pub trait Record: Clone + Serialize + DeserializeOwned {
    type Key: Clone + Eq + Hash;

    /// Business key, or `None` when the row must not be reachable by key
    fn key(&self) -> Option<Self::Key>;
    fn id(&self) -> usize;
    fn set_id(&mut self, id: usize);
}

/// Errors from slot table operations
#[derive(Debug, Error)]
pub enum TableError {
    #[error("{table} table is full")]
    Full { table: &'static str },

    #[error("{table} table holds {rows} rows but capacity is {capacity}")]
    Capacity {
        table: &'static str,
        rows: usize,
        capacity: usize,
    },

    #[error("failed to access {table} table storage: {source}")]
    Io {
        table: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt {table} table storage: {source}")]
    Corrupt {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

struct Slots<T: Record> {
    rows: Vec<Option<T>>,
    index: HashMap<T::Key, usize>,
}

impl<T: Record> Slots<T> {
    fn unindex(&mut self, id: usize) {
        if let Some(Some(old)) = self.rows.get(id - 1) {
            if let Some(key) = old.key() {
                if self.index.get(&key) == Some(&id) {
                    self.index.remove(&key);
                }
            }
        }
    }

    fn store(&mut self, id: usize, mut record: T) {
        self.unindex(id);
        record.set_id(id);
        if let Some(key) = record.key() {
            self.index.insert(key, id);
        }
        self.rows[id - 1] = Some(record);
    }
}

/// Bounded table of records
pub struct SlotTable<T: Record> {
    name: &'static str,
    inner: RwLock<Slots<T>>,
}

impl<T: Record> SlotTable<T> {
    /// Create a table. A capacity of zero yields a table that rejects every insert.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            inner: RwLock::new(Slots {
                rows: vec![None; capacity],
                index: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_size(&self) -> usize {
        self.inner.read().rows.len()
    }

    /// Number of occupied slots
    pub fn used(&self) -> usize {
        self.inner.read().rows.iter().filter(|r| r.is_some()).count()
    }

    /// Ids of occupied slots in ascending order
    pub fn ids_used(&self) -> Vec<usize> {
        self.inner
            .read()
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|_| i + 1))
            .collect()
    }

    pub fn get(&self, id: usize) -> Option<T> {
        if id == 0 {
            return None;
        }
        self.inner.read().rows.get(id - 1).cloned().flatten()
    }

    pub fn find(&self, key: &T::Key) -> Option<T> {
        let inner = self.inner.read();
        let id = *inner.index.get(key)?;
        inner.rows[id - 1].clone()
    }

    /// All rows ordered by id
    pub fn rows(&self) -> Vec<T> {
        self.inner.read().rows.iter().flatten().cloned().collect()
    }

    /// Rows matching `pred`, ordered by id
    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.inner
            .read()
            .rows
            .iter()
            .flatten()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    /// Update the row sharing `record`'s key in place, or allocate the
    /// lowest free slot for it. Returns the row id.
    pub fn insert_or_update(&self, record: T) -> Result<usize, TableError> {
        let mut inner = self.inner.write();
        let existing = record.key().and_then(|k| inner.index.get(&k).copied());
        let id = match existing {
            Some(id) => id,
            None => match inner.rows.iter().position(|r| r.is_none()) {
                Some(pos) => pos + 1,
                None => return Err(TableError::Full { table: self.name }),
            },
        };
        inner.store(id, record);
        Ok(id)
    }

    /// Apply `f` to the row at `id` and return the updated copy
    pub fn modify(&self, id: usize, f: impl FnOnce(&mut T)) -> Option<T> {
        let mut inner = self.inner.write();
        let mut row = inner.rows.get(id.wrapping_sub(1))?.clone()?;
        f(&mut row);
        inner.store(id, row.clone());
        Some(row)
    }

    pub fn remove(&self, id: usize) -> Option<T> {
        let mut inner = self.inner.write();
        if id == 0 || id > inner.rows.len() {
            return None;
        }
        inner.unindex(id);
        inner.rows[id - 1].take()
    }

    pub fn remove_by_key(&self, key: &T::Key) -> Option<T> {
        let id = *self.inner.read().index.get(key)?;
        self.remove(id)
    }

    /// Remove every row matching `pred` and return them
    pub fn remove_where(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let mut inner = self.inner.write();
        let ids: Vec<usize> = inner
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().filter(|r| pred(r)).map(|_| i + 1))
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            inner.unindex(id);
            if let Some(row) = inner.rows[id - 1].take() {
                removed.push(row);
            }
        }
        removed
    }

    /// Write all rows to `path` as JSON
    pub fn save(&self, path: &Path) -> Result<(), TableError> {
        let rows = self.rows();
        let json = serde_json::to_vec_pretty(&rows).map_err(|source| TableError::Corrupt {
            table: self.name,
            source,
        })?;
        std::fs::write(path, json).map_err(|source| TableError::Io {
            table: self.name,
            source,
        })
    }

    /// Replace the table contents with the rows stored at `path`.
    /// A missing file leaves the table empty.
    pub fn load(&self, path: &Path) -> Result<usize, TableError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(TableError::Io {
                    table: self.name,
                    source,
                })
            }
        };
        let rows: Vec<T> = serde_json::from_slice(&data).map_err(|source| TableError::Corrupt {
            table: self.name,
            source,
        })?;

        let mut inner = self.inner.write();
        let capacity = inner.rows.len();
        if rows.iter().any(|r| r.id() == 0 || r.id() > capacity) {
            return Err(TableError::Capacity {
                table: self.name,
                rows: rows.len(),
                capacity,
            });
        }
        inner.rows.iter_mut().for_each(|r| *r = None);
        inner.index.clear();
        let count = rows.len();
        for row in rows {
            let id = row.id();
            inner.store(id, row);
        }
        Ok(count)
    }
}
