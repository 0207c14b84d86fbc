// Reorder buffer for fragment bodies that complete out of order.
//
// Bodies are held keyed by fragment index and released strictly in index
// order, starting at the write cursor.

use std::collections::BTreeMap;

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct ReorderBuffer {
    pending: BTreeMap<usize, Bytes>,
    /// Index of the next fragment to be written to staging.
    next_index: usize,
    buffered_bytes: usize,
}

impl ReorderBuffer {
    pub fn new(next_index: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            next_index,
            buffered_bytes: 0,
        }
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Hold `body` for fragment `index`. Indices behind the cursor or already
    /// held are ignored and reported as `false`.
    pub fn insert(&mut self, index: usize, body: Bytes) -> bool {
        if index < self.next_index || self.pending.contains_key(&index) {
            return false;
        }
        self.buffered_bytes += body.len();
        self.pending.insert(index, body);
        true
    }

    /// Pop the body at the cursor, if it has arrived, and advance the cursor.
    pub fn pop_ready(&mut self) -> Option<(usize, Bytes)> {
        let body = self.pending.remove(&self.next_index)?;
        let index = self.next_index;
        self.next_index += 1;
        self.buffered_bytes -= body.len();
        Some((index, body))
    }
}
