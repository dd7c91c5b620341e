// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;

use crate::item::Item;

/// The resident prefix of a queue's pending items, ordered by id.
#[derive(Debug, Default)]
pub struct MemoryBuffer {
    items: VecDeque<Item>,
    bytes: u64,
}

impl MemoryBuffer {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub const fn bytes(&self) -> u64 { self.bytes }

    pub fn front(&self) -> Option<&Item> { self.items.front() }

    pub fn push_back(&mut self, item: Item) {
        debug_assert!(self.items.back().is_none_or(|last| last.id < item.id));
        self.bytes += item.size();
        self.items.push_back(item);
    }

    pub fn pop_front(&mut self) -> Option<Item> {
        let item = self.items.pop_front()?;
        self.bytes -= item.size();
        Some(item)
    }

    /// Puts an aborted item back ahead of every newer pending item.
    pub fn insert_by_id(&mut self, item: Item) {
        let index = self.items.partition_point(|existing| existing.id < item.id);
        self.bytes += item.size();
        self.items.insert(index, item);
    }

    /// Empties the buffer, returning the number of items dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        self.bytes = 0;
        dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &Item> { self.items.iter() }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;
    use test_case::test_case;

    use super::*;

    fn item(id: u64) -> Item {
        Item {
            id,
            data: Bytes::from(vec![0u8; id as usize]),
            added_at: Utc::now(),
            expires_at: None,
        }
    }

    fn ids(buffer: &MemoryBuffer) -> Vec<u64> { buffer.iter().map(|item| item.id).collect() }

    #[test]
    fn test_fifo_and_accounting() {
        let mut buffer = MemoryBuffer::new();
        for id in 1..=3 {
            buffer.push_back(item(id));
        }
        assert_eq!(buffer.bytes(), 6);
        assert_eq!(buffer.pop_front().map(|item| item.id), Some(1));
        assert_eq!(buffer.bytes(), 5);
        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.bytes(), 0);
    }

    #[test_case(1, vec![1, 3, 5] ; "before everything")]
    #[test_case(4, vec![3, 4, 5] ; "in the middle")]
    #[test_case(6, vec![3, 5, 6] ; "after everything")]
    fn test_insert_by_id(id: u64, expected: Vec<u64>) {
        let mut buffer = MemoryBuffer::new();
        buffer.push_back(item(3));
        buffer.push_back(item(5));
        buffer.insert_by_id(item(id));
        assert_eq!(ids(&buffer), expected);
        assert_eq!(buffer.bytes(), 8 + id);
    }
}
