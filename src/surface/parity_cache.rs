use std::collections::HashMap;

use bytes::Bytes;

/// Bounded least-recently-used cache of encoded parity chunks, keyed by
/// chunk id. Evicted parity is recomputed on demand.
#[derive(Debug)]
pub(crate) struct ParityCache {
    entries: HashMap<u32, Entry>,
    capacity: usize,
    clock: u64,
}

#[derive(Debug)]
struct Entry {
    chunk: Bytes,
    last_used: u64,
}

impl ParityCache {
    pub(crate) fn new(capacity: usize) -> Self {
        ParityCache {
            entries: HashMap::new(),
            capacity,
            clock: 0,
        }
    }

    pub(crate) fn get(&mut self, chunk_id: u32) -> Option<Bytes> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(&chunk_id).map(|e| {
            e.last_used = clock;
            e.chunk.clone()
        })
    }

    pub(crate) fn insert(&mut self, chunk_id: u32, chunk: Bytes) {
        if self.capacity == 0 {
            return;
        }
        self.clock += 1;
        self.entries.insert(
            chunk_id,
            Entry {
                chunk,
                last_used: self.clock,
            },
        );
        while self.entries.len() > self.capacity {
            if let Some((&oldest, _)) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
            {
                self.entries.remove(&oldest);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chunk(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 8])
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let mut c = ParityCache::new(4);
        assert_eq!(c.get(1), None);
        c.insert(1, chunk(1));
        assert_eq!(c.get(1), Some(chunk(1)));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let mut c = ParityCache::new(2);
        c.insert(1, chunk(1));
        c.insert(2, chunk(2));
        c.get(1); // 2 is now the oldest
        c.insert(3, chunk(3));
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(2), None);
        assert!(c.get(1).is_some());
        assert!(c.get(3).is_some());
    }

    #[test]
    fn test_zero_capacity_cache_stores_nothing() {
        let mut c = ParityCache::new(0);
        c.insert(1, chunk(1));
        assert_eq!(c.get(1), None);
        assert_eq!(c.len(), 0);
    }
}
