//! Append-only, structurally shared pattern storage
//!
//! A snapshot owns a list of `Arc` chunks. Publishing an insert clones only
//! the chunk list and the tail chunk; every full chunk is shared with older
//! snapshots, so readers holding one never observe a partial write.

use crate::models::pattern::Pattern;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const CHUNK_SIZE: usize = 1024;
const ID_BUCKETS: usize = 256;

/// Positional pattern storage
#[derive(Debug, Clone, Default)]
pub struct Entries {
    chunks: Vec<Arc<Vec<Arc<Pattern>>>>,
    len: usize,
}

impl Entries {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, position: usize) -> Option<&Arc<Pattern>> {
        if position >= self.len {
            return None;
        }
        self.chunks
            .get(position / CHUNK_SIZE)
            .and_then(|chunk| chunk.get(position % CHUNK_SIZE))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pattern>> + '_ {
        self.chunks.iter().flat_map(|chunk| chunk.iter())
    }

    /// Patterns from `start` to the end
    pub fn iter_from(&self, start: usize) -> impl Iterator<Item = (usize, &Arc<Pattern>)> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .skip(start / CHUNK_SIZE)
            .flat_map(|(c, chunk)| {
                chunk
                    .iter()
                    .enumerate()
                    .map(move |(i, pattern)| (c * CHUNK_SIZE + i, pattern))
            })
            .skip(start % CHUNK_SIZE)
    }

    /// Append in place; chunks shared with other snapshots are copied first
    pub fn push(&mut self, pattern: Arc<Pattern>) {
        match self.chunks.last_mut() {
            Some(tail) if tail.len() < CHUNK_SIZE => Arc::make_mut(tail).push(pattern),
            _ => {
                let mut chunk = Vec::with_capacity(CHUNK_SIZE);
                chunk.push(pattern);
                self.chunks.push(Arc::new(chunk));
            }
        }
        self.len += 1;
    }

    /// New storage with `pattern` appended at position `len()`
    pub fn appended(&self, pattern: Arc<Pattern>) -> Self {
        let mut next = self.clone();
        next.push(pattern);
        next
    }

    /// New storage with the pattern at `position` replaced
    pub fn replaced(&self, position: usize, pattern: Arc<Pattern>) -> Option<Self> {
        if position >= self.len {
            return None;
        }
        let mut next = self.clone();
        let chunk = Arc::make_mut(&mut next.chunks[position / CHUNK_SIZE]);
        chunk[position % CHUNK_SIZE] = pattern;
        Some(next)
    }
}

/// pattern_id -> position map split into shared buckets
///
/// An insert copies one bucket instead of the whole map.
#[derive(Debug, Clone)]
pub struct IdMap {
    buckets: Vec<Arc<HashMap<Uuid, usize>>>,
}

impl Default for IdMap {
    fn default() -> Self {
        Self {
            buckets: (0..ID_BUCKETS).map(|_| Arc::new(HashMap::new())).collect(),
        }
    }
}

impl IdMap {
    fn bucket(id: &Uuid) -> usize {
        id.as_bytes()[15] as usize % ID_BUCKETS
    }

    pub fn get(&self, id: &Uuid) -> Option<usize> {
        self.buckets[Self::bucket(id)].get(id).copied()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.get(id).is_some()
    }

    pub fn insert(&mut self, id: Uuid, position: usize) {
        Arc::make_mut(&mut self.buckets[Self::bucket(&id)]).insert(id, position);
    }

    pub fn inserted(&self, id: Uuid, position: usize) -> Self {
        let mut next = self.clone();
        next.insert(id, position);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pattern::{InstrumentType, FINGERPRINT_DIMS};

    fn pattern(seed: f32) -> Arc<Pattern> {
        Arc::new(Pattern::new(InstrumentType::Drums, vec![seed; FINGERPRINT_DIMS]).unwrap())
    }

    #[test]
    fn test_append_across_chunks() {
        let mut entries = Entries::default();
        for i in 0..(CHUNK_SIZE * 2 + 5) {
            entries = entries.appended(pattern(i as f32));
        }
        assert_eq!(entries.len(), CHUNK_SIZE * 2 + 5);
        assert_eq!(entries.iter().count(), entries.len());
        assert_eq!(entries.get(CHUNK_SIZE + 1).unwrap().fingerprint()[0], (CHUNK_SIZE + 1) as f32);
        assert!(entries.get(entries.len()).is_none());

        let tail: Vec<usize> = entries.iter_from(CHUNK_SIZE * 2 + 3).map(|(i, _)| i).collect();
        assert_eq!(tail, vec![CHUNK_SIZE * 2 + 3, CHUNK_SIZE * 2 + 4]);
    }

    #[test]
    fn test_older_snapshot_is_unchanged() {
        let base = Entries::default().appended(pattern(1.0));
        let next = base.appended(pattern(2.0));
        let replaced = next.replaced(0, pattern(9.0)).unwrap();

        assert_eq!(base.len(), 1);
        assert_eq!(base.get(0).unwrap().fingerprint()[0], 1.0);
        assert_eq!(next.get(0).unwrap().fingerprint()[0], 1.0);
        assert_eq!(replaced.get(0).unwrap().fingerprint()[0], 9.0);
        assert!(next.replaced(5, pattern(0.0)).is_none());
    }

    #[test]
    fn test_id_map_copy_on_write() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let first = IdMap::default().inserted(a, 0);
        let second = first.inserted(b, 1);

        assert_eq!(second.get(&a), Some(0));
        assert_eq!(second.get(&b), Some(1));
        assert!(!first.contains(&b));
    }
}
