//! Exact scan and bounded top-k selection

use super::entries::Entries;
use super::similarity::cosine_similarity;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

/// Deadline is checked once per this many comparisons
const DEADLINE_STRIDE: usize = 256;

/// Scored position in a shard
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub position: usize,
    pub score: f32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    /// Greater is better: higher score, then earlier position
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.position.cmp(&self.position))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Keeps the k best candidates seen so far
#[derive(Debug)]
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Reverse<Candidate>>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn push(&mut self, candidate: Candidate) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(Reverse(candidate));
        } else if let Some(Reverse(worst)) = self.heap.peek() {
            if candidate > *worst {
                self.heap.pop();
                self.heap.push(Reverse(candidate));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Best first
    pub fn into_sorted(self) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self.heap.into_iter().map(|Reverse(c)| c).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }
}

/// Score every entry from `start` onward into `top`
///
/// Returns false if the deadline passed before the scan finished; `top`
/// then holds the best of the entries scanned so far.
pub fn scan_into(
    entries: &Entries,
    start: usize,
    query: &[f32],
    exclude: Option<usize>,
    deadline: Option<Instant>,
    top: &mut TopK,
) -> bool {
    for (scanned, (position, pattern)) in entries.iter_from(start).enumerate() {
        if scanned % DEADLINE_STRIDE == DEADLINE_STRIDE - 1 {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
        }
        if Some(position) == exclude {
            continue;
        }
        top.push(Candidate {
            position,
            score: cosine_similarity(query, pattern.fingerprint()),
        });
    }
    true
}

/// Exact top-k over a whole shard
pub fn search(
    entries: &Entries,
    query: &[f32],
    k: usize,
    exclude: Option<usize>,
    deadline: Option<Instant>,
) -> (Vec<Candidate>, bool) {
    let mut top = TopK::new(k);
    let complete = scan_into(entries, 0, query, exclude, deadline, &mut top);
    (top.into_sorted(), !complete)
}
