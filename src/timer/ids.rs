//! Timer id allocation
//!
//! Ids are small integers indexing the queue's id table. Released ids are
//! reused smallest-first; when none are free the next never-used id is
//! handed out.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Default)]
pub struct IdAllocator {
    free: BinaryHeap<Reverse<usize>>,
    next_unused: usize,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> usize {
        match self.free.pop() {
            Some(Reverse(id)) => id,
            None => {
                let id = self.next_unused;
                self.next_unused += 1;
                id
            }
        }
    }

    /// Caller guarantees `id` is currently acquired; the queue's id table
    /// is the authority on that.
    pub fn release(&mut self, id: usize) {
        debug_assert!(id < self.next_unused);
        self.free.push(Reverse(id));
    }

    /// Ids ever handed out (upper bound of the id table)
    pub fn high_water(&self) -> usize {
        self.next_unused
    }

    pub fn in_use(&self) -> usize {
        self.next_unused - self.free.len()
    }
}
