//! Fixed-size object pool
//!
//! Hands out uniform objects from a free list and never deallocates them
//! until the pool itself is released. Objects live in page-sized blocks so
//! that a burst of timer scheduling does not turn into a burst of small
//! allocations.

use std::fmt;
use std::mem::size_of;

use crate::utils::PoolError;

/// Block sizing target; a block never exceeds one page worth of objects
/// (at least one object per block).
pub const PAGE_SIZE: usize = 4096;

/// Index of an object inside a [`FixedObjectPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolHandle(u32);

impl PoolHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Uniform object allocator with a free list
pub struct FixedObjectPool<T> {
    blocks: Vec<Box<[T]>>,
    per_block: usize,
    free: Vec<PoolHandle>,
    /// `taken[i]` is true while handle `i` is outside the pool
    taken: Vec<bool>,
}

impl<T: Default> FixedObjectPool<T> {
    /// Number of objects in one block for this object type
    pub fn objects_per_block() -> usize {
        (PAGE_SIZE / size_of::<T>().max(1)).max(1)
    }

    /// Create a pool with room for at least `initial_count` objects
    pub fn with_capacity(initial_count: usize) -> Result<Self, PoolError> {
        let mut pool = Self {
            blocks: Vec::new(),
            per_block: Self::objects_per_block(),
            free: Vec::new(),
            taken: Vec::new(),
        };
        if initial_count > 0 {
            pool.grow(initial_count)?;
        }
        Ok(pool)
    }

    /// Add at least `n` objects to the free list (rounded up to whole blocks)
    pub fn grow(&mut self, n: usize) -> Result<(), PoolError> {
        let blocks = n.div_ceil(self.per_block).max(1);
        for _ in 0..blocks {
            self.grow_block()?;
        }
        Ok(())
    }

    fn grow_block(&mut self) -> Result<(), PoolError> {
        let count = self.per_block;
        let alloc_failed = PoolError::AllocFailed { count };

        let base = self.allocated();
        if base + count > u32::MAX as usize {
            return Err(alloc_failed);
        }

        let mut block: Vec<T> = Vec::new();
        block.try_reserve_exact(count).map_err(|_| alloc_failed.clone())?;
        block.resize_with(count, T::default);

        self.blocks.try_reserve(1).map_err(|_| alloc_failed.clone())?;
        self.free.try_reserve(count).map_err(|_| alloc_failed.clone())?;
        self.taken.try_reserve(count).map_err(|_| alloc_failed)?;

        self.blocks.push(block.into_boxed_slice());
        self.taken.resize(base + count, false);
        // Reverse order so the lowest handle is taken first
        self.free
            .extend((base..base + count).rev().map(|i| PoolHandle(i as u32)));
        Ok(())
    }

    /// Take an object, growing by one block when the free list is empty
    pub fn take(&mut self) -> Result<PoolHandle, PoolError> {
        if self.free.is_empty() {
            self.grow_block()?;
        }
        let handle = self.free.pop().ok_or(PoolError::AllocFailed {
            count: self.per_block,
        })?;
        self.taken[handle.index()] = true;
        Ok(handle)
    }

    /// Return an object to the free list. The object keeps its contents
    /// until it is taken again.
    pub fn give_back(&mut self, handle: PoolHandle) -> Result<(), PoolError> {
        match self.taken.get_mut(handle.index()) {
            None => Err(PoolError::BadHandle(handle.index())),
            Some(taken) if !*taken => Err(PoolError::NotTaken(handle.index())),
            Some(taken) => {
                *taken = false;
                self.free.push(handle);
                Ok(())
            }
        }
    }

    #[inline]
    pub fn get(&self, handle: PoolHandle) -> &T {
        let i = handle.index();
        &self.blocks[i / self.per_block][i % self.per_block]
    }

    #[inline]
    pub fn get_mut(&mut self, handle: PoolHandle) -> &mut T {
        let i = handle.index();
        &mut self.blocks[i / self.per_block][i % self.per_block]
    }

    /// Objects currently on the free list
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Total objects ever allocated
    pub fn allocated(&self) -> usize {
        self.blocks.len() * self.per_block
    }

    /// Objects taken and not yet returned
    pub fn outstanding(&self) -> usize {
        self.allocated() - self.free.len()
    }

    /// Release all storage. Every taken object must have been returned.
    pub fn release_all(self) -> Result<(), PoolError> {
        let outstanding = self.outstanding();
        if outstanding != 0 {
            return Err(PoolError::Outstanding { outstanding });
        }
        Ok(())
    }
}
