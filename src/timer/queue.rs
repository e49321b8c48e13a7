//! Cancellable priority timer queue
//!
//! A binary min-heap ordered by absolute deadline. Heap entries are handles
//! into a [`FixedObjectPool`] of slots; a parallel id table maps every live
//! timer id to its current heap position so that cancel-by-id is O(log n)
//! and periodic timers keep their id across re-arming.
//!
//! Ordering uses strict `<` on the deadline only. Timers sharing a deadline
//! fire in whatever order the heap mechanics produce; callers must not rely
//! on FIFO order among equal deadlines.

use std::fmt;

use tracing::warn;

use super::ids::IdAllocator;
use super::pool::{FixedObjectPool, PoolHandle};
use crate::utils::TimerError;

/// Smallest accepted period for periodic timers, in milliseconds
pub const MIN_PERIOD_MS: u64 = 10;

/// Default number of heap entries added whenever the heap array is full
pub const DEFAULT_GROWTH_STEP: usize = 128;

/// Identifier of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(usize);

impl TimerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A timer as supplied by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct Timer<T> {
    /// Absolute deadline in ms since the queue owner's epoch
    pub deadline: u64,
    /// Re-arm period in ms, 0 for one-shot timers
    pub period: u64,
    pub payload: T,
}

impl<T> Timer<T> {
    pub fn once(deadline: u64, payload: T) -> Self {
        Self {
            deadline,
            period: 0,
            payload,
        }
    }

    pub fn periodic(first_deadline: u64, period: u64, payload: T) -> Self {
        Self {
            deadline: first_deadline,
            period,
            payload,
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.period > 0
    }
}

/// Callback invoked when a timer fires.
///
/// A negative status stops a periodic timer from being re-armed.
pub trait TimerCallback<C> {
    fn on_timer(&mut self, ctx: &mut C, now: u64) -> i32;
}

/// Payloads that can name the entity owning them, for bulk cancellation
pub trait TimerPayload {
    type Owner: PartialEq;

    fn owner(&self) -> Option<Self::Owner>;
}

/// Pool-resident heap entry
struct HeapSlot<T> {
    id: usize,
    deadline: u64,
    period: u64,
    payload: Option<T>,
}

impl<T> Default for HeapSlot<T> {
    fn default() -> Self {
        Self {
            id: 0,
            deadline: 0,
            period: 0,
            payload: None,
        }
    }
}

/// Where a timer id currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdSlot {
    Free,
    InHeap(usize),
    /// Popped for dispatch; the id stays reserved until `finish`
    Firing,
    /// Cancelled while its callback was running; `finish` will not re-arm
    CancelledWhileFiring,
}

/// A timer popped from the queue whose callback has yet to be completed
/// with [`TimerQueue::finish`]. Dropping it without finishing leaks its id
/// and pool slot.
#[must_use = "a fired timer must be passed back to TimerQueue::finish"]
pub struct Fired<T> {
    id: TimerId,
    handle: PoolHandle,
    timer: Timer<T>,
}

impl<T> Fired<T> {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn timer(&self) -> &Timer<T> {
        &self.timer
    }

    pub fn payload(&self) -> &T {
        &self.timer.payload
    }

    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.timer.payload
    }
}

/// Binary min-heap of timers with cancel-by-id
pub struct TimerQueue<T> {
    heap: Vec<PoolHandle>,
    capacity: usize,
    growth_step: usize,
    id_table: Vec<IdSlot>,
    ids: IdAllocator,
    pool: FixedObjectPool<HeapSlot<T>>,
}

impl<T> TimerQueue<T> {
    /// Create a queue with an initial heap capacity and growth step
    pub fn new(capacity: usize, growth_step: usize) -> Result<Self, TimerError> {
        let mut heap = Vec::new();
        heap.try_reserve_exact(capacity)
            .map_err(|_| TimerError::HeapAlloc)?;
        let mut id_table = Vec::new();
        id_table
            .try_reserve_exact(capacity)
            .map_err(|_| TimerError::HeapAlloc)?;
        id_table.resize(capacity, IdSlot::Free);

        Ok(Self {
            heap,
            capacity,
            growth_step: growth_step.max(1),
            id_table,
            ids: IdAllocator::new(),
            pool: FixedObjectPool::with_capacity(capacity)?,
        })
    }

    /// Schedule a timer, returning its id
    pub fn schedule(&mut self, timer: Timer<T>) -> Result<TimerId, TimerError> {
        if timer.period > 0 && timer.period < MIN_PERIOD_MS {
            return Err(TimerError::PeriodTooShort {
                period: timer.period,
                min: MIN_PERIOD_MS,
            });
        }
        self.insert(timer, None)
    }

    fn insert(
        &mut self,
        timer: Timer<T>,
        keep: Option<(TimerId, PoolHandle)>,
    ) -> Result<TimerId, TimerError> {
        self.ensure_capacity()?;

        let fresh = keep.is_none();
        let (id, handle) = match keep {
            Some((id, handle)) => (id.0, handle),
            None => {
                let handle = self.pool.take()?;
                (self.ids.acquire(), handle)
            }
        };
        if id >= self.id_table.len() {
            if self.id_table.try_reserve(id + 1 - self.id_table.len()).is_err() {
                // Re-armed timers are cleaned up by `finish`
                if fresh {
                    self.ids.release(id);
                    self.pool.give_back(handle)?;
                }
                return Err(TimerError::HeapAlloc);
            }
            self.id_table.resize(id + 1, IdSlot::Free);
        }

        let slot = self.pool.get_mut(handle);
        slot.id = id;
        slot.deadline = timer.deadline;
        slot.period = timer.period;
        slot.payload = Some(timer.payload);

        let pos = self.heap.len();
        self.heap.push(handle);
        self.id_table[id] = IdSlot::InHeap(pos);
        self.sift_up(pos);
        Ok(TimerId(id))
    }

    fn ensure_capacity(&mut self) -> Result<(), TimerError> {
        if self.heap.len() < self.capacity {
            return Ok(());
        }
        let step = self.growth_step;
        self.heap
            .try_reserve_exact(step)
            .map_err(|_| TimerError::HeapAlloc)?;
        self.id_table
            .try_reserve(step)
            .map_err(|_| TimerError::HeapAlloc)?;
        self.capacity += step;
        if self.id_table.len() < self.capacity {
            self.id_table.resize(self.capacity, IdSlot::Free);
        }
        Ok(())
    }

    /// Cancel a pending timer. Stale ids (already fired or cancelled)
    /// report `NotFound`, which callers may treat as a no-op.
    pub fn cancel(&mut self, id: TimerId) -> Result<(), TimerError> {
        match self.id_table.get(id.0).copied() {
            Some(IdSlot::InHeap(pos)) => {
                let handle = self.remove_at(pos);
                self.release(id.0, handle)
            }
            Some(IdSlot::Firing) => {
                self.id_table[id.0] = IdSlot::CancelledWhileFiring;
                Ok(())
            }
            _ => Err(TimerError::NotFound(id)),
        }
    }

    /// Cancel every pending timer whose payload belongs to `owner`
    pub fn cancel_all_for(&mut self, owner: &T::Owner) -> usize
    where
        T: TimerPayload,
    {
        let matching: Vec<TimerId> = self
            .heap
            .iter()
            .filter_map(|&handle| {
                let slot = self.pool.get(handle);
                let owned = slot
                    .payload
                    .as_ref()
                    .and_then(|p| p.owner())
                    .is_some_and(|o| &o == owner);
                owned.then_some(TimerId(slot.id))
            })
            .collect();

        matching
            .into_iter()
            .filter(|&id| self.cancel(id).is_ok())
            .count()
    }

    /// Deadline of the earliest timer
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.first().map(|&h| self.pool.get(h).deadline)
    }

    /// Milliseconds until the earliest deadline; `None` means infinite
    pub fn time_to_next(&self, now: u64) -> Option<u64> {
        self.next_deadline().map(|d| d.saturating_sub(now))
    }

    /// Pop the root if its deadline has passed
    pub fn pop_expired(&mut self, now: u64) -> Option<Fired<T>> {
        match self.next_deadline() {
            Some(deadline) if deadline <= now => self.pop_root(),
            _ => None,
        }
    }

    fn pop_root(&mut self) -> Option<Fired<T>> {
        if self.heap.is_empty() {
            return None;
        }
        let handle = self.remove_at(0);
        let slot = self.pool.get_mut(handle);
        let id = slot.id;
        let (deadline, period) = (slot.deadline, slot.period);

        let Some(payload) = slot.payload.take() else {
            warn!("Timer {} popped without payload", id);
            if let Err(e) = self.release(id, handle) {
                warn!("Failed to release timer {}: {}", id, e);
            }
            return None;
        };

        self.id_table[id] = IdSlot::Firing;
        Some(Fired {
            id: TimerId(id),
            handle,
            timer: Timer {
                deadline,
                period,
                payload,
            },
        })
    }

    /// Complete a fired timer. Periodic timers with a non-negative status
    /// are re-armed at `now + period` under the same id; everything else
    /// releases the id and the slot.
    pub fn finish(
        &mut self,
        fired: Fired<T>,
        status: i32,
        now: u64,
    ) -> Result<Option<TimerId>, TimerError> {
        let Fired {
            id,
            handle,
            mut timer,
        } = fired;
        let cancelled = self.id_table.get(id.0) == Some(&IdSlot::CancelledWhileFiring);

        if timer.is_periodic() && status >= 0 && !cancelled {
            timer.deadline = now + timer.period;
            return match self.insert(timer, Some((id, handle))) {
                Ok(id) => Ok(Some(id)),
                Err(e) => {
                    self.release(id.0, handle)?;
                    Err(e)
                }
            };
        }

        drop(timer);
        self.release(id.0, handle)?;
        Ok(None)
    }

    /// Pop the root and run its callback, returning the callback status.
    /// `None` when the queue is empty.
    pub fn dispatch_next<C>(&mut self, ctx: &mut C, now: u64) -> Result<Option<i32>, TimerError>
    where
        T: TimerCallback<C>,
    {
        let Some(mut fired) = self.pop_root() else {
            return Ok(None);
        };
        let status = fired.timer.payload.on_timer(ctx, now);
        self.finish(fired, status, now)?;
        Ok(Some(status))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Whether `id` names a timer waiting in the heap
    pub fn contains(&self, id: TimerId) -> bool {
        matches!(self.id_table.get(id.0), Some(IdSlot::InHeap(_)))
    }

    /// Deadline and period of a pending timer
    pub fn get(&self, id: TimerId) -> Option<(u64, u64)> {
        match self.id_table.get(id.0) {
            Some(&IdSlot::InHeap(pos)) => {
                let slot = self.pool.get(self.heap[pos]);
                Some((slot.deadline, slot.period))
            }
            _ => None,
        }
    }

    /// Current heap array capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots sitting on the pool's free list
    pub fn pool_free_count(&self) -> usize {
        self.pool.free_count()
    }

    /// Drop every pending timer and release the slot pool. Fails if a fired
    /// timer was never finished.
    pub fn shutdown(mut self) -> Result<(), TimerError> {
        while let Some(handle) = self.heap.pop() {
            let slot = self.pool.get_mut(handle);
            slot.payload = None;
            let id = slot.id;
            self.id_table[id] = IdSlot::Free;
            self.pool.give_back(handle)?;
        }
        self.pool.release_all()?;
        Ok(())
    }

    fn release(&mut self, id: usize, handle: PoolHandle) -> Result<(), TimerError> {
        self.pool.get_mut(handle).payload = None;
        self.id_table[id] = IdSlot::Free;
        self.ids.release(id);
        self.pool.give_back(handle)?;
        Ok(())
    }

    /// Remove the entry at `pos`, moving the last entry into the hole
    fn remove_at(&mut self, pos: usize) -> PoolHandle {
        let handle = self.heap.swap_remove(pos);
        if pos < self.heap.len() {
            self.set_position(pos);
            if pos > 0 && self.less(pos, (pos - 1) / 2) {
                self.sift_up(pos);
            } else {
                self.sift_down(pos);
            }
        }
        handle
    }

    #[inline]
    fn deadline_at(&self, pos: usize) -> u64 {
        self.pool.get(self.heap[pos]).deadline
    }

    #[inline]
    fn less(&self, a: usize, b: usize) -> bool {
        self.deadline_at(a) < self.deadline_at(b)
    }

    #[inline]
    fn set_position(&mut self, pos: usize) {
        let id = self.pool.get(self.heap[pos]).id;
        self.id_table[id] = IdSlot::InHeap(pos);
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.set_position(a);
        self.set_position(b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, pos) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }

    /// Check heap order and id/slot consistency
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        for pos in 1..self.heap.len() {
            let parent = (pos - 1) / 2;
            assert!(
                self.deadline_at(parent) <= self.deadline_at(pos),
                "heap order violated at {}",
                pos
            );
        }
        for (pos, &handle) in self.heap.iter().enumerate() {
            let id = self.pool.get(handle).id;
            assert_eq!(self.id_table[id], IdSlot::InHeap(pos));
        }
        let in_heap = self
            .id_table
            .iter()
            .filter(|s| matches!(s, IdSlot::InHeap(_)))
            .count();
        assert_eq!(in_heap, self.heap.len());
        assert!(self.id_table.len() >= self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tagged {
        owner: usize,
        status: i32,
    }

    impl Tagged {
        fn new(owner: usize) -> Self {
            Self { owner, status: 0 }
        }
    }

    impl TimerCallback<Vec<(usize, u64)>> for Tagged {
        fn on_timer(&mut self, log: &mut Vec<(usize, u64)>, now: u64) -> i32 {
            log.push((self.owner, now));
            self.status
        }
    }

    impl TimerPayload for Tagged {
        type Owner = usize;

        fn owner(&self) -> Option<usize> {
            Some(self.owner)
        }
    }

    fn queue() -> TimerQueue<Tagged> {
        TimerQueue::new(8, 8).unwrap()
    }

    #[test]
    fn test_pops_in_deadline_order() {
        let mut q = queue();
        for (i, deadline) in [50u64, 10, 40, 30, 20, 60, 5].iter().enumerate() {
            q.schedule(Timer::once(*deadline, Tagged::new(i))).unwrap();
            q.assert_invariants();
        }

        let mut log = Vec::new();
        let mut deadlines = Vec::new();
        while let Some(fired) = q.pop_expired(u64::MAX) {
            deadlines.push(fired.timer().deadline);
            let status = fired.payload().clone().on_timer(&mut log, 0);
            q.finish(fired, status, 0).unwrap();
            q.assert_invariants();
        }
        assert_eq!(deadlines, vec![5, 10, 20, 30, 40, 50, 60]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_pop_expired_respects_now() {
        let mut q = queue();
        q.schedule(Timer::once(100, Tagged::new(0))).unwrap();
        assert!(q.pop_expired(99).is_none());
        assert_eq!(q.time_to_next(40), Some(60));
        assert_eq!(q.time_to_next(150), Some(0));

        let fired = q.pop_expired(100).unwrap();
        q.finish(fired, 0, 100).unwrap();
        assert_eq!(q.time_to_next(100), None);
    }

    #[test]
    fn test_rejects_short_period() {
        let mut q = queue();
        let err = q
            .schedule(Timer::periodic(0, MIN_PERIOD_MS - 1, Tagged::new(0)))
            .unwrap_err();
        assert_eq!(
            err,
            TimerError::PeriodTooShort {
                period: MIN_PERIOD_MS - 1,
                min: MIN_PERIOD_MS
            }
        );
        assert!(q.is_empty());
        assert!(q
            .schedule(Timer::periodic(0, MIN_PERIOD_MS, Tagged::new(0)))
            .is_ok());
        // One-shot timers have no period restriction
        assert!(q.schedule(Timer::once(0, Tagged::new(0))).is_ok());
    }

    #[test]
    fn test_cancel_round_trip() {
        let mut q = queue();
        q.schedule(Timer::once(10, Tagged::new(0))).unwrap();
        q.schedule(Timer::once(20, Tagged::new(1))).unwrap();
        let len_before = q.len();
        let free_before = q.pool_free_count();

        let id = q.schedule(Timer::once(15, Tagged::new(2))).unwrap();
        assert_eq!(q.pool_free_count(), free_before - 1);

        q.cancel(id).unwrap();
        assert_eq!(q.len(), len_before);
        assert_eq!(q.pool_free_count(), free_before);
        assert!(!q.contains(id));
        q.assert_invariants();
    }

    #[test]
    fn test_cancel_stale_id_is_not_found() {
        let mut q = queue();
        let id = q.schedule(Timer::once(10, Tagged::new(0))).unwrap();
        q.cancel(id).unwrap();
        assert_eq!(q.cancel(id), Err(TimerError::NotFound(id)));

        let fired_id = q.schedule(Timer::once(5, Tagged::new(1))).unwrap();
        let mut log = Vec::new();
        q.dispatch_next(&mut log, 5).unwrap();
        assert_eq!(q.cancel(fired_id), Err(TimerError::NotFound(fired_id)));
    }

    #[test]
    fn test_ids_reused_smallest_first() {
        let mut q = queue();
        let ids: Vec<_> = (0..5)
            .map(|i| q.schedule(Timer::once(i * 10, Tagged::new(0))).unwrap())
            .collect();
        q.cancel(ids[3]).unwrap();
        q.cancel(ids[1]).unwrap();

        assert_eq!(q.schedule(Timer::once(1, Tagged::new(0))).unwrap(), ids[1]);
        assert_eq!(q.schedule(Timer::once(1, Tagged::new(0))).unwrap(), ids[3]);
        assert_eq!(q.schedule(Timer::once(1, Tagged::new(0))).unwrap().index(), 5);
    }

    #[test]
    fn test_periodic_keeps_id() {
        let mut q = queue();
        let id = q.schedule(Timer::periodic(100, 50, Tagged::new(7))).unwrap();
        q.schedule(Timer::once(500, Tagged::new(8))).unwrap();

        let mut log = Vec::new();
        let status = q.dispatch_next(&mut log, 103).unwrap();
        assert_eq!(status, Some(0));
        assert_eq!(log, vec![(7, 103)]);
        assert!(q.contains(id));
        assert_eq!(q.get(id), Some((153, 50)));
        assert_eq!(q.len(), 2);
        q.assert_invariants();
    }

    #[test]
    fn test_negative_status_stops_periodic() {
        let mut q = queue();
        let mut tagged = Tagged::new(1);
        tagged.status = -1;
        let id = q.schedule(Timer::periodic(10, 20, tagged)).unwrap();
        let free_before = q.pool_free_count();

        let mut log = Vec::new();
        assert_eq!(q.dispatch_next(&mut log, 10).unwrap(), Some(-1));
        assert!(!q.contains(id));
        assert!(q.is_empty());
        assert_eq!(q.pool_free_count(), free_before + 1);
    }

    #[test]
    fn test_cancel_while_firing_prevents_rearm() {
        let mut q = queue();
        let id = q.schedule(Timer::periodic(10, 20, Tagged::new(1))).unwrap();

        let fired = q.pop_expired(10).unwrap();
        assert_eq!(fired.id(), id);
        assert!(q.cancel(id).is_ok());
        assert_eq!(q.finish(fired, 0, 10).unwrap(), None);
        assert!(q.is_empty());
        assert_eq!(q.cancel(id), Err(TimerError::NotFound(id)));
    }

    #[test]
    fn test_firing_periodic_id_not_reused() {
        let mut q = queue();
        let id = q.schedule(Timer::periodic(10, 20, Tagged::new(1))).unwrap();
        let fired = q.pop_expired(10).unwrap();

        // Scheduling from inside the callback must not steal the firing id
        let other = q.schedule(Timer::once(15, Tagged::new(2))).unwrap();
        assert_ne!(other, id);

        assert_eq!(q.finish(fired, 0, 10).unwrap(), Some(id));
        assert_eq!(q.get(id), Some((30, 20)));
        q.assert_invariants();
    }

    #[test]
    fn test_cancel_all_for_owner() {
        let mut q = queue();
        for i in 0..12u64 {
            q.schedule(Timer::once(100 - i, Tagged::new((i % 3) as usize)))
                .unwrap();
        }
        assert_eq!(q.cancel_all_for(&1), 4);
        assert_eq!(q.len(), 8);
        q.assert_invariants();

        let mut log = Vec::new();
        while q.dispatch_next(&mut log, 1000).unwrap().is_some() {}
        assert!(log.iter().all(|(owner, _)| *owner != 1));
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let mut q: TimerQueue<Tagged> = TimerQueue::new(2, 3).unwrap();
        for i in 0..10u64 {
            q.schedule(Timer::once(i, Tagged::new(0))).unwrap();
        }
        assert_eq!(q.len(), 10);
        assert!(q.capacity() >= 10);
        q.assert_invariants();
    }

    #[test]
    fn test_randomized_schedule_cancel_keeps_invariants() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        let mut q: TimerQueue<Tagged> = TimerQueue::new(4, 4).unwrap();
        let mut live: Vec<TimerId> = Vec::new();
        let mut now = 0u64;

        for _ in 0..4000 {
            match rng.u8(0..10) {
                0..=4 => {
                    let deadline = now + rng.u64(0..500);
                    live.push(q.schedule(Timer::once(deadline, Tagged::new(0))).unwrap());
                }
                5..=7 if !live.is_empty() => {
                    let id = live.swap_remove(rng.usize(0..live.len()));
                    q.cancel(id).unwrap();
                }
                _ => {
                    now += rng.u64(0..50);
                    let before = q.next_deadline();
                    if let Some(fired) = q.pop_expired(now) {
                        assert_eq!(Some(fired.timer().deadline), before);
                        live.retain(|id| *id != fired.id());
                        q.finish(fired, 0, now).unwrap();
                    }
                }
            }
            q.assert_invariants();
            assert_eq!(q.len(), live.len());
            for id in &live {
                assert!(q.contains(*id));
            }
        }
    }

    #[test]
    fn test_shutdown() {
        let mut q = queue();
        q.schedule(Timer::once(1, Tagged::new(0))).unwrap();
        q.schedule(Timer::periodic(1, 10, Tagged::new(0))).unwrap();
        assert!(q.shutdown().is_ok());

        let mut q = queue();
        q.schedule(Timer::once(1, Tagged::new(0))).unwrap();
        let fired = q.pop_expired(1).unwrap();
        std::mem::forget(fired);
        assert!(matches!(
            q.shutdown(),
            Err(TimerError::Pool(crate::utils::PoolError::Outstanding { outstanding: 1 }))
        ));
    }
}
