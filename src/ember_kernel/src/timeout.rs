//! Timeouts and the system tick
//!
//! Every timed event is an entry of a [`DeltaList`], a linked list sorted by
//! deadline in which each entry stores the number of ticks between its
//! predecessor's deadline and its own. Advancing the time only touches the
//! entries that expire (plus the new head), regardless of the list length.
//!
//! ```text
//!  deadlines:   5      15            45
//!  deltas:   [  5 ] [ 10 ] ...... [ 30 ]  [ INFINITE ] [ INFINITE ]
//! ```
//!
//! An entry can have an [`INFINITE`] deadline. Such entries are kept at the
//! tail and never expire; they let waiting tasks share a single code path
//! regardless of whether they have a timeout.
use slab::Slab;

use crate::{
    task::{self, TaskId},
    timer::{self, TimerSt},
    utils::intrusive_list::{ListHead, Linked},
    wait, Kernel, Port, State,
};

/// A duration measured in ticks.
pub type Ticks = u32;

/// A timeout value that makes a blocking operation fail immediately instead
/// of blocking.
pub const NO_WAIT: Ticks = 0;

/// A timeout value that makes a blocking operation wait indefinitely.
pub const WAIT_FOREVER: Ticks = Ticks::MAX;

/// The delta of an entry that never expires.
pub(crate) const INFINITE: Ticks = Ticks::MAX;

/// An element of a [`DeltaList`].
pub(crate) trait DeltaNode: Linked {
    fn delta(&self) -> Ticks;
    fn delta_mut(&mut self) -> &mut Ticks;
}

/// A list of timed entries sorted by deadline. Entries with the same deadline
/// are kept in insertion order.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DeltaList {
    head: ListHead,
}

impl DeltaList {
    pub const fn new() -> Self {
        Self {
            head: ListHead::new(),
        }
    }

    pub fn front(&self) -> Option<usize> {
        self.head.front()
    }

    /// Insert `item` so that it expires after `ticks` ticks.
    pub fn insert<T: DeltaNode>(&mut self, pool: &mut Slab<T>, item: usize, ticks: Ticks) {
        let mut remaining = ticks;
        let mut at = None;

        if ticks != INFINITE {
            let mut cursor = self.head.front();
            while let Some(i) = cursor {
                let delta = pool[i].delta();
                if delta == INFINITE || remaining < delta {
                    at = Some(i);
                    break;
                }
                remaining -= delta;
                cursor = self.head.next(pool, i);
            }

            // The successor now expires relative to `item`
            if let Some(next) = at {
                if pool[next].delta() != INFINITE {
                    *pool[next].delta_mut() -= remaining;
                }
            }
        }

        *pool[item].delta_mut() = remaining;
        self.head.insert(pool, item, at);
    }

    /// Remove `item` without disturbing the deadlines of the other entries.
    /// Returns `true` if `item` was the head of the list.
    pub fn remove<T: DeltaNode>(&mut self, pool: &mut Slab<T>, item: usize) -> bool {
        if pool[item].link().is_none() {
            return false;
        }

        let was_head = self.head.front() == Some(item);
        let delta = pool[item].delta();
        if let Some(next) = self.head.next(pool, item) {
            if delta != INFINITE && pool[next].delta() != INFINITE {
                *pool[next].delta_mut() += delta;
            }
        }

        self.head.remove(pool, item);
        was_head
    }

    /// Advance the list by `*ticks` ticks, one expired entry at a time.
    ///
    /// Each call removes and returns the head if it has expired, deducting
    /// its delta from `*ticks`. Once no more entries expire, the remaining
    /// ticks are deducted from the head, `*ticks` is set to zero, and `None`
    /// is returned.
    pub fn pop_expired<T: DeltaNode>(
        &mut self,
        pool: &mut Slab<T>,
        ticks: &mut Ticks,
    ) -> Option<usize> {
        let first = self.head.front()?;
        let delta = pool[first].delta();

        if delta == INFINITE {
            *ticks = 0;
            None
        } else if delta <= *ticks {
            *ticks -= delta;
            self.head.remove(pool, first);
            *pool[first].delta_mut() = 0;
            Some(first)
        } else {
            *pool[first].delta_mut() -= *ticks;
            *ticks = 0;
            None
        }
    }

    /// Get the number of ticks until the head expires, or `None` if the list
    /// is empty or all entries are infinite.
    pub fn next_deadline<T: DeltaNode>(&self, pool: &Slab<T>) -> Option<Ticks> {
        let first = self.head.front()?;
        Some(pool[first].delta()).filter(|&d| d != INFINITE)
    }

    /// Get the number of ticks until `item` expires by summing up the deltas
    /// of it and its predecessors.
    #[cfg(test)]
    pub fn remaining<T: DeltaNode>(&self, pool: &Slab<T>, item: usize) -> Option<Ticks> {
        let mut sum: Ticks = 0;
        for i in self.head.iter(pool) {
            let delta = pool[i].delta();
            if delta == INFINITE {
                if i == item {
                    return Some(INFINITE);
                }
                continue;
            }
            sum += delta;
            if i == item {
                return Some(sum);
            }
        }
        None
    }

    #[cfg(test)]
    pub fn iter<'a, T: DeltaNode>(&'a self, pool: &'a Slab<T>) -> impl Iterator<Item = usize> + 'a {
        self.head.iter(pool)
    }
}

/// Register a timeout for a blocked task. [`WAIT_FOREVER`] registers an
/// infinite entry.
pub(crate) fn insert_task_timeout<P: Port>(st: &mut State<P>, task: TaskId, ticks: Ticks) {
    st.timeouts.insert(&mut st.tasks, task.0, ticks);
    if st.timeouts.front() == Some(task.0) {
        st.tick_dirty = true;
    }
}

/// Remove the timeout of a blocked task.
pub(crate) fn cancel_task_timeout<P: Port>(st: &mut State<P>, task: TaskId) {
    debug_assert!(st.tasks[task.0].st.is_waiting());
    if st.timeouts.remove(&mut st.tasks, task.0) {
        st.tick_dirty = true;
    }
}

/// Advance the system time by `ticks`. Wakes up the tasks whose timeouts
/// have expired, fires expired timers, and lets a more urgent task preempt
/// the running one.
pub(crate) fn handle_tick<P: Port>(kernel: &'static Kernel<P>, ticks: Ticks) {
    let mut lock = kernel.lock_cpu();
    let st = &mut *lock;
    st.time += u64::from(ticks);
    log::trace!("tick({ticks}), time = {}", st.time);

    let mut remaining = ticks;
    while let Some(i) = st.timeouts.pop_expired(&mut st.tasks, &mut remaining) {
        wait::wake_up_by_timeout(st, TaskId(i));
    }

    // Timer handlers run without CPU Lock, so collect them first
    let mut remaining = ticks;
    while let Some(i) = st.timer_list.pop_expired(&mut st.timers, &mut remaining) {
        st.timers[i].st = TimerSt::Fired;
        st.timers[i].overshoot = remaining;
        st.timers_fired.push_back(&mut st.timers, i);
    }

    st.tick_dirty = true;
    drop(lock);

    timer::fire_pending(kernel);

    let mut lock = kernel.lock_cpu();
    task::preempt(&mut lock, kernel.port.cpu_id(), false);
}
