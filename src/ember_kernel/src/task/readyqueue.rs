//! Task ready queue implementation (internal use only).
use alloc::vec::Vec;
use core::{fmt, ops::RangeTo};
use slab::Slab;

use crate::utils::{
    intrusive_list::{ListHead, Linked},
    PrioBitmap,
};

/// The result type of [`BitmapQueue::pop_front_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleDecision<T> {
    /// The kernel should not perform context switch and should continue to
    /// schedule the current task.
    Keep,
    /// The kernel should perform context switch to the specified task.
    SwitchTo(Option<T>),
}

/// The ready queue implementation that uses a set of queues segregated by the
/// priority levels of contained tasks. Level `0` is the most urgent one.
pub(crate) struct BitmapQueue {
    /// The set of segregated task ready queues, in which each queue stores
    /// the list of Ready tasks at the corresponding level.
    ///
    /// Invariant: `queues[i].first.is_some() == bitmap.get(i)`
    queues: Vec<ListHead>,

    /// The task ready bitmap, in which each bit indicates whether the
    /// segregated queue corresponding to that bit contains a task or not.
    bitmap: PrioBitmap,
}

impl BitmapQueue {
    pub fn new(num_levels: usize) -> Self {
        Self {
            queues: (0..num_levels).map(|_| ListHead::new()).collect(),
            bitmap: PrioBitmap::new(num_levels),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.queues.len()
    }

    /// Return a flag indicating whether there's a task in Ready state whose
    /// level is in the specified range.
    pub fn has_ready_task_in_priority_range(&self, range: RangeTo<usize>) -> bool {
        let highest = self.bitmap.find_set().unwrap_or(usize::MAX);
        highest < range.end
    }

    /// Insert `task` to the back of the queue for level `pri`.
    pub fn push_back_task<T: Linked>(&mut self, pool: &mut Slab<T>, task: usize, pri: usize) {
        self.queues[pri].push_back(pool, task);
        self.bitmap.set(pri);
    }

    /// Choose the next task to schedule based on `prev_task_priority`, the
    /// level of the task that would keep running if no switch happened, or
    /// `usize::MAX` if there's no such task. Tasks whose level is numerically
    /// less than `prev_task_priority` win.
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed from
    /// the queue.
    ///
    /// | Runnable current task? | `prev_task_priority` | Has next task? |        Returns      |
    /// | ---------------------- | -------------------- | -------------- | ------------------- |
    /// |          no            |   `== usize::MAX`    |       no       |  `SwitchTo(None)`   |
    /// |          no            |   `== usize::MAX`    |       yes      | `SwitchTo(Some(_))` |
    /// |          yes           |   `!= usize::MAX`    |       no       |       `Keep`        |
    /// |          yes           |   `!= usize::MAX`    |       yes      | `SwitchTo(Some(_))` |
    pub fn pop_front_task<T: Linked>(
        &mut self,
        pool: &mut Slab<T>,
        prev_task_priority: usize,
    ) -> ScheduleDecision<usize> {
        // `usize::MAX - 1` makes "no ready task" lose against "no current
        // task", which yields `SwitchTo(None)`. It never collides with a real
        // level because of the limit imposed by `PrioBitmap`.
        let next_task_priority = self.bitmap.find_set().unwrap_or(usize::MAX - 1);

        if prev_task_priority <= next_task_priority {
            // Return if there's no task willing to take over the current one,
            // and the current one can still run.
            ScheduleDecision::Keep
        } else if next_task_priority < self.queues.len() {
            let queue = &mut self.queues[next_task_priority];
            let task = queue
                .pop_front(pool)
                .unwrap_or_else(|| unreachable!("bitmap indicated a non-empty queue"));
            if queue.is_empty() {
                self.bitmap.clear(next_task_priority);
            }
            ScheduleDecision::SwitchTo(Some(task))
        } else {
            ScheduleDecision::SwitchTo(None)
        }
    }

    /// Reposition `task` after a change in its level from `old_pri` to `pri`.
    /// The task is re-inserted at the back of the new level's queue in one
    /// step, so no observer sees it missing from the queue set.
    pub fn reorder_task<T: Linked>(
        &mut self,
        pool: &mut Slab<T>,
        task: usize,
        pri: usize,
        old_pri: usize,
    ) {
        debug_assert_ne!(pri, old_pri);

        let old_queue = &mut self.queues[old_pri];
        let removed = old_queue.remove(pool, task);
        debug_assert!(removed, "task {task} is not in the ready queue");
        if old_queue.is_empty() {
            self.bitmap.clear(old_pri);
        }

        self.queues[pri].push_back(pool, task);
        self.bitmap.set(pri);
    }

    /// Enumerate the tasks in dispatch order.
    pub fn iter<'a, T: Linked>(&'a self, pool: &'a Slab<T>) -> impl Iterator<Item = usize> + 'a {
        self.queues.iter().flat_map(move |q| q.iter(pool))
    }
}

impl fmt::Debug for BitmapQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BitmapQueue")
            .field("queues", &self.queues)
            .field("bitmap", &self.bitmap)
            .finish()
    }
}
