//! Waiting for events
//!
//! A task blocked on one or more objects owns a *poll* for each of them. A
//! poll is allocated in the kernel's poll arena and linked into the object's
//! [`WaitQueue`]. The first event that concerns any of the task's polls (or
//! the task's timeout) wakes the task up and marks all of its polls dead, so
//! the remaining ones are ignored until the task unlinks them on its way
//! out of [`Kernel::wait_on_any`].
use arrayvec::ArrayVec;
use core::{fmt, ptr::NonNull};

use crate::{
    cfg::MAX_WAIT_OBJECTS,
    klock::{CpuLockGuard, KernelCell},
    queue::QueueEnd,
    task::{self, TaskId, TaskSt},
    timeout::{self, Ticks},
    utils::intrusive_list::{Link, Linked, ListHead},
    Kernel, Port, State,
};

/// What a poll is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOp {
    /// Take a semaphore.
    Take,
    /// Acquire a mutex.
    Lock,
    /// Push the value in the slot to a queue.
    Push(QueueEnd),
    /// Pop a value from a queue into the slot.
    Pop { end: QueueEnd, peek: bool },
}

pub(crate) struct PollCb {
    pub task: TaskId,
    pub op: PollOp,
    /// Points to the waiter's `Option<T>`, where `T` is the element type of
    /// the queue. Only accessed with CPU Lock active while the waiter is
    /// blocked.
    pub slot: Option<NonNull<()>>,
    /// Cleared when the task is woken up by another poll or a timeout.
    pub live: bool,
    /// The position of the object in the waiter's wait set
    pub index: usize,
    link: Option<Link>,
}

// Safety: `slot` is only dereferenced with CPU Lock active, while the task
// owning the pointee is blocked
unsafe impl Send for PollCb {}

impl Linked for PollCb {
    fn link(&self) -> Option<Link> {
        self.link
    }
    fn link_mut(&mut self) -> &mut Option<Link> {
        &mut self.link
    }
}

impl fmt::Debug for PollCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PollCb")
            .field("task", &self.task)
            .field("op", &self.op)
            .field("live", &self.live)
            .field("index", &self.index)
            .finish()
    }
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Woken up through the poll at the given position of the wait set.
    /// `task_wake` reports `0`.
    Signalled(usize),
    TimedOut,
}

/// The per-task wait state
#[derive(Debug)]
pub(crate) struct TaskWait {
    /// The polls the task is waiting on
    pub polls: ArrayVec<usize, MAX_WAIT_OBJECTS>,
    /// Set by the waker
    pub outcome: Option<WaitOutcome>,
}

impl TaskWait {
    pub const fn new() -> Self {
        Self {
            polls: ArrayVec::new_const(),
            outcome: None,
        }
    }
}

/// The list of polls waiting on an object
#[derive(Debug)]
pub(crate) struct WaitQueue {
    list: ListHead,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            list: ListHead::new(),
        }
    }

    /// Find the live poll that should be served first among those accepted
    /// by `filter`: the one whose task is the most urgent, the oldest one
    /// among equally urgent tasks.
    ///
    /// The order is determined here rather than on insertion, so a change
    /// in a waiter's priority takes effect immediately.
    pub fn first_waiter<P: Port>(
        &self,
        st: &State<P>,
        mut filter: impl FnMut(&PollCb) -> bool,
    ) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for i in self.list.iter(&st.polls) {
            let poll = &st.polls[i];
            if !poll.live || !filter(poll) {
                continue;
            }
            let level = st.tasks[poll.task.0].priority;
            if best.map_or(true, |(_, best_level)| level < best_level) {
                best = Some((i, level));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Unlink `poll` and wake up its task.
    pub fn wake_up<P: Port>(&mut self, st: &mut State<P>, poll: usize) {
        self.list.remove(&mut st.polls, poll);
        wake_up_by_poll(st, poll);
    }
}

/// An object to wait on
pub(crate) struct WaitTarget<'a> {
    pub queue: &'a KernelCell<WaitQueue>,
    pub op: PollOp,
    pub slot: Option<NonNull<()>>,
}

/// Mark all of `task`'s polls dead and make it Ready.
fn finish_wait<P: Port>(st: &mut State<P>, task: TaskId, outcome: WaitOutcome) {
    let wait = &mut st.tasks[task.0].wait;
    for &poll in &wait.polls {
        st.polls[poll].live = false;
    }
    wait.outcome = Some(outcome);
    task::make_ready(st, task);
}

fn wake_up_by_poll<P: Port>(st: &mut State<P>, poll: usize) {
    let PollCb { task, index, .. } = st.polls[poll];
    debug_assert!(st.polls[poll].live);
    timeout::cancel_task_timeout(st, task);
    finish_wait(st, task, WaitOutcome::Signalled(index));
}

/// Wake up a task whose timeout has been removed from the timeout list.
pub(crate) fn wake_up_by_timeout<P: Port>(st: &mut State<P>, task: TaskId) {
    log::trace!("{task:?} timed out");
    finish_wait(st, task, WaitOutcome::TimedOut);
}

/// Wake up a task blocked in `task_sleep` before its timeout.
pub(crate) fn wake_up_sleeping<P: Port>(st: &mut State<P>, task: TaskId) {
    timeout::cancel_task_timeout(st, task);
    finish_wait(st, task, WaitOutcome::Signalled(0));
}

impl<P: Port> Kernel<P> {
    /// Block the current task in state `task_st` until it's woken up by
    /// another party or `timeout` expires.
    ///
    /// The caller must have set up whatever the waker needs to find the task.
    /// `timeout` must not be `NO_WAIT`.
    pub(crate) fn wait_until_woken_up(
        &'static self,
        mut lock: CpuLockGuard<'static, P>,
        task: TaskId,
        task_st: TaskSt,
        timeout: Ticks,
    ) -> (CpuLockGuard<'static, P>, WaitOutcome) {
        debug_assert_ne!(timeout, timeout::NO_WAIT);

        let st = &mut *lock;
        let wait = &mut st.tasks[task.0].wait;
        wait.outcome = None;
        st.tasks[task.0].st = task_st;

        // `WAIT_FOREVER` is `INFINITE`
        timeout::insert_task_timeout(st, task, timeout);

        task::choose_next_running_task(st, self.port.cpu_id(), false);
        drop(lock);

        // Safety: CPU Lock is inactive
        unsafe { self.port.yield_cpu(self) };

        let mut lock = self.lock_cpu();
        let outcome = lock.tasks[task.0]
            .wait
            .outcome
            .take()
            .unwrap_or_else(|| unreachable!("{task:?} was dispatched without being woken up"));
        (lock, outcome)
    }

    /// Block the current task on all of `targets` at once. Returns the
    /// position of the target that woke the task up, or `None` on timeout.
    ///
    /// All polls are unlinked and released before this method returns.
    pub(crate) fn wait_on_any(
        &'static self,
        mut lock: CpuLockGuard<'static, P>,
        task: TaskId,
        targets: &[WaitTarget<'_>],
        task_st: TaskSt,
        timeout: Ticks,
    ) -> (CpuLockGuard<'static, P>, Option<usize>) {
        debug_assert!(!targets.is_empty() && targets.len() <= MAX_WAIT_OBJECTS);

        for (index, target) in targets.iter().enumerate() {
            let mut wait_queue = target.queue.get(&lock);
            let st = &mut *lock;
            let poll = st.polls.insert(PollCb {
                task,
                op: target.op,
                slot: target.slot,
                live: true,
                index,
                link: None,
            });
            wait_queue.list.push_back(&mut st.polls, poll);
            st.tasks[task.0].wait.polls.push(poll);
        }

        let (mut lock, outcome) = self.wait_until_woken_up(lock, task, task_st, timeout);

        let polls = core::mem::take(&mut lock.tasks[task.0].wait.polls);
        for (target, poll) in targets.iter().zip(polls) {
            let mut wait_queue = target.queue.get(&lock);
            let st = &mut *lock;
            // The poll that woke us up is already unlinked
            wait_queue.list.remove(&mut st.polls, poll);
            st.polls.remove(poll);
        }

        let index = match outcome {
            WaitOutcome::Signalled(index) => Some(index),
            WaitOutcome::TimedOut => None,
        };
        (lock, index)
    }
}
