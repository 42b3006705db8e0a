//! Queues
//!
//! A queue is a fixed-capacity ring that can be used from both ends. While
//! tasks are blocked on a queue, the ring is bypassed: a value pushed to a
//! queue with waiting poppers goes straight into the most urgent popper's
//! slot, and a popper that frees up space pulls a value from the most
//! urgent blocked pusher. This makes the order in which values are observed
//! the same regardless of whether a waiter was present.
use core::{fmt, ptr::NonNull};

use crate::{
    error::{PollError, PushError, WaitError},
    interrupt::Isr,
    klock::{CpuLockGuard, KernelCell},
    task::TaskSt,
    timeout::{Ticks, NO_WAIT},
    wait::{PollCb, PollOp, WaitQueue, WaitTarget},
    Kernel, Port,
};

/// Selects an end of a [`Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEnd {
    Front,
    Back,
}

/// A bounded queue holding up to `N` values of type `T`. `N` can be zero, in
/// which case every transfer is a rendezvous between a pusher and a popper.
///
/// Pushing to the back and popping from the front makes a FIFO; pushing and
/// popping at the same end makes a LIFO. The ends are chosen per call.
///
/// ```
/// use ember_kernel::Queue;
/// static Q: Queue<u32, 4> = Queue::new();
/// ```
pub struct Queue<T, const N: usize> {
    ring: KernelCell<Ring<T, N>>,
    wait_queue: KernelCell<WaitQueue>,
}

struct Ring<T, const N: usize> {
    slots: [Option<T>; N],
    /// The position of the front value
    head: usize,
    len: usize,
}

impl<T, const N: usize> Ring<T, N> {
    const fn new() -> Self {
        Self {
            slots: [const { None }; N],
            head: 0,
            len: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.len == N
    }

    /// The slot index of the value at `offset` from the front. `N` must be
    /// non-zero.
    fn index(&self, offset: usize) -> usize {
        (self.head + offset) % N
    }

    fn push(&mut self, end: QueueEnd, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        let i = match end {
            QueueEnd::Back => self.index(self.len),
            QueueEnd::Front => {
                self.head = self.index(N - 1);
                self.head
            }
        };
        self.slots[i] = Some(value);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self, end: QueueEnd) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let i = match end {
            QueueEnd::Front => {
                let i = self.head;
                self.head = self.index(1);
                i
            }
            QueueEnd::Back => self.index(self.len - 1),
        };
        self.len -= 1;
        self.slots[i].take()
    }

    fn peek(&self, end: QueueEnd) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let i = match end {
            QueueEnd::Front => self.head,
            QueueEnd::Back => self.index(self.len - 1),
        };
        self.slots[i].as_ref()
    }
}

/// Get the `Option<T>` a blocked pusher or popper has lent us. The pointer
/// is valid while the poll is live and CPU Lock is active.
fn slot_of<T>(poll: &PollCb) -> *mut Option<T> {
    poll.slot
        .unwrap_or_else(|| unreachable!("a queue poll without a slot"))
        .cast()
        .as_ptr()
}

fn is_pusher(poll: &PollCb) -> bool {
    matches!(poll.op, PollOp::Push(_))
}

impl<T, const N: usize> Queue<T, N> {
    pub const fn new() -> Self {
        Self {
            ring: KernelCell::new(Ring::new()),
            wait_queue: KernelCell::new(WaitQueue::new()),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: Clone, const N: usize> Queue<T, N> {
    /// Deliver `value` to waiting poppers or store it in the ring. Returns
    /// `Err(value)` if neither was possible.
    fn push_core<P: Port>(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        value: T,
        end: QueueEnd,
    ) -> Result<(), T> {
        let mut wait_queue = self.wait_queue.get(lock);
        let st = &mut **lock;

        // Peekers get a copy, and the value keeps going
        while let Some(poll) =
            wait_queue.first_waiter(st, |p| matches!(p.op, PollOp::Pop { peek: true, .. }))
        {
            // Safety: The poll is live and CPU Lock is active
            unsafe { *slot_of::<T>(&st.polls[poll]) = Some(value.clone()) };
            wait_queue.wake_up(st, poll);
        }

        if let Some(poll) =
            wait_queue.first_waiter(st, |p| matches!(p.op, PollOp::Pop { peek: false, .. }))
        {
            // Safety: The poll is live and CPU Lock is active
            unsafe { *slot_of::<T>(&st.polls[poll]) = Some(value) };
            wait_queue.wake_up(st, poll);
            return Ok(());
        }

        drop(wait_queue);
        self.ring.get(lock).push(end, value)
    }

    /// Take a value from the ring or a waiting pusher. Returns `None` if
    /// neither has one.
    fn pop_core<P: Port>(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        end: QueueEnd,
        peek: bool,
    ) -> Option<T> {
        let mut ring = self.ring.get(lock);
        let mut wait_queue = self.wait_queue.get(lock);
        let st = &mut **lock;

        if peek {
            if let Some(value) = ring.peek(end) {
                return Some(value.clone());
            }
            let poll = wait_queue.first_waiter(st, is_pusher)?;
            // Safety: The poll is live and CPU Lock is active
            let value = unsafe { (*slot_of::<T>(&st.polls[poll])).clone() };
            return value;
        }

        if let Some(value) = ring.pop(end) {
            // Move the most urgent pusher's value into the freed space
            if let Some(poll) = wait_queue.first_waiter(st, is_pusher) {
                let PollOp::Push(push_end) = st.polls[poll].op else {
                    unreachable!()
                };
                // Safety: The poll is live and CPU Lock is active
                let pushed = unsafe { (*slot_of::<T>(&st.polls[poll])).take() };
                if let Some(pushed) = pushed {
                    ring.push(push_end, pushed)
                        .unwrap_or_else(|_| unreachable!("no space after a pop"));
                }
                wait_queue.wake_up(st, poll);
            }
            return Some(value);
        }

        // Empty ring; take directly from a pusher
        let poll = wait_queue.first_waiter(st, is_pusher)?;
        // Safety: The poll is live and CPU Lock is active
        let value = unsafe { (*slot_of::<T>(&st.polls[poll])).take() };
        wait_queue.wake_up(st, poll);
        value
    }
}

impl<T, const N: usize> fmt::Debug for Queue<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &N)
            .finish_non_exhaustive()
    }
}

impl<T, const N: usize> Default for Queue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port> Kernel<P> {
    /// Push `value` to the specified end of `queue`.
    ///
    /// If tasks are blocked popping from the queue, the value is handed to
    /// the most urgent one directly. Tasks blocked peeking receive a copy
    /// first. If the queue is full, the caller blocks until a popper makes
    /// room or takes the value, or `timeout` expires, in which case the value
    /// is returned in the error.
    pub fn queue_push<T: Clone, const N: usize>(
        &'static self,
        queue: &Queue<T, N>,
        value: T,
        end: QueueEnd,
        timeout: Ticks,
    ) -> Result<(), PushError<T>> {
        let (mut lock, task) = match self.lock_task_context() {
            Ok(x) => x,
            Err(_) => return Err(PushError::BadContext(value)),
        };

        let value = match queue.push_core(&mut lock, value, end) {
            Ok(()) => {
                self.unlock_cpu_and_check_preemption(lock, false);
                return Ok(());
            }
            Err(value) => value,
        };

        if timeout == NO_WAIT {
            return Err(PushError::Timeout(value));
        }

        // A popper takes the value out of `slot`
        let mut slot = Some(value);
        let target = WaitTarget {
            queue: &queue.wait_queue,
            op: PollOp::Push(end),
            slot: Some(NonNull::from(&mut slot).cast()),
        };
        let (lock, _) = self.wait_on_any(lock, task, &[target], TaskSt::Queue, timeout);
        drop(lock);

        match slot {
            None => Ok(()),
            Some(value) => Err(PushError::Timeout(value)),
        }
    }

    /// Take a value from the specified end of `queue`, or copy it if `peek`
    /// is set. A peek does not modify the queue.
    ///
    /// If the queue is empty, the caller blocks until a value is pushed or
    /// `timeout` expires.
    pub fn queue_pop<T: Clone, const N: usize>(
        &'static self,
        queue: &Queue<T, N>,
        end: QueueEnd,
        peek: bool,
        timeout: Ticks,
    ) -> Result<T, WaitError> {
        let (mut lock, task) = self.lock_task_context()?;

        if let Some(value) = queue.pop_core(&mut lock, end, peek) {
            // A pusher might have been woken up
            self.unlock_cpu_and_check_preemption(lock, false);
            return Ok(value);
        }

        if timeout == NO_WAIT {
            return Err(WaitError::Timeout);
        }

        // A pusher puts the value into `slot`
        let mut slot: Option<T> = None;
        let target = WaitTarget {
            queue: &queue.wait_queue,
            op: PollOp::Pop { end, peek },
            slot: Some(NonNull::from(&mut slot).cast()),
        };
        let (lock, _) = self.wait_on_any(lock, task, &[target], TaskSt::Queue, timeout);
        drop(lock);

        slot.ok_or(WaitError::Timeout)
    }

    /// Get the number of values stored in the ring of `queue`.
    pub fn queue_len<T, const N: usize>(&self, queue: &Queue<T, N>) -> usize {
        let lock = self.lock_cpu();
        let len = queue.ring.get(&lock).len;
        len
    }
}

impl<P: Port> Isr<P> {
    /// Push `value` to the specified end of `queue` without blocking.
    pub fn queue_push<T: Clone, const N: usize>(
        &self,
        queue: &Queue<T, N>,
        value: T,
        end: QueueEnd,
    ) -> Result<(), PushError<T>> {
        let mut lock = self.kernel().lock_cpu();
        queue
            .push_core(&mut lock, value, end)
            .map_err(PushError::Timeout)
    }

    /// Take or copy a value from the specified end of `queue` without
    /// blocking.
    pub fn queue_pop<T: Clone, const N: usize>(
        &self,
        queue: &Queue<T, N>,
        end: QueueEnd,
        peek: bool,
    ) -> Result<T, PollError> {
        let mut lock = self.kernel().lock_cpu();
        queue
            .pop_core(&mut lock, end, peek)
            .ok_or(PollError::Timeout)
    }
}
