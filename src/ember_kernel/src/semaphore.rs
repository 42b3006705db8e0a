//! Semaphores
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    cfg::MAX_WAIT_OBJECTS,
    error::{PollError, SignalError, WaitError},
    interrupt::Isr,
    klock::{CpuLockGuard, KernelCell},
    task::TaskSt,
    timeout::{Ticks, NO_WAIT},
    wait::{PollOp, WaitQueue, WaitTarget},
    Kernel, Port,
};

/// A counting semaphore whose count ranges over `0..=max`.
///
/// ```
/// use ember_kernel::Semaphore;
/// static SEM: Semaphore = Semaphore::new(0, 1);
/// ```
pub struct Semaphore {
    value: KernelCell<usize>,
    max: usize,
    wait_queue: KernelCell<WaitQueue>,
}

impl Semaphore {
    /// Construct a semaphore.
    ///
    /// # Panics
    ///
    /// Panics if `initial` is greater than `max`.
    pub const fn new(initial: usize, max: usize) -> Self {
        assert!(initial <= max, "the initial count exceeds the maximum");
        Self {
            value: KernelCell::new(initial),
            max,
            wait_queue: KernelCell::new(WaitQueue::new()),
        }
    }

    pub const fn max(&self) -> usize {
        self.max
    }

    /// Signal the semaphore. The signal is handed directly to the most
    /// urgent waiter if there's any.
    pub(crate) fn give_core<P: Port>(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
    ) -> Result<(), SignalError> {
        let mut wait_queue = self.wait_queue.get(lock);
        let st = &mut **lock;
        if let Some(poll) = wait_queue.first_waiter(st, |_| true) {
            wait_queue.wake_up(st, poll);
            return Ok(());
        }

        let mut value = self.value.get(lock);
        if *value < self.max {
            *value += 1;
            Ok(())
        } else {
            Err(SignalError::QueueOverflow)
        }
    }

    /// Decrement the count if it's non-zero. Returns whether it was.
    fn poll_core<P: Port>(&self, lock: &CpuLockGuard<'_, P>) -> bool {
        let mut value = self.value.get(lock);
        if *value > 0 {
            *value -= 1;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl<P: Port> Kernel<P> {
    /// Increment the count of `sem`, or wake up the most urgent task waiting
    /// on it.
    pub fn semaphore_give(&'static self, sem: &Semaphore) -> Result<(), SignalError> {
        let (mut lock, _) = self.lock_task_context()?;
        sem.give_core(&mut lock)?;
        self.unlock_cpu_and_check_preemption(lock, false);
        Ok(())
    }

    /// Decrement the count of `sem`, blocking until it's non-zero or
    /// `timeout` expires.
    pub fn semaphore_take(&'static self, sem: &Semaphore, timeout: Ticks) -> Result<(), WaitError> {
        self.semaphore_take_any(&[sem], timeout).map(|_| ())
    }

    /// Decrement the count of one of `sems`, blocking until one of them is
    /// signalled or `timeout` expires. Returns the position of the semaphore
    /// that was taken.
    ///
    /// If several semaphores are available right away, the first one in
    /// `sems` is taken. Fails with `BadParam` if `sems` is empty or longer
    /// than [`MAX_WAIT_OBJECTS`].
    pub fn semaphore_take_any(
        &'static self,
        sems: &[&Semaphore],
        timeout: Ticks,
    ) -> Result<usize, WaitError> {
        let (lock, task) = self.lock_task_context()?;
        if sems.is_empty() || sems.len() > MAX_WAIT_OBJECTS {
            return Err(WaitError::BadParam);
        }

        if let Some(i) = sems.iter().position(|sem| sem.poll_core(&lock)) {
            return Ok(i);
        }

        if timeout == NO_WAIT {
            return Err(WaitError::Timeout);
        }

        let targets: ArrayVec<WaitTarget<'_>, MAX_WAIT_OBJECTS> = sems
            .iter()
            .map(|sem| WaitTarget {
                queue: &sem.wait_queue,
                op: PollOp::Take,
                slot: None,
            })
            .collect();
        let (_lock, index) =
            self.wait_on_any(lock, task, &targets, TaskSt::Semaphore, timeout);
        index.ok_or(WaitError::Timeout)
    }

    /// Get the current count of `sem`.
    pub fn semaphore_count(&self, sem: &Semaphore) -> usize {
        let lock = self.lock_cpu();
        let value = *sem.value.get(&lock);
        value
    }
}

impl<P: Port> Isr<P> {
    /// Increment the count of `sem`, or wake up the most urgent task waiting
    /// on it. The woken task is dispatched when the interrupt handler
    /// returns, if it's preferred by [`Isr::preempt`] or the CPU is idle.
    pub fn semaphore_give(&self, sem: &Semaphore) -> Result<(), SignalError> {
        let mut lock = self.kernel().lock_cpu();
        sem.give_core(&mut lock)
    }

    /// Decrement the count of `sem` if it's non-zero.
    pub fn semaphore_poll(&self, sem: &Semaphore) -> Result<(), PollError> {
        let lock = self.kernel().lock_cpu();
        if sem.poll_core(&lock) {
            Ok(())
        } else {
            Err(PollError::Timeout)
        }
    }
}
