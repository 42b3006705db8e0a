//! Mutexes
use core::fmt;

use crate::{
    error::{LockMutexError, UnlockMutexError},
    klock::KernelCell,
    task::{self, TaskId, TaskSt},
    timeout::{Ticks, NO_WAIT},
    wait::{PollOp, WaitQueue, WaitTarget},
    Kernel, Port,
};

/// A recursive mutex with priority inheritance.
///
/// While a task waits for a mutex held by a less urgent task, the owner runs
/// at the waiter's priority. The inherited priority stays in effect until the
/// owner releases the mutex, at which point the owner's priority is
/// recalculated from its base priority and the mutexes it still holds.
///
/// ```
/// use ember_kernel::Mutex;
/// static M: Mutex = Mutex::new();
/// ```
pub struct Mutex {
    inner: KernelCell<MutexCb>,
    wait_queue: KernelCell<WaitQueue>,
}

struct MutexCb {
    /// The number of times the owner has locked the mutex.
    ///
    /// Invariant: `count > 0` iff `owner.is_some()`
    count: usize,
    owner: Option<TaskId>,
}

/// An entry of `TaskCb::held_mutexes`
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeldMutex {
    /// The address of the `Mutex`
    mutex: usize,
    /// The most urgent level of the tasks that have waited for the mutex
    /// since the owner acquired it, or `usize::MAX`
    pub inherited: usize,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            inner: KernelCell::new(MutexCb {
                count: 0,
                owner: None,
            }),
            wait_queue: KernelCell::new(WaitQueue::new()),
        }
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Mutex")
    }
}

impl<P: Port> Kernel<P> {
    /// Acquire `mutex`, blocking until it's released or `timeout` expires.
    /// Locking a mutex already owned by the current task succeeds
    /// immediately, and it must be unlocked as many times.
    ///
    /// A task can hold up to [`MAX_HELD_MUTEXES`] mutexes at once.
    ///
    /// [`MAX_HELD_MUTEXES`]: crate::MAX_HELD_MUTEXES
    pub fn mutex_lock(&'static self, mutex: &Mutex, timeout: Ticks) -> Result<(), LockMutexError> {
        let (mut lock, task) = self.lock_task_context()?;
        let key = mutex.key();

        {
            let mut inner = mutex.inner.get(&lock);
            let st = &mut *lock;
            match inner.owner {
                Some(owner) if owner == task => {
                    inner.count += 1;
                    return Ok(());
                }
                _ if st.tasks[task.0].held_mutexes.is_full() => {
                    return Err(LockMutexError::OutOfMemory);
                }
                None => {
                    inner.owner = Some(task);
                    inner.count = 1;
                    st.tasks[task.0].held_mutexes.push(HeldMutex {
                        mutex: key,
                        inherited: usize::MAX,
                    });
                    return Ok(());
                }
                Some(owner) => {
                    if timeout == NO_WAIT {
                        return Err(LockMutexError::Timeout);
                    }

                    let level = st.tasks[task.0].priority;
                    let held = st
                        .tasks
                        .get_mut(owner.0)
                        .and_then(|cb| cb.held_mutexes.iter_mut().find(|h| h.mutex == key));
                    // Not found if the owner has exited
                    if let Some(held) = held {
                        if level < held.inherited {
                            held.inherited = level;
                            log::trace!("{owner:?} inherits level {level} from {task:?}");
                            task::update_effective_priority(st, owner);
                        }
                    }
                }
            }
        }

        let target = WaitTarget {
            queue: &mutex.wait_queue,
            op: PollOp::Lock,
            slot: None,
        };
        let (_lock, index) = self.wait_on_any(lock, task, &[target], TaskSt::Mutex, timeout);

        // The ownership has been transferred by `mutex_unlock`
        index.map(|_| ()).ok_or(LockMutexError::Timeout)
    }

    /// Release `mutex`. When the hold count reaches zero, the current task's
    /// priority is recalculated without the levels inherited through `mutex`,
    /// and the ownership is passed to the most urgent waiter.
    ///
    /// Unlocking a mutex not owned by the current task does nothing.
    pub fn mutex_unlock(&'static self, mutex: &Mutex) -> Result<(), UnlockMutexError> {
        let (mut lock, task) = self.lock_task_context()?;
        let mut inner = mutex.inner.get(&lock);
        let key = mutex.key();

        if inner.owner != Some(task) {
            log::trace!("{task:?} unlocked a mutex owned by {:?}", inner.owner);
            return Ok(());
        }

        inner.count -= 1;
        if inner.count > 0 {
            return Ok(());
        }

        let mut wait_queue = mutex.wait_queue.get(&lock);
        let st = &mut *lock;
        let held = &mut st.tasks[task.0].held_mutexes;
        if let Some(i) = held.iter().position(|h| h.mutex == key) {
            held.swap_remove(i);
        }
        task::update_effective_priority(st, task);

        if let Some(poll) = wait_queue.first_waiter(st, |_| true) {
            let next = st.polls[poll].task;
            inner.owner = Some(next);
            inner.count = 1;
            wait_queue.wake_up(st, poll);

            // The new owner inherits from the tasks still waiting
            let inherited = wait_queue
                .first_waiter(st, |_| true)
                .map_or(usize::MAX, |poll| st.tasks[st.polls[poll].task.0].priority);
            // `mutex_lock` has checked the capacity before blocking
            st.tasks[next.0].held_mutexes.push(HeldMutex {
                mutex: key,
                inherited,
            });
            task::update_effective_priority(st, next);
        } else {
            inner.owner = None;
        }

        drop((inner, wait_queue));
        self.unlock_cpu_and_check_preemption(lock, false);
        Ok(())
    }

    /// Get the task currently owning `mutex`.
    pub fn mutex_owner(&self, mutex: &Mutex) -> Option<TaskId> {
        let lock = self.lock_cpu();
        let owner = mutex.inner.get(&lock).owner;
        owner
    }
}
