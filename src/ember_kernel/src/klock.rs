//! Kernel state locking mechanism
//!
//! All kernel state is protected by *CPU Lock*: interrupts are masked on the
//! current CPU (by the port) and the kernel's spinlock is held so that other
//! CPUs are excluded too. [`CpuLockGuard`] represents this state and grants
//! access to the scheduler [`State`]. State that lives inside user-owned
//! objects (queues, semaphores, mutexes) is wrapped in [`KernelCell`], which
//! can only be borrowed by presenting a `CpuLockGuard`.
use core::{fmt, mem::ManuallyDrop, ops};

use crate::{Kernel, Port, State};

/// RAII guard for a CPU Lock state.
pub(crate) struct CpuLockGuard<'k, P: Port> {
    port: &'k P,
    state: ManuallyDrop<spin::MutexGuard<'k, State<P>>>,
}

impl<P: Port> Kernel<P> {
    /// Enter a CPU Lock state and get an RAII guard.
    pub(crate) fn lock_cpu(&self) -> CpuLockGuard<'_, P> {
        // Safety: CPU Lock is never nested because the only way to enter it is
        // this method, and `State` is locked right after
        unsafe { self.port.enter_cpu_lock() };
        CpuLockGuard {
            port: &self.port,
            state: ManuallyDrop::new(self.state.lock()),
        }
    }
}

impl<P: Port> Drop for CpuLockGuard<'_, P> {
    fn drop(&mut self) {
        if self.state.tick_dirty {
            self.state.tick_dirty = false;
            let next = self.state.next_deadline();
            log::trace!("pend_tick_after({next:?})");
            self.port.pend_tick_after(next);
        }

        // Release the spinlock before unmasking interrupts. An interrupt
        // handler taken in between would spin forever on this CPU.
        //
        // Safety: `self.state` is not used again
        unsafe { ManuallyDrop::drop(&mut self.state) };

        // Safety: CPU Lock is currently active, and it's us (the kernel) who
        // are currently controlling the CPU Lock state
        unsafe { self.port.leave_cpu_lock() };
    }
}

impl<P: Port> ops::Deref for CpuLockGuard<'_, P> {
    type Target = State<P>;
    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl<P: Port> ops::DerefMut for CpuLockGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

/// Cell type that can be accessed only while CPU Lock is active.
pub(crate) struct KernelCell<T>(spin::Mutex<T>);

impl<T> KernelCell<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(spin::Mutex::new(x))
    }

    /// Borrow the contents. The returned guard borrows `self` but not `lock`,
    /// so the caller can keep modifying [`State`] through `lock`.
    ///
    /// # Panics
    ///
    /// Panics if the cell is already borrowed. CPU Lock guarantees that only
    /// the current kernel call can hold a borrow.
    pub(crate) fn get<'a, P: Port>(&'a self, _lock: &CpuLockGuard<'_, P>) -> spin::MutexGuard<'a, T> {
        self.0
            .try_lock()
            .unwrap_or_else(|| unreachable!("`KernelCell` is borrowed twice"))
    }
}

impl<T> fmt::Debug for KernelCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("KernelCell(< locked >)")
    }
}
