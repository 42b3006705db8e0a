//! Interrupt handling
use core::{fmt, marker::PhantomData};

use crate::{
    error::{SetTaskPriorityError, StartTaskError, WakeTaskError},
    task::{self, TaskId},
    timeout::{self, Ticks},
    Context, Kernel, Port, Priority, TaskEntry,
};

/// A capability to use the kernel from an interrupt handler.
///
/// The operations available through `Isr` never block and never switch
/// tasks. A task made ready by them is dispatched when the outermost
/// interrupt handler returns, provided that it's chosen by [`Isr::tick`] or
/// [`Isr::preempt`], or that the CPU was idle.
///
/// `Isr` can't be sent to another thread or stored outside the handler.
pub struct Isr<P: Port> {
    kernel: &'static Kernel<P>,
    _not_send: PhantomData<*mut ()>,
}

impl<P: Port> Isr<P> {
    pub(crate) fn new(kernel: &'static Kernel<P>) -> Self {
        Self {
            kernel,
            _not_send: PhantomData,
        }
    }

    pub fn kernel(&self) -> &'static Kernel<P> {
        self.kernel
    }

    /// Advance the system time by `ticks`. This is the handler for the tick
    /// timer programmed through [`Port::pend_tick_after`].
    pub fn tick(&self, ticks: Ticks) {
        timeout::handle_tick(self.kernel, ticks);
    }

    /// Let a ready task preempt the interrupted one: a strictly more urgent
    /// task, or an equally urgent one if `yield_` is set. Does nothing if the
    /// interrupted task has [`TaskFlags::NO_PREEMPT`]. Returns whether a
    /// switch will happen.
    ///
    /// [`TaskFlags::NO_PREEMPT`]: crate::TaskFlags::NO_PREEMPT
    pub fn preempt(&self, yield_: bool) -> bool {
        let mut lock = self.kernel.lock_cpu();
        task::preempt(&mut lock, self.kernel.port.cpu_id(), yield_)
    }

    /// Start a task in the Init state without dispatching it.
    pub fn task_start(
        &self,
        task: TaskId,
        entry: TaskEntry<P>,
        param: usize,
    ) -> Result<(), StartTaskError> {
        let mut lock = self.kernel.lock_cpu();
        task::start_task(self.kernel, &mut lock, task, entry, param)
    }

    /// Wake up a task blocked in [`Kernel::task_sleep`].
    pub fn task_wake(&self, task: TaskId) -> Result<(), WakeTaskError> {
        let mut lock = self.kernel.lock_cpu();
        task::wake_task(&mut lock, task)
    }

    /// Change the base priority of a task.
    pub fn task_priority(
        &self,
        task: TaskId,
        priority: Priority,
    ) -> Result<(), SetTaskPriorityError> {
        let mut lock = self.kernel.lock_cpu();
        task::set_task_priority(self.kernel, &mut lock, task, priority)
    }

    /// Get the number of ticks elapsed since the kernel was created.
    pub fn time(&self) -> u64 {
        self.kernel.time()
    }
}

impl<P: Port> fmt::Debug for Isr<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Isr")
    }
}

impl<P: Port> Kernel<P> {
    /// Run an interrupt handler. Ports call this on every interrupt that
    /// uses the kernel.
    ///
    /// Handlers can nest. When the outermost one returns, the CPU switches to
    /// the task chosen by the handlers. If the CPU was idle, it runs the
    /// ready tasks (see [`Self::idle`]) before returning.
    pub fn interrupt<R>(&'static self, handler: impl FnOnce(&Isr<P>) -> R) -> R {
        let interrupted = self.port.context();

        // Safety: We are `Kernel::interrupt`
        unsafe { self.port.enter_interrupt() };
        let result = handler(&Isr::new(self));
        // Safety: Ditto
        unsafe { self.port.leave_interrupt() };

        match interrupted {
            Context::Interrupt => {}
            // Safety: CPU Lock is inactive
            Context::Task => unsafe { self.port.yield_cpu(self) },
            Context::Idle => self.idle(),
        }

        result
    }
}
