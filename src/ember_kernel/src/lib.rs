//! A preemptive, priority-based real-time kernel.
//!
//! The kernel schedules tasks by priority, keeps every task timeout in one
//! delta-encoded list, and provides timers, queues with direct handoff,
//! counting semaphores (including waiting on several at once) and recursive
//! mutexes with priority inheritance. Exited tasks are reclaimed by a
//! *reaper* after the CPU has switched away from their stacks.
//!
//! The kernel is generic over a [`Port`], which supplies the context switch,
//! the interrupt mask, the tick timer and CPU identification. A [`Kernel`]
//! is an ordinary value; an embedded target places a single instance in a
//! `static`, whereas a hosted test can create as many as it likes.
//!
//! # Contexts
//!
//! Methods of [`Kernel`] that may block or dispatch are only allowed in a task
//! context and return `BadContext` otherwise. Interrupt handlers use
//! [`Kernel::interrupt`], which hands out an [`Isr`] exposing the
//! non-blocking, non-dispatching variants of the same operations. The actual
//! dispatch is deferred until the outermost interrupt handler returns.
//!
//! # Timeouts
//!
//! Every blocking operation takes a [`Ticks`] timeout: [`NO_WAIT`] polls,
//! [`WAIT_FOREVER`] waits indefinitely, and any other value is a tick count.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
extern crate alloc;

use alloc::vec::Vec;
use core::fmt;
use slab::Slab;

mod cfg;
mod error;
mod interrupt;
mod klock;
mod mutex;
mod queue;
mod semaphore;
mod state;
mod task;
mod timeout;
mod timer;
mod utils;
mod wait;

pub use self::{
    cfg::{
        KernelCfg, StartPolicy, DEFAULT_STACK_SIZE, MAX_HELD_MUTEXES, MAX_WAIT_OBJECTS,
        TASK_DATA_SLOTS,
    },
    error::*,
    interrupt::Isr,
    mutex::Mutex,
    queue::{Queue, QueueEnd},
    semaphore::Semaphore,
    task::{TaskAttr, TaskFlags, TaskId, TaskSt},
    timeout::{Ticks, NO_WAIT, WAIT_FOREVER},
    timer::{TimerAttr, TimerFlags, TimerHandler, TimerId},
};

/// A task priority. Lower values are more urgent unless the
/// `priority_high_is_urgent` feature is enabled. Values outside the
/// configured range are clamped to the least urgent level.
pub type Priority = u8;

/// The entry point of a task. The second parameter is the argument given to
/// [`Kernel::task_start`].
pub type TaskEntry<P> = fn(&'static Kernel<P>, usize);

/// The kind of execution context the current CPU is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    /// A task is running.
    Task,
    /// An interrupt handler is running.
    Interrupt,
    /// No task is running (boot or idle loop).
    Idle,
}

/// Implemented by a port. The kernel calls these methods to interact with
/// the hardware or the host environment.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// switching execution contexts and masking interrupts. The kernel relies on
/// `enter_cpu_lock` excluding every interrupt handler on the current CPU and
/// on `yield_cpu` running exactly the task chosen by the kernel.
pub unsafe trait Port: Send + Sync + Sized + 'static {
    /// The port-specific execution state of a task (a thread, a saved stack
    /// pointer...). Created by [`Self::initialize_task_state`] when a task
    /// starts and handed back through [`Self::release_task_state`] once the
    /// task has exited and the CPU has left its stack.
    type TaskState: Send + fmt::Debug;

    /// Disable interrupts on the current CPU.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. Calls are never nested.
    unsafe fn enter_cpu_lock(&self);

    /// Re-enable interrupts on the current CPU.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, after `enter_cpu_lock`.
    unsafe fn leave_cpu_lock(&self);

    /// Identify the current CPU. Must be less than
    /// [`KernelCfg::num_cpus`].
    fn cpu_id(&self) -> usize {
        0
    }

    /// Get the kind of the current execution context.
    fn context(&self) -> Context;

    /// Mark the beginning of an interrupt handler.
    ///
    /// # Safety
    ///
    /// Only meant to be called by [`Kernel::interrupt`].
    unsafe fn enter_interrupt(&self);

    /// Mark the end of an interrupt handler.
    ///
    /// # Safety
    ///
    /// Only meant to be called by [`Kernel::interrupt`].
    unsafe fn leave_interrupt(&self);

    /// Prepare the execution state of a task so that `entry(kernel, param)`
    /// is executed when the task is dispatched for the first time.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. CPU Lock is active.
    unsafe fn initialize_task_state(
        &self,
        kernel: &'static Kernel<Self>,
        task: TaskId,
        attr: &TaskAttr,
        entry: TaskEntry<Self>,
        param: usize,
    ) -> Self::TaskState;

    /// Make the current CPU run [`Kernel::running_task`]. When called from a
    /// task, this returns once the kernel chooses the caller again. When
    /// called from an idle context, this returns once the CPU becomes idle.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. CPU Lock is inactive.
    unsafe fn yield_cpu(&self, kernel: &'static Kernel<Self>);

    /// Discard the current task's context and run
    /// [`Kernel::running_task`].
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. CPU Lock is inactive. The
    /// current task is already in the reap list and its execution state must
    /// stay valid until it's passed to `release_task_state`.
    unsafe fn exit_and_dispatch(&self, kernel: &'static Kernel<Self>) -> !;

    /// Release the execution state of a reaped task.
    fn release_task_state(&self, state: Self::TaskState);

    /// Request a call to [`Isr::tick`] after the specified number of ticks,
    /// replacing any previous request. `None` means there's no finite
    /// deadline and the tick timer can be stopped.
    ///
    /// Called with CPU Lock active.
    fn pend_tick_after(&self, ticks: Option<Ticks>);
}

/// A kernel instance.
pub struct Kernel<P: Port> {
    port: P,
    cfg: KernelCfg,
    state: spin::Mutex<State<P>>,
    /// Signalled when a task enters the reap list and a reaper task exists.
    reap_signal: Semaphore,
}

/// The scheduler state, protected by CPU Lock.
pub(crate) struct State<P: Port> {
    pub tasks: Slab<task::TaskCb<P>>,
    pub polls: Slab<wait::PollCb>,
    pub timers: Slab<timer::TimerCb<P>>,
    pub ready_queue: task::readyqueue::BitmapQueue,
    /// Timeouts of sleeping and blocked tasks.
    pub timeouts: timeout::DeltaList,
    pub timer_list: timeout::DeltaList,
    /// Expired timers waiting for their handlers to be run.
    pub timers_fired: utils::intrusive_list::ListHead,
    pub reap_list: utils::intrusive_list::ListHead,
    /// The task running on each CPU.
    pub running: Vec<Option<TaskId>>,
    pub reaper: Option<TaskId>,
    /// The number of ticks elapsed since boot.
    pub time: u64,
    /// The earliest deadline may have changed since the last call to
    /// `Port::pend_tick_after`.
    pub tick_dirty: bool,
}

impl<P: Port> State<P> {
    fn new(cfg: &KernelCfg) -> Self {
        Self {
            tasks: Slab::with_capacity(cfg.max_tasks),
            polls: Slab::with_capacity(cfg.max_tasks),
            timers: Slab::with_capacity(cfg.max_timers),
            ready_queue: task::readyqueue::BitmapQueue::new(cfg.num_task_priority_levels),
            timeouts: timeout::DeltaList::new(),
            timer_list: timeout::DeltaList::new(),
            timers_fired: utils::intrusive_list::ListHead::new(),
            reap_list: utils::intrusive_list::ListHead::new(),
            running: alloc::vec![None; cfg.num_cpus],
            reaper: None,
            time: 0,
            tick_dirty: false,
        }
    }

    /// Ticks until the earliest finite deadline of either list.
    fn next_deadline(&self) -> Option<Ticks> {
        let tasks = self.timeouts.next_deadline(&self.tasks);
        let timers = self.timer_list.next_deadline(&self.timers);
        match (tasks, timers) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl<P: Port> Kernel<P> {
    /// Construct a kernel instance. The task, timer and ready-queue storage is
    /// allocated here and never grows afterwards.
    ///
    pub fn new(port: P, cfg: KernelCfg) -> Self {
        log::debug!("creating a kernel instance with {cfg:?}");
        Self {
            port,
            cfg,
            state: spin::Mutex::new(State::new(&cfg)),
            reap_signal: Semaphore::new(0, 1),
        }
    }

    /// Get a reference to the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get the configuration this kernel was created with.
    pub fn cfg(&self) -> &KernelCfg {
        &self.cfg
    }

    /// Get the task the kernel has chosen to run on the current CPU. Ports
    /// call this from [`Port::yield_cpu`] and [`Port::exit_and_dispatch`].
    pub fn running_task(&self) -> Option<TaskId> {
        let lock = self.lock_cpu();
        lock.running[self.port.cpu_id()]
    }

    /// Get the number of ticks elapsed since the kernel was created.
    pub fn time(&self) -> u64 {
        self.lock_cpu().time
    }
}

impl<P: Port> fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}
