//! Simulation environment for running the Ember kernel on a hosted
//! environment.
//!
//! Every task is backed by a dedicated OS thread, and the thread that creates
//! the kernel with [`boot`] acts as the idle context. Only one of these
//! threads executes at any point in time: the one holding the *baton*. A
//! context switch requested by the kernel hands the baton to the thread of
//! the new running task and parks the current one until the baton comes back.
//!
//! Time does not advance on its own. The idle thread drives the system by
//! raising tick interrupts through [`tick`], [`advance`] or [`run_for`], each
//! of which returns once every task is blocked again. This keeps the
//! execution deterministic.
//!
//! ```
//! use ember_kernel::{KernelCfg, TaskAttr};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! static COUNT: AtomicUsize = AtomicUsize::new(0);
//!
//! let kernel = ember_port_std::boot(KernelCfg::new());
//! let task = kernel.task_init(TaskAttr::new("counter", 1)).unwrap();
//! kernel.interrupt(|isr| {
//!     isr.task_start(task, |kernel, _| loop {
//!         COUNT.fetch_add(1, Ordering::Relaxed);
//!         kernel.task_sleep(10).unwrap();
//!     }, 0)
//! })
//! .unwrap();
//! assert_eq!(COUNT.load(Ordering::Relaxed), 1);
//!
//! ember_port_std::run_for(kernel, 30);
//! assert_eq!(COUNT.load(Ordering::Relaxed), 4);
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
use ember_kernel::{Context, Kernel, KernelCfg, Port, TaskAttr, TaskEntry, TaskId, Ticks};
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread,
};

/// Used by doctests and integration tests
#[doc(hidden)]
pub extern crate env_logger;

/// The minimum stack size of a task thread. Host code (formatting, logging)
/// needs far more stack than the sizes meant for a microcontroller.
pub const MIN_STACK_SIZE: usize = 256 * 1024;

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The thread that called [`boot`]
    Idle,
    /// The backing thread for a task
    Task(TaskId),
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };

    /// The nesting level of interrupt handlers running on the current thread
    static INTERRUPT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Identifies the thread allowed to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Baton {
    Idle,
    Task(TaskId),
}

impl Baton {
    fn current() -> Self {
        match THREAD_ROLE.with(Cell::get) {
            ThreadRole::Idle => Baton::Idle,
            ThreadRole::Task(task) => Baton::Task(task),
            ThreadRole::Unknown => panic!("the kernel was called from a thread unknown to the port"),
        }
    }

    fn of_running_task(kernel: &Kernel<StdPort>) -> Self {
        kernel.running_task().map_or(Baton::Idle, Baton::Task)
    }
}

struct Sched {
    baton: Baton,
    /// The payload of a panic in a task thread, to be propagated to the idle
    /// thread
    panic: Option<Box<dyn Any + Send>>,
    shutdown: bool,
}

/// The unwinding payload used to discard a task thread's stack
struct TaskExit;

/// The port implementation
pub struct StdPort {
    sched: Mutex<Sched>,
    baton_cvar: Condvar,
    cpu_lock: AtomicBool,
    /// The latest value passed to `pend_tick_after`
    pending_tick: SpinMutex<Option<Ticks>>,
}

/// The execution state of a task
#[derive(Debug)]
pub struct TaskState {
    task: TaskId,
    thread: thread::JoinHandle<()>,
}

impl StdPort {
    pub const fn new() -> Self {
        Self {
            sched: Mutex::new(Sched {
                baton: Baton::Idle,
                panic: None,
                shutdown: false,
            }),
            baton_cvar: Condvar::new(),
            cpu_lock: AtomicBool::new(false),
            pending_tick: SpinMutex::new(None),
        }
    }

    /// Get the number of ticks after which the kernel wants [`Isr::tick`] to
    /// be called, as most recently requested. `None` means the kernel has no
    /// finite deadline.
    ///
    /// [`Isr::tick`]: ember_kernel::Isr::tick
    pub fn pending_tick(&self) -> Option<Ticks> {
        *self.pending_tick.lock()
    }

    /// Discard the threads of all tasks that are not running. Their stacks
    /// are unwound the next time they would be resumed, which is immediately
    /// for the blocked ones.
    pub fn shutdown(&self) {
        log::trace!("shutdown");
        self.sched().shutdown = true;
        self.baton_cvar.notify_all();
    }

    fn sched(&self) -> MutexGuard<'_, Sched> {
        self.sched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pass_baton(&self, to: Baton) {
        log::trace!("passing the baton to {to:?}");
        self.sched().baton = to;
        self.baton_cvar.notify_all();
    }

    /// Park the current thread until it receives the baton.
    fn wait_for_baton(&self, me: Baton) {
        let mut sched = self.sched();
        loop {
            if me == Baton::Idle {
                if let Some(payload) = sched.panic.take() {
                    drop(sched);
                    panic::resume_unwind(payload);
                }
            } else if sched.shutdown {
                drop(sched);
                panic::resume_unwind(Box::new(TaskExit));
            }

            if sched.baton == me {
                return;
            }

            sched = self
                .baton_cvar
                .wait(sched)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Record a panic in a task thread and wake up the idle thread, which
    /// rethrows it.
    fn report_panic(&self, payload: Box<dyn Any + Send>) {
        let mut sched = self.sched();
        sched.panic = Some(payload);
        sched.baton = Baton::Idle;
        drop(sched);
        self.baton_cvar.notify_all();
    }
}

impl Default for StdPort {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Port for StdPort {
    type TaskState = TaskState;

    unsafe fn enter_cpu_lock(&self) {
        let was_active = self.cpu_lock.swap(true, Ordering::Acquire);
        assert!(!was_active, "CPU Lock is already active");
    }

    unsafe fn leave_cpu_lock(&self) {
        let was_active = self.cpu_lock.swap(false, Ordering::Release);
        assert!(was_active, "CPU Lock is not active");
    }

    fn context(&self) -> Context {
        if INTERRUPT_DEPTH.with(Cell::get) > 0 {
            return Context::Interrupt;
        }
        match Baton::current() {
            Baton::Idle => Context::Idle,
            Baton::Task(_) => Context::Task,
        }
    }

    unsafe fn enter_interrupt(&self) {
        INTERRUPT_DEPTH.with(|depth| depth.set(depth.get() + 1));
    }

    unsafe fn leave_interrupt(&self) {
        INTERRUPT_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }

    unsafe fn initialize_task_state(
        &self,
        kernel: &'static Kernel<Self>,
        task: TaskId,
        attr: &TaskAttr,
        entry: TaskEntry<Self>,
        param: usize,
    ) -> TaskState {
        let thread = thread::Builder::new()
            .name(attr.get_name().to_owned())
            .stack_size(attr.get_stack_size().max(MIN_STACK_SIZE))
            .spawn(move || task_thread_main(kernel, task, entry, param))
            .unwrap_or_else(|e| panic!("failed to spawn a thread for {task:?}: {e}"));
        log::trace!("spawned {:?} for {task:?}", thread.thread().id());
        TaskState { task, thread }
    }

    unsafe fn yield_cpu(&self, kernel: &'static Kernel<Self>) {
        let me = Baton::current();
        let next = Baton::of_running_task(kernel);
        if next == me {
            return;
        }

        self.pass_baton(next);
        self.wait_for_baton(me);
    }

    unsafe fn exit_and_dispatch(&self, kernel: &'static Kernel<Self>) -> ! {
        log::trace!("exit_and_dispatch({:?})", Baton::current());
        self.pass_baton(Baton::of_running_task(kernel));

        // Unwind the task's stack. `task_thread_main` catches this.
        panic::resume_unwind(Box::new(TaskExit))
    }

    fn release_task_state(&self, state: TaskState) {
        log::trace!("releasing the thread of {:?}", state.task);
        if state.thread.join().is_err() {
            log::warn!("the thread of {:?} did not exit cleanly", state.task);
        }
    }

    fn pend_tick_after(&self, ticks: Option<Ticks>) {
        *self.pending_tick.lock() = ticks;
    }
}

fn task_thread_main(
    kernel: &'static Kernel<StdPort>,
    task: TaskId,
    entry: TaskEntry<StdPort>,
    param: usize,
) {
    THREAD_ROLE.with(|role| role.set(ThreadRole::Task(task)));
    let port = kernel.port();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        port.wait_for_baton(Baton::Task(task));
        log::debug!("{task:?} is now running");

        entry(kernel, param);

        // Returning from the entry point is equivalent to `task_exit`
        if let Err(e) = kernel.task_exit() {
            log::error!("{task:?} failed to exit: {e:?}");
        }
    }));

    match result {
        Ok(()) => {}
        Err(payload) if payload.is::<TaskExit>() => {
            log::trace!("the thread of {task:?} is exiting");
        }
        Err(payload) => port.report_panic(payload),
    }
}

/// Create a kernel instance backed by [`StdPort`]. The calling thread becomes
/// the idle context of the kernel.
///
/// The kernel is leaked so that tasks can refer to it for the rest of the
/// process's lifetime.
pub fn boot(cfg: KernelCfg) -> &'static Kernel<StdPort> {
    let _ = env_logger::try_init();

    THREAD_ROLE.with(|role| {
        assert_eq!(
            role.get(),
            ThreadRole::Unknown,
            "this thread already belongs to a kernel"
        );
        role.set(ThreadRole::Idle);
    });

    Box::leak(Box::new(Kernel::new(StdPort::new(), cfg)))
}

/// Raise a tick interrupt advancing the system time by `ticks`, and run
/// tasks until the CPU becomes idle.
pub fn tick(kernel: &'static Kernel<StdPort>, ticks: Ticks) {
    kernel.interrupt(|isr| isr.tick(ticks));
}

/// Advance the system time to the next deadline requested by the kernel, and
/// run tasks until the CPU becomes idle. Returns the number of elapsed ticks,
/// or `None` if there was no deadline.
pub fn advance(kernel: &'static Kernel<StdPort>) -> Option<Ticks> {
    let ticks = kernel.port().pending_tick()?;
    tick(kernel, ticks);
    Some(ticks)
}

/// Advance the system time by `ticks`, stopping at every deadline on the way.
pub fn run_for(kernel: &'static Kernel<StdPort>, mut ticks: Ticks) {
    while ticks > 0 {
        let step = kernel
            .port()
            .pending_tick()
            .map_or(ticks, |pending| pending.min(ticks))
            .max(1);
        tick(kernel, step);
        ticks -= step;
    }
}
