//! Tasks
use arrayvec::ArrayVec;
use core::{convert::Infallible, fmt};

use crate::{
    cfg::{StartPolicy, DEFAULT_STACK_SIZE, MAX_HELD_MUTEXES, TASK_DATA_SLOTS},
    error::{
        BadIdError, CreateTaskError, ExitTaskError, GetTaskError, SetTaskPriorityError,
        SleepError, StartTaskError, TaskDataError, WakeTaskError,
    },
    klock::CpuLockGuard,
    mutex::HeldMutex,
    timeout::{DeltaNode, Ticks, NO_WAIT},
    timer::{TimerFlags, TimerId},
    utils::intrusive_list::{Link, Linked},
    wait::{self, TaskWait},
    Context, Kernel, Port, Priority, State, TaskEntry,
};

pub(crate) mod readyqueue;
mod reap;

use self::readyqueue::ScheduleDecision;

/// Identifies a task created by [`Kernel::task_init`].
///
/// Identifiers of tasks created with [`TaskFlags::DYNAMIC`] are recycled
/// once the task has been reaped.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSt {
    /// Created but not started, or reaped.
    Init,
    Ready,
    Run,
    /// Blocked in [`Kernel::task_sleep`].
    Sleep,
    /// Blocked in a queue push or pop.
    Queue,
    /// Blocked in a semaphore take.
    Semaphore,
    /// Blocked in [`Kernel::mutex_lock`].
    Mutex,
    /// Exited, waiting to be reaped.
    End,
}

impl TaskSt {
    /// Get a flag indicating whether the task is blocked on a timeout or an
    /// object.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Self::Sleep | Self::Queue | Self::Semaphore | Self::Mutex
        )
    }
}

bitflags::bitflags! {
    /// Task options
    pub struct TaskFlags: u8 {
        /// The task is not preempted at tick and [`Isr::preempt`]
        /// checkpoints. It still gives up the CPU when it blocks, yields, or
        /// makes a more urgent task ready by itself.
        ///
        /// [`Isr::preempt`]: crate::Isr::preempt
        const NO_PREEMPT = 1 << 0;
        /// Release the task's control block when the task is reaped without
        /// being restarted.
        const DYNAMIC = 1 << 1;
    }
}

/// The creation parameters of a task.
#[derive(Debug, Clone, Copy)]
pub struct TaskAttr {
    name: &'static str,
    priority: Priority,
    flags: TaskFlags,
    stack_size: usize,
}

impl TaskAttr {
    pub const fn new(name: &'static str, priority: Priority) -> Self {
        Self {
            name,
            priority,
            flags: TaskFlags::empty(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub const fn flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }

    pub const fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub const fn get_name(&self) -> &'static str {
        self.name
    }

    pub const fn get_priority(&self) -> Priority {
        self.priority
    }

    pub const fn get_flags(&self) -> TaskFlags {
        self.flags
    }

    pub const fn get_stack_size(&self) -> usize {
        self.stack_size
    }
}

/// Task control block
pub(crate) struct TaskCb<P: Port> {
    pub attr: TaskAttr,
    pub st: TaskSt,

    /// The effective level. Differs from `base_priority` while the task
    /// inherits a priority through a mutex.
    pub priority: usize,
    /// The level set by `task_init` or `task_priority`.
    pub base_priority: usize,
    /// The mutexes the task owns, each with the most urgent level it has
    /// passed on to the task. `priority` is the most urgent of these and
    /// `base_priority`.
    pub held_mutexes: ArrayVec<HeldMutex, MAX_HELD_MUTEXES>,

    /// Shared by the ready queue, the timeout list and the reap list. `st`
    /// tells which one the task is in.
    link: Option<Link>,
    /// The delta to the previous entry of the timeout list
    timeout: Ticks,

    pub port_task_state: Option<P::TaskState>,

    /// The entry point to restart the task with once it's reaped
    pub restart: Option<(TaskEntry<P>, usize)>,

    pub wait: TaskWait,

    pub data: ArrayVec<(usize, usize), TASK_DATA_SLOTS>,

    /// The timer that last started or restarted this task
    pub timer: Option<TimerId>,
    /// Set by `activate`, cleared when the new activation is dispatched
    pub first_dispatch: bool,
}

impl<P: Port> TaskCb<P> {
    fn new(attr: TaskAttr, level: usize) -> Self {
        Self {
            attr,
            st: TaskSt::Init,
            priority: level,
            base_priority: level,
            held_mutexes: ArrayVec::new(),
            link: None,
            timeout: 0,
            port_task_state: None,
            restart: None,
            wait: TaskWait::new(),
            data: ArrayVec::new(),
            timer: None,
            first_dispatch: false,
        }
    }
}

impl<P: Port> Linked for TaskCb<P> {
    fn link(&self) -> Option<Link> {
        self.link
    }
    fn link_mut(&mut self) -> &mut Option<Link> {
        &mut self.link
    }
}

impl<P: Port> DeltaNode for TaskCb<P> {
    fn delta(&self) -> Ticks {
        self.timeout
    }
    fn delta_mut(&mut self) -> &mut Ticks {
        &mut self.timeout
    }
}

impl<P: Port> fmt::Debug for TaskCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("name", &self.attr.name)
            .field("st", &self.st)
            .field("priority", &self.priority)
            .field("base_priority", &self.base_priority)
            .field("held_mutexes", &self.held_mutexes)
            .field("port_task_state", &self.port_task_state)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

pub(crate) fn task_cb<P: Port>(
    st: &mut State<P>,
    task: TaskId,
) -> Result<&mut TaskCb<P>, BadIdError> {
    st.tasks.get_mut(task.0).ok_or(BadIdError::BadId)
}

/// Put `task` at the back of the ready queue for its level.
pub(crate) fn make_ready<P: Port>(st: &mut State<P>, task: TaskId) {
    let cb = &mut st.tasks[task.0];
    cb.st = TaskSt::Ready;
    let level = cb.priority;
    st.ready_queue.push_back_task(&mut st.tasks, task.0, level);
}

/// Change the effective level of `task`, repositioning it in the ready
/// queue if it's there.
pub(crate) fn set_effective_priority<P: Port>(st: &mut State<P>, task: TaskId, level: usize) {
    let cb = &mut st.tasks[task.0];
    let old_level = core::mem::replace(&mut cb.priority, level);
    if cb.st == TaskSt::Ready && old_level != level {
        st.ready_queue
            .reorder_task(&mut st.tasks, task.0, level, old_level);
    }
}

/// Recalculate the effective level of `task` from its base level and the
/// levels inherited through the mutexes it holds.
pub(crate) fn update_effective_priority<P: Port>(st: &mut State<P>, task: TaskId) {
    let cb = &st.tasks[task.0];
    let level = cb
        .held_mutexes
        .iter()
        .map(|held| held.inherited)
        .fold(cb.base_priority, usize::min);
    set_effective_priority(st, task, level);
}

/// Transition `task` from Init to Ready so that it starts at
/// `entry(kernel, param)`.
pub(crate) fn activate<P: Port>(
    kernel: &'static Kernel<P>,
    st: &mut State<P>,
    task: TaskId,
    entry: TaskEntry<P>,
    param: usize,
) {
    let cb = &mut st.tasks[task.0];
    debug_assert_eq!(cb.st, TaskSt::Init);
    log::debug!("starting {task:?} ({:?})", cb.attr.name);

    // Safety: CPU Lock is active (`st` can only be borrowed through it)
    let port_state =
        unsafe { kernel.port.initialize_task_state(kernel, task, &cb.attr, entry, param) };
    cb.port_task_state = Some(port_state);
    cb.first_dispatch = true;

    make_ready(st, task);
}

/// Implements `Kernel::task_start` and `Isr::task_start`.
pub(crate) fn start_task<P: Port>(
    kernel: &'static Kernel<P>,
    st: &mut State<P>,
    task: TaskId,
    entry: TaskEntry<P>,
    param: usize,
) -> Result<(), StartTaskError> {
    if task_cb(st, task)?.st != TaskSt::Init {
        return Err(StartTaskError::BadObjectState);
    }
    activate(kernel, st, task, entry, param);
    Ok(())
}

/// Implements `Kernel::task_wake` and `Isr::task_wake`.
pub(crate) fn wake_task<P: Port>(st: &mut State<P>, task: TaskId) -> Result<(), WakeTaskError> {
    if task_cb(st, task)?.st != TaskSt::Sleep {
        return Err(WakeTaskError::BadObjectState);
    }
    wait::wake_up_sleeping(st, task);
    Ok(())
}

/// Implements `Kernel::task_priority` and `Isr::task_priority`.
pub(crate) fn set_task_priority<P: Port>(
    kernel: &Kernel<P>,
    st: &mut State<P>,
    task: TaskId,
    priority: Priority,
) -> Result<(), SetTaskPriorityError> {
    let level = kernel.cfg.level_of(priority);
    task_cb(st, task)?.base_priority = level;
    update_effective_priority(st, task);
    Ok(())
}

/// Determine the task to run on `cpu` next, and update `running[cpu]`.
///
/// The running task keeps the CPU unless a ready task is strictly more
/// urgent, or at least as urgent if `yield_` is set. Returns whether
/// `running[cpu]` changed.
pub(crate) fn choose_next_running_task<P: Port>(
    st: &mut State<P>,
    cpu: usize,
    yield_: bool,
) -> bool {
    let prev = st.running[cpu];

    // The level of the task that would keep running if no switch happened
    let prev_task_priority = match prev {
        Some(task) if st.tasks[task.0].st == TaskSt::Run => {
            st.tasks[task.0].priority + usize::from(yield_)
        }
        _ => usize::MAX,
    };

    match st
        .ready_queue
        .pop_front_task(&mut st.tasks, prev_task_priority)
    {
        ScheduleDecision::Keep => false,
        ScheduleDecision::SwitchTo(next) => {
            let next = next.map(TaskId);
            task_switch(st, cpu, next);
            prev != next
        }
    }
}

/// [`choose_next_running_task`] for preemption checkpoints reached from an
/// interrupt context. A running task with [`TaskFlags::NO_PREEMPT`] is never
/// switched out.
pub(crate) fn preempt<P: Port>(st: &mut State<P>, cpu: usize, yield_: bool) -> bool {
    if let Some(task) = st.running[cpu] {
        let cb = &st.tasks[task.0];
        if cb.st == TaskSt::Run && cb.attr.flags.contains(TaskFlags::NO_PREEMPT) {
            return false;
        }
    }
    choose_next_running_task(st, cpu, yield_)
}

/// Make `next` the running task of `cpu`. `next` must have been removed from
/// the ready queue. The port realizes the switch when it's notified by
/// `Port::yield_cpu` or `Port::exit_and_dispatch`.
fn task_switch<P: Port>(st: &mut State<P>, cpu: usize, next: Option<TaskId>) {
    log::trace!("cpu {cpu}: switching from {:?} to {next:?}", st.running[cpu]);

    if let Some(prev) = st.running[cpu] {
        match st.tasks[prev.0].st {
            TaskSt::Run => make_ready(st, prev),
            TaskSt::End => st.reap_list.push_back(&mut st.tasks, prev.0),
            // Blocked; the task is already in the timeout list
            _ => {}
        }
    }

    if let Some(next) = next {
        let cb = &mut st.tasks[next.0];
        debug_assert_eq!(cb.st, TaskSt::Ready);
        cb.st = TaskSt::Run;

        // The activation requested by the timer has been delivered. Resuming
        // an activation that was preempted doesn't count.
        if core::mem::take(&mut cb.first_dispatch) {
            if let Some(timer) = cb.timer {
                if let Some(timer_cb) = st.timers.get_mut(timer.0) {
                    timer_cb.flags.remove(TimerFlags::EXPIRED);
                }
            }
        }
    }

    st.running[cpu] = next;
}

impl<P: Port> Kernel<P> {
    /// Relinquish CPU Lock. If the current context is a task context, switch
    /// to a more urgent task (or one of equal urgency if `yield_` is set) if
    /// there's any.
    pub(crate) fn unlock_cpu_and_check_preemption(
        &'static self,
        mut lock: CpuLockGuard<'static, P>,
        yield_: bool,
    ) {
        if self.port.context() != Context::Task {
            return;
        }

        let switched = choose_next_running_task(&mut lock, self.port.cpu_id(), yield_);
        drop(lock);

        if switched {
            // Safety: CPU Lock is inactive
            unsafe { self.port.yield_cpu(self) };
        }
    }

    /// Create a task in the Init state. Out-of-range priorities are clamped
    /// to the least urgent level.
    pub fn task_init(&self, attr: TaskAttr) -> Result<TaskId, CreateTaskError> {
        let mut lock = self.lock_cpu();
        if lock.tasks.len() >= self.cfg.max_tasks {
            return Err(CreateTaskError::OutOfMemory);
        }

        let level = self.cfg.level_of(attr.priority);
        let task = TaskId(lock.tasks.insert(TaskCb::new(attr, level)));
        log::debug!("created {task:?} ({:?}) at level {level}", attr.name);
        Ok(task)
    }

    /// Start a task in the Init state. It begins execution at
    /// `entry(kernel, param)`.
    ///
    /// The caller is switched out immediately if the new task is more urgent.
    /// With [`StartPolicy::YieldOnEqual`], this also happens if it's equally
    /// urgent.
    pub fn task_start(
        &'static self,
        task: TaskId,
        entry: TaskEntry<P>,
        param: usize,
    ) -> Result<(), StartTaskError> {
        let (mut lock, _) = self.lock_task_context()?;
        start_task(self, &mut lock, task, entry, param)?;

        let yield_ = self.cfg.start_policy == StartPolicy::YieldOnEqual;
        self.unlock_cpu_and_check_preemption(lock, yield_);
        Ok(())
    }

    /// Block the current task for `ticks` ticks. `task_sleep(0)` moves the
    /// current task to the back of its ready queue, letting the other tasks
    /// of the same priority run.
    ///
    /// A sleep can be cut short by [`Self::task_wake`].
    pub fn task_sleep(&'static self, ticks: Ticks) -> Result<(), SleepError> {
        let (lock, task) = self.lock_task_context()?;

        if ticks == NO_WAIT {
            self.unlock_cpu_and_check_preemption(lock, true);
        } else {
            // Woken up either by the timeout or by `task_wake`
            let _ = self.wait_until_woken_up(lock, task, TaskSt::Sleep, ticks);
        }

        Ok(())
    }

    /// Wake up a task blocked in [`Self::task_sleep`].
    pub fn task_wake(&'static self, task: TaskId) -> Result<(), WakeTaskError> {
        let mut lock = self.lock_cpu();
        wake_task(&mut lock, task)?;
        self.unlock_cpu_and_check_preemption(lock, false);
        Ok(())
    }

    /// Terminate the current task. The task's execution state is released
    /// later by the reaper (or the idle context) and the task returns to the
    /// Init state, unless it's [`TaskFlags::DYNAMIC`].
    pub fn task_exit(&'static self) -> Result<Infallible, ExitTaskError> {
        let (lock, task) = self.lock_task_context()?;
        self.exit_current_task(lock, task, None)
    }

    /// Terminate the current task and have it restarted at
    /// `entry(kernel, param)` once it's reaped.
    pub fn task_chain(
        &'static self,
        entry: TaskEntry<P>,
        param: usize,
    ) -> Result<Infallible, ExitTaskError> {
        let (lock, task) = self.lock_task_context()?;
        self.exit_current_task(lock, task, Some((entry, param)))
    }

    fn exit_current_task(
        &'static self,
        mut lock: CpuLockGuard<'static, P>,
        task: TaskId,
        restart: Option<(TaskEntry<P>, usize)>,
    ) -> ! {
        if lock.reaper.is_some() {
            // Already signalled if this fails
            let _ = self.reap_signal.give_core(&mut lock);
        }

        let st = &mut *lock;
        let cb = &mut st.tasks[task.0];
        log::debug!("{task:?} ({:?}) is exiting", cb.attr.name);
        cb.st = TaskSt::End;
        if restart.is_some() {
            cb.restart = restart;
        }

        // This moves the task to the reap list
        choose_next_running_task(st, self.port.cpu_id(), false);
        drop(lock);

        // Safety: CPU Lock is inactive, and the task is in the reap list
        unsafe { self.port.exit_and_dispatch(self) }
    }

    /// Change the base priority of a task. A priority it inherits through a
    /// mutex stays in effect if it's more urgent than the new one.
    pub fn task_priority(
        &'static self,
        task: TaskId,
        priority: Priority,
    ) -> Result<(), SetTaskPriorityError> {
        let (mut lock, _) = self.lock_task_context()?;
        set_task_priority(self, &mut lock, task, priority)?;
        self.unlock_cpu_and_check_preemption(lock, false);
        Ok(())
    }

    /// Get the effective priority of a task.
    pub fn task_get_priority(&self, task: TaskId) -> Result<Priority, GetTaskError> {
        let mut lock = self.lock_cpu();
        let level = task_cb(&mut lock, task)?.priority;
        Ok(self.cfg.priority_of(level))
    }

    /// Get the current task.
    pub fn task_current(&self) -> Result<TaskId, GetTaskError> {
        let (_, task) = self.lock_task_context()?;
        Ok(task)
    }

    pub fn task_state(&self, task: TaskId) -> Result<TaskSt, GetTaskError> {
        let mut lock = self.lock_cpu();
        Ok(task_cb(&mut lock, task)?.st)
    }

    /// Associate `value` with `key` in a task's data slots, replacing the
    /// previous value. The slots are cleared when the task is reaped.
    pub fn task_set_data(
        &self,
        task: TaskId,
        key: usize,
        value: usize,
    ) -> Result<(), TaskDataError> {
        let mut lock = self.lock_cpu();
        let data = &mut task_cb(&mut lock, task)?.data;
        if let Some(slot) = data.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            Ok(())
        } else {
            data.try_push((key, value))
                .map_err(|_| TaskDataError::OutOfMemory)
        }
    }

    pub fn task_get_data(&self, task: TaskId, key: usize) -> Result<Option<usize>, TaskDataError> {
        let mut lock = self.lock_cpu();
        let data = &task_cb(&mut lock, task)?.data;
        Ok(data.iter().find(|(k, _)| *k == key).map(|(_, v)| *v))
    }
}
