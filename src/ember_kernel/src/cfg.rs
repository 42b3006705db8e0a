//! Kernel configuration
use crate::{utils::PRIO_BITMAP_MAX_LEN, Priority};

/// The maximum number of objects a task can wait on simultaneously (see
/// [`Kernel::semaphore_take_any`](crate::Kernel::semaphore_take_any)).
pub const MAX_WAIT_OBJECTS: usize = 8;

/// The number of key/value slots available to each task (see
/// [`Kernel::task_set_data`](crate::Kernel::task_set_data)).
pub const TASK_DATA_SLOTS: usize = 4;

/// The maximum number of mutexes a task can hold at once (see
/// [`Kernel::mutex_lock`](crate::Kernel::mutex_lock)).
pub const MAX_HELD_MUTEXES: usize = 8;

/// The default stack size of a task, in bytes. Ports may round it up.
pub const DEFAULT_STACK_SIZE: usize = 4096;

/// Controls whether starting a task from a task context can switch to a task
/// of the same priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartPolicy {
    /// Switch if any ready task is at least as urgent as the caller.
    YieldOnEqual,
    /// Switch only if a ready task is strictly more urgent than the caller.
    PreemptOnly,
}

/// Kernel configuration, built with `const fn` setters.
///
/// ```
/// use ember_kernel::{KernelCfg, StartPolicy};
/// const CFG: KernelCfg = KernelCfg::new()
///     .num_task_priority_levels(8)
///     .max_tasks(4)
///     .start_policy(StartPolicy::PreemptOnly);
/// assert_eq!(CFG.get_num_task_priority_levels(), 8);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelCfg {
    pub(crate) num_task_priority_levels: usize,
    pub(crate) max_tasks: usize,
    pub(crate) max_timers: usize,
    pub(crate) num_cpus: usize,
    pub(crate) start_policy: StartPolicy,
}

impl Default for KernelCfg {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelCfg {
    pub const fn new() -> Self {
        Self {
            num_task_priority_levels: 16,
            max_tasks: 32,
            max_timers: 16,
            num_cpus: 1,
            start_policy: StartPolicy::YieldOnEqual,
        }
    }

    /// Specify the number of task priority levels. Valid priorities are
    /// `0..levels`.
    pub const fn num_task_priority_levels(mut self, levels: usize) -> Self {
        assert!(levels > 0, "at least one priority level is required");
        assert!(
            levels <= Priority::MAX as usize + 1,
            "more priority levels than `Priority` can represent"
        );
        assert!(
            levels <= PRIO_BITMAP_MAX_LEN,
            "too many priority levels"
        );
        self.num_task_priority_levels = levels;
        self
    }

    /// Specify the capacity of the task arena.
    pub const fn max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    /// Specify the capacity of the timer arena.
    pub const fn max_timers(mut self, max_timers: usize) -> Self {
        self.max_timers = max_timers;
        self
    }

    /// Specify the number of CPUs sharing the kernel.
    pub const fn num_cpus(mut self, num_cpus: usize) -> Self {
        assert!(num_cpus > 0, "at least one CPU is required");
        self.num_cpus = num_cpus;
        self
    }

    /// Specify the dispatch behavior of [`Kernel::task_start`].
    ///
    /// [`Kernel::task_start`]: crate::Kernel::task_start
    pub const fn start_policy(mut self, start_policy: StartPolicy) -> Self {
        self.start_policy = start_policy;
        self
    }

    pub const fn get_num_task_priority_levels(&self) -> usize {
        self.num_task_priority_levels
    }

    pub const fn get_max_tasks(&self) -> usize {
        self.max_tasks
    }

    pub const fn get_max_timers(&self) -> usize {
        self.max_timers
    }

    pub const fn get_num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Convert a priority to an internal level, where `0` is the most urgent.
    /// Out-of-range values are clamped to the least urgent level.
    pub(crate) fn level_of(&self, priority: Priority) -> usize {
        let levels = self.num_task_priority_levels;
        let p = usize::from(priority);
        if p >= levels {
            levels - 1
        } else if cfg!(feature = "priority_high_is_urgent") {
            levels - 1 - p
        } else {
            p
        }
    }

    /// The inverse of [`Self::level_of`] for in-range values.
    pub(crate) fn priority_of(&self, level: usize) -> Priority {
        let p = if cfg!(feature = "priority_high_is_urgent") {
            self.num_task_priority_levels - 1 - level
        } else {
            level
        };
        p as Priority
    }
}
