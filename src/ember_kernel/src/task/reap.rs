//! Reclaiming exited tasks
//!
//! A task can't release its own stack while it's running on it. Instead,
//! [`task_switch`](super::task_switch) moves an exited task to the reap list
//! once the CPU has switched away from it, and the list is processed later
//! by a dedicated reaper task or by the idle context.
use super::{activate, choose_next_running_task, TaskFlags, TaskId, TaskSt, TaskWait};
use crate::{
    error::CreateTaskError, timeout::WAIT_FOREVER, Context, Kernel, Port, Priority, TaskAttr,
};

impl<P: Port> Kernel<P> {
    /// Process the reap list. Each exited task returns to the Init state and
    /// its port state is released. A task with a pending restart (from
    /// [`Self::task_chain`] or a timer) is started again, and a
    /// [`TaskFlags::DYNAMIC`] task is freed.
    pub fn reap(&'static self) {
        let mut restarted = false;

        loop {
            let mut lock = self.lock_cpu();
            let st = &mut *lock;
            let Some(i) = st.reap_list.pop_front(&mut st.tasks) else {
                break;
            };
            let task = TaskId(i);

            let cb = &mut st.tasks[i];
            debug_assert_eq!(cb.st, TaskSt::End);
            log::debug!("reaping {task:?} ({:?})", cb.attr.get_name());
            let port_state = cb.port_task_state.take();
            cb.st = TaskSt::Init;
            cb.priority = cb.base_priority;
            cb.held_mutexes.clear();
            cb.wait = TaskWait::new();
            cb.data.clear();

            if let Some((entry, param)) = cb.restart.take() {
                activate(self, st, task, entry, param);
                restarted = true;
            } else if cb.attr.get_flags().contains(TaskFlags::DYNAMIC) {
                st.tasks.remove(i);
            }

            drop(lock);
            if let Some(port_state) = port_state {
                self.port.release_task_state(port_state);
            }
        }

        if restarted && self.port.context() == Context::Task {
            let lock = self.lock_cpu();
            self.unlock_cpu_and_check_preemption(lock, false);
        }
    }

    /// Perform the duties of the idle context: reclaim exited tasks (unless
    /// there's a reaper task) and run ready tasks until none are left.
    ///
    /// Ports call this when the CPU has nothing to do, e.g., at boot and
    /// whenever [`Port::yield_cpu`] returns control to the idle context.
    /// [`Self::interrupt`] calls this when it interrupted the idle context.
    pub fn idle(&'static self) {
        debug_assert_eq!(self.port.context(), Context::Idle);
        let cpu = self.port.cpu_id();

        loop {
            if self.lock_cpu().reaper.is_none() {
                self.reap();
            }

            let mut lock = self.lock_cpu();
            if lock.running[cpu].is_none() {
                choose_next_running_task(&mut lock, cpu, false);
            }
            let has_task = lock.running[cpu].is_some();
            drop(lock);

            if !has_task {
                break;
            }

            // Safety: CPU Lock is inactive. This returns when the CPU becomes
            // idle again.
            unsafe { self.port.yield_cpu(self) };
        }
    }

    /// Create and start a task that reaps exited tasks as soon as they enter
    /// the reap list. Without one, reaping happens in the idle context.
    pub fn start_reaper(&'static self, priority: Priority) -> Result<TaskId, CreateTaskError> {
        let task = self.task_init(TaskAttr::new("reaper", priority))?;

        let mut lock = self.lock_cpu();
        let st = &mut *lock;
        st.reaper = Some(task);
        activate(self, st, task, Self::reaper_task_main, 0);
        self.unlock_cpu_and_check_preemption(lock, false);

        Ok(task)
    }

    fn reaper_task_main(kernel: &'static Kernel<P>, _: usize) {
        loop {
            kernel.reap();
            // Only fails in a non-task context
            let _ = kernel.semaphore_take(&kernel.reap_signal, WAIT_FOREVER);
        }
    }
}
