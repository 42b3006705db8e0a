//! Execution context checks
use crate::{error::BadContextError, klock::CpuLockGuard, Context, Kernel, Port, TaskId};

impl<P: Port> Kernel<P> {
    /// Enter CPU Lock if the current context is a task context, and identify
    /// the running task.
    pub(crate) fn lock_task_context(
        &self,
    ) -> Result<(CpuLockGuard<'_, P>, TaskId), BadContextError> {
        expect_task_context(&self.port)?;
        let lock = self.lock_cpu();
        let task = lock.running[self.port.cpu_id()].ok_or(BadContextError::BadContext)?;
        Ok((lock, task))
    }
}

/// If the current context is not a task context, return `Err(BadContext)`.
pub(crate) fn expect_task_context<P: Port>(port: &P) -> Result<(), BadContextError> {
    if port.context() == Context::Task {
        Ok(())
    } else {
        Err(BadContextError::BadContext)
    }
}
