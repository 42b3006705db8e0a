//! Priority inheritance of mutexes
use ember_kernel::{
    Kernel, KernelCfg, LockMutexError, Mutex, TaskAttr, NO_WAIT, WAIT_FOREVER,
};
use ember_port_std::StdPort;

use crate::{boot, Trace};

/// A less urgent task holding a mutex runs ahead of a medium-priority task
/// while a more urgent task waits for the mutex.
#[test]
fn owner_inherits_waiter_priority() {
    static M: Mutex = Mutex::new();
    static TRACE: Trace = Trace::new();

    fn low(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.mutex_lock(&M, WAIT_FOREVER).unwrap();
        TRACE.push("low: locked");
        kernel.task_sleep(10).unwrap();
        TRACE.push("low: unlocking");
        kernel.mutex_unlock(&M).unwrap();
        TRACE.push("low: done");
    }

    fn high(kernel: &'static Kernel<StdPort>, _: usize) {
        TRACE.push("high: locking");
        kernel.mutex_lock(&M, WAIT_FOREVER).unwrap();
        TRACE.push("high: locked");
        assert_eq!(kernel.mutex_owner(&M), kernel.task_current().ok());
        kernel.mutex_unlock(&M).unwrap();
    }

    fn mid(_: &'static Kernel<StdPort>, _: usize) {
        TRACE.push("mid: running");
    }

    let kernel = boot(KernelCfg::new());
    let low_task = kernel.task_init(TaskAttr::new("low", 5)).unwrap();
    let high_task = kernel.task_init(TaskAttr::new("high", 1)).unwrap();
    let mid_task = kernel.task_init(TaskAttr::new("mid", 3)).unwrap();

    kernel
        .interrupt(|isr| isr.task_start(low_task, low, 0))
        .unwrap();
    kernel
        .interrupt(|isr| isr.task_start(high_task, high, 0))
        .unwrap();
    assert_eq!(kernel.task_get_priority(low_task), Ok(1));
    assert_eq!(kernel.mutex_owner(&M), Some(low_task));

    // `mid` becomes ready at the same time as `low` wakes up
    kernel
        .interrupt(|isr| {
            isr.task_start(mid_task, mid, 0)?;
            isr.tick(10);
            Ok::<_, ember_kernel::StartTaskError>(())
        })
        .unwrap();

    assert_eq!(
        TRACE.take(),
        [
            "low: locked",
            "high: locking",
            "low: unlocking",
            "high: locked",
            "mid: running",
            "low: done",
        ]
    );
    assert_eq!(kernel.task_get_priority(low_task), Ok(5));
    assert_eq!(kernel.mutex_owner(&M), None);
}

/// A timed-out waiter leaves the inherited priority in place until the owner
/// releases the mutex.
#[test]
fn inheritance_outlives_timed_out_waiter() {
    static M: Mutex = Mutex::new();
    static TRACE: Trace = Trace::new();

    fn low(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.mutex_lock(&M, WAIT_FOREVER).unwrap();
        kernel.task_sleep(20).unwrap();
        kernel.mutex_unlock(&M).unwrap();
        TRACE.push("low: unlocked");
    }

    fn high(kernel: &'static Kernel<StdPort>, _: usize) {
        assert_eq!(kernel.mutex_lock(&M, NO_WAIT), Err(LockMutexError::Timeout));
        assert_eq!(kernel.mutex_lock(&M, 5), Err(LockMutexError::Timeout));
        TRACE.push("high: timed out");
    }

    let kernel = boot(KernelCfg::new());
    let low_task = kernel.task_init(TaskAttr::new("low", 6)).unwrap();
    let high_task = kernel.task_init(TaskAttr::new("high", 2)).unwrap();

    kernel
        .interrupt(|isr| isr.task_start(low_task, low, 0))
        .unwrap();
    kernel
        .interrupt(|isr| isr.task_start(high_task, high, 0))
        .unwrap();
    assert_eq!(kernel.task_get_priority(low_task), Ok(2));

    ember_port_std::run_for(kernel, 5);
    assert_eq!(TRACE.take(), ["high: timed out"]);
    assert_eq!(kernel.task_get_priority(low_task), Ok(2));

    ember_port_std::run_for(kernel, 15);
    assert_eq!(TRACE.take(), ["low: unlocked"]);
    assert_eq!(kernel.task_get_priority(low_task), Ok(6));
}

/// A mutex can be locked again by its owner and must be unlocked as many
/// times. Unlocking a mutex owned by another task has no effect.
#[test]
fn recursive_lock_and_foreign_unlock() {
    static M: Mutex = Mutex::new();
    static TRACE: Trace = Trace::new();

    fn owner(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.mutex_lock(&M, WAIT_FOREVER).unwrap();
        kernel.mutex_lock(&M, WAIT_FOREVER).unwrap();
        kernel.task_sleep(10).unwrap();
        kernel.mutex_unlock(&M).unwrap();
        TRACE.push("owner: unlocked once");
        kernel.task_sleep(10).unwrap();
        kernel.mutex_unlock(&M).unwrap();
        TRACE.push("owner: unlocked twice");
    }

    fn intruder(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.mutex_unlock(&M).unwrap();
        TRACE.push("intruder: unlocked");
        kernel.mutex_lock(&M, WAIT_FOREVER).unwrap();
        TRACE.push("intruder: locked");
        kernel.mutex_unlock(&M).unwrap();
    }

    let kernel = boot(KernelCfg::new());
    let owner_task = kernel.task_init(TaskAttr::new("owner", 4)).unwrap();
    let intruder_task = kernel.task_init(TaskAttr::new("intruder", 4)).unwrap();

    kernel
        .interrupt(|isr| isr.task_start(owner_task, owner, 0))
        .unwrap();
    kernel
        .interrupt(|isr| isr.task_start(intruder_task, intruder, 0))
        .unwrap();
    assert_eq!(kernel.mutex_owner(&M), Some(owner_task));

    ember_port_std::run_for(kernel, 10);
    assert_eq!(kernel.mutex_owner(&M), Some(owner_task));
    ember_port_std::run_for(kernel, 10);

    assert_eq!(
        TRACE.take(),
        [
            "intruder: unlocked",
            "owner: unlocked once",
            "owner: unlocked twice",
            "intruder: locked",
        ]
    );
    assert_eq!(kernel.mutex_owner(&M), None);
}

/// Releasing mutexes in a different order than they were acquired drops the
/// inherited priority along with the mutex it came from.
#[test]
fn unlock_out_of_order_restores_base_priority() {
    static M1: Mutex = Mutex::new();
    static M2: Mutex = Mutex::new();
    static TRACE: Trace = Trace::new();

    fn level(kernel: &'static Kernel<StdPort>) -> u8 {
        let me = kernel.task_current().unwrap();
        kernel.task_get_priority(me).unwrap()
    }

    fn low(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.mutex_lock(&M1, WAIT_FOREVER).unwrap();
        kernel.task_sleep(10).unwrap();
        kernel.mutex_lock(&M2, WAIT_FOREVER).unwrap();
        TRACE.push(format!("low: level {} holding both", level(kernel)));
        kernel.mutex_unlock(&M1).unwrap();
        TRACE.push(format!("low: level {} after releasing M1", level(kernel)));
        kernel.mutex_unlock(&M2).unwrap();
        TRACE.push(format!("low: level {} after releasing M2", level(kernel)));
    }

    fn high(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.mutex_lock(&M1, WAIT_FOREVER).unwrap();
        TRACE.push("high: locked M1");
        kernel.mutex_unlock(&M1).unwrap();
    }

    let kernel = boot(KernelCfg::new());
    let low_task = kernel.task_init(TaskAttr::new("low", 5)).unwrap();
    let high_task = kernel.task_init(TaskAttr::new("high", 1)).unwrap();

    kernel
        .interrupt(|isr| isr.task_start(low_task, low, 0))
        .unwrap();
    kernel
        .interrupt(|isr| isr.task_start(high_task, high, 0))
        .unwrap();
    assert_eq!(kernel.task_get_priority(low_task), Ok(1));

    ember_port_std::run_for(kernel, 10);

    assert_eq!(
        TRACE.take(),
        [
            "low: level 1 holding both",
            "high: locked M1",
            "low: level 5 after releasing M1",
            "low: level 5 after releasing M2",
        ]
    );
    assert_eq!(kernel.task_get_priority(low_task), Ok(5));
    assert_eq!(kernel.mutex_owner(&M1), None);
    assert_eq!(kernel.mutex_owner(&M2), None);
}

/// A base priority change made while holding a mutex survives the unlock,
/// and doesn't cancel a priority inherited from a waiter.
#[test]
fn priority_change_while_holding_mutex() {
    static M: Mutex = Mutex::new();
    static TRACE: Trace = Trace::new();

    fn low(kernel: &'static Kernel<StdPort>, _: usize) {
        let me = kernel.task_current().unwrap();
        kernel.mutex_lock(&M, WAIT_FOREVER).unwrap();
        kernel.task_priority(me, 7).unwrap();
        TRACE.push(format!("low: level {}", kernel.task_get_priority(me).unwrap()));
        kernel.task_sleep(10).unwrap();
        kernel.task_priority(me, 6).unwrap();
        TRACE.push(format!(
            "low: level {} with a waiter",
            kernel.task_get_priority(me).unwrap()
        ));
        kernel.mutex_unlock(&M).unwrap();
        TRACE.push(format!(
            "low: level {} after unlocking",
            kernel.task_get_priority(me).unwrap()
        ));
    }

    fn high(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.mutex_lock(&M, WAIT_FOREVER).unwrap();
        TRACE.push("high: locked");
        kernel.mutex_unlock(&M).unwrap();
    }

    let kernel = boot(KernelCfg::new());
    let low_task = kernel.task_init(TaskAttr::new("low", 5)).unwrap();
    let high_task = kernel.task_init(TaskAttr::new("high", 1)).unwrap();

    kernel
        .interrupt(|isr| isr.task_start(low_task, low, 0))
        .unwrap();
    assert_eq!(kernel.task_get_priority(low_task), Ok(7));
    kernel
        .interrupt(|isr| isr.task_start(high_task, high, 0))
        .unwrap();
    assert_eq!(kernel.task_get_priority(low_task), Ok(1));

    ember_port_std::run_for(kernel, 10);

    assert_eq!(
        TRACE.take(),
        [
            "low: level 7",
            "low: level 1 with a waiter",
            "high: locked",
            "low: level 6 after unlocking",
        ]
    );
    assert_eq!(kernel.task_get_priority(low_task), Ok(6));
}
