//! Task exit, chaining, reaping and per-task data
use ember_kernel::{
    CreateTaskError, Kernel, KernelCfg, SleepError, TaskAttr, TaskFlags, TaskSt, WAIT_FOREVER,
};
use ember_port_std::StdPort;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{boot, Trace};

#[test]
fn chain_through_reaper() {
    static TRACE: Trace = Trace::new();

    fn body(kernel: &'static Kernel<StdPort>, n: usize) {
        TRACE.push(format!("run {n}"));
        let me = kernel.task_current().unwrap();
        assert_eq!(kernel.task_get_data(me, 0), Ok(None));
        kernel.task_set_data(me, 0, n).unwrap();

        if n < 3 {
            match kernel.task_chain(body, n + 1) {
                Ok(never) => match never {},
                Err(e) => panic!("{e:?}"),
            }
        }
    }

    let kernel = boot(KernelCfg::new());
    kernel.start_reaper(0).unwrap();
    let task = kernel.task_init(TaskAttr::new("chained", 2)).unwrap();
    kernel.interrupt(|isr| isr.task_start(task, body, 0)).unwrap();

    assert_eq!(TRACE.take(), ["run 0", "run 1", "run 2", "run 3"]);
    assert_eq!(kernel.task_state(task), Ok(TaskSt::Init));
    assert_eq!(kernel.task_get_data(task, 0), Ok(None));
}

#[test]
fn exit_skips_rest_of_task() {
    static TRACE: Trace = Trace::new();

    fn body(kernel: &'static Kernel<StdPort>, _: usize) {
        TRACE.push("before exit");
        match kernel.task_exit() {
            Ok(never) => match never {},
            Err(e) => panic!("{e:?}"),
        }
    }

    let kernel = boot(KernelCfg::new());
    let task = kernel.task_init(TaskAttr::new("exiting", 2)).unwrap();
    kernel.interrupt(|isr| isr.task_start(task, body, 0)).unwrap();
    assert_eq!(TRACE.take(), ["before exit"]);
    assert_eq!(kernel.task_state(task), Ok(TaskSt::Init));

    // It can be started again
    kernel.interrupt(|isr| isr.task_start(task, body, 0)).unwrap();
    assert_eq!(TRACE.take(), ["before exit"]);
}

#[test]
fn dynamic_task_is_freed() {
    static RUNS: AtomicUsize = AtomicUsize::new(0);

    fn body(_: &'static Kernel<StdPort>, _: usize) {
        RUNS.fetch_add(1, Ordering::Relaxed);
    }

    let kernel = boot(KernelCfg::new().max_tasks(1));
    for i in 1..=3 {
        let task = kernel
            .task_init(TaskAttr::new("dynamic", 1).flags(TaskFlags::DYNAMIC))
            .unwrap();
        assert_eq!(
            kernel.task_init(TaskAttr::new("extra", 1)),
            Err(CreateTaskError::OutOfMemory)
        );
        kernel.interrupt(|isr| isr.task_start(task, body, 0)).unwrap();
        assert_eq!(RUNS.load(Ordering::Relaxed), i);
    }
}

#[test]
fn priority_change_takes_effect_immediately() {
    static TRACE: Trace = Trace::new();

    fn lowering(kernel: &'static Kernel<StdPort>, _: usize) {
        let me = kernel.task_current().unwrap();
        TRACE.push("lowering: start");
        kernel.task_priority(me, 9).unwrap();
        TRACE.push("lowering: resumed");
    }

    fn other(_: &'static Kernel<StdPort>, _: usize) {
        TRACE.push("other");
    }

    let kernel = boot(KernelCfg::new());
    let lowering_task = kernel.task_init(TaskAttr::new("lowering", 1)).unwrap();
    let other_task = kernel.task_init(TaskAttr::new("other", 5)).unwrap();
    kernel
        .interrupt(|isr| {
            isr.task_start(lowering_task, lowering, 0)?;
            isr.task_start(other_task, other, 0)
        })
        .unwrap();

    assert_eq!(
        TRACE.take(),
        ["lowering: start", "other", "lowering: resumed"]
    );
    assert_eq!(kernel.task_get_priority(lowering_task), Ok(9));
}

#[test]
fn task_only_operations_fail_outside_tasks() {
    let kernel = boot(KernelCfg::new());
    assert_eq!(kernel.task_sleep(WAIT_FOREVER), Err(SleepError::BadContext));
    assert!(kernel.task_current().is_err());
    assert!(kernel.task_exit().is_err());
    kernel.interrupt(|isr| {
        assert_eq!(isr.kernel().task_sleep(1), Err(SleepError::BadContext));
    });
}
