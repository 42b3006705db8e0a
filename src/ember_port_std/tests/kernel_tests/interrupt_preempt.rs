//! Dispatching from interrupt handlers
use ember_kernel::{
    Context, Kernel, KernelCfg, Port, Semaphore, StartTaskError, TaskAttr, TaskFlags,
    TaskId, WAIT_FOREVER,
};
use ember_port_std::StdPort;
use std::sync::OnceLock;

use crate::{boot, Trace};

/// Tasks made ready by an interrupt handler run when the handler returns,
/// provided that it calls `Isr::preempt`.
#[test]
fn preempt_on_handler_return() {
    static TRACE: Trace = Trace::new();
    static URGENT: OnceLock<TaskId> = OnceLock::new();

    fn background(kernel: &'static Kernel<StdPort>, _: usize) {
        let urgent = *URGENT.get().unwrap();

        kernel
            .interrupt(|isr| {
                assert_eq!(isr.kernel().port().context(), Context::Interrupt);
                isr.task_start(urgent, urgent_body, 0)
            })
            .unwrap();
        TRACE.push("background: no preemption");

        kernel
            .interrupt(|isr| {
                assert!(isr.preempt(false));
                // Nested handlers don't dispatch
                isr.kernel().interrupt(|_| ());
                TRACE.push("handler: returning");
            });
        TRACE.push("background: resumed");
    }

    fn urgent_body(_: &'static Kernel<StdPort>, _: usize) {
        TRACE.push("urgent");
    }

    let kernel = boot(KernelCfg::new());
    let background_task = kernel.task_init(TaskAttr::new("background", 5)).unwrap();
    URGENT
        .set(kernel.task_init(TaskAttr::new("urgent", 1)).unwrap())
        .unwrap();
    kernel
        .interrupt(|isr| isr.task_start(background_task, background, 0))
        .unwrap();

    assert_eq!(
        TRACE.take(),
        [
            "background: no preemption",
            "handler: returning",
            "urgent",
            "background: resumed",
        ]
    );
}

/// Interrupt-driven preemption leaves a `NO_PREEMPT` task running until it
/// blocks.
#[test]
fn no_preempt_task() {
    static TRACE: Trace = Trace::new();
    static SEM: Semaphore = Semaphore::new(0, 1);

    fn stubborn(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.interrupt(|isr| {
            assert!(!isr.preempt(false));
            isr.tick(1);
        });
        TRACE.push("stubborn: still running");
        kernel.semaphore_take(&SEM, WAIT_FOREVER).unwrap();
        TRACE.push("stubborn: done");
    }

    fn urgent(_: &'static Kernel<StdPort>, _: usize) {
        TRACE.push("urgent");
    }

    let kernel = boot(KernelCfg::new());
    let stubborn_task = kernel
        .task_init(TaskAttr::new("stubborn", 5).flags(TaskFlags::NO_PREEMPT))
        .unwrap();
    let urgent_task = kernel.task_init(TaskAttr::new("urgent", 1)).unwrap();
    kernel
        .interrupt(|isr| {
            isr.task_start(stubborn_task, stubborn, 0)?;
            assert!(isr.preempt(false));
            isr.task_start(urgent_task, urgent, 0)?;
            Ok::<_, StartTaskError>(())
        })
        .unwrap();
    assert_eq!(TRACE.take(), ["stubborn: still running", "urgent"]);

    kernel.interrupt(|isr| isr.semaphore_give(&SEM)).unwrap();
    assert_eq!(TRACE.take(), ["stubborn: done"]);
}
