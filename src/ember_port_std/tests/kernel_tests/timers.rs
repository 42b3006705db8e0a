//! Timers with interrupt and task handlers
use ember_kernel::{
    Isr, Kernel, KernelCfg, TaskAttr, TaskSt, TimerAttr, TimerFlags, TimerHandler,
};
use ember_port_std::StdPort;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{boot, Trace};

#[test]
fn one_shot_and_periodic() {
    static TRACE: Trace = Trace::new();

    fn handler(isr: &Isr<StdPort>, arg: usize) {
        TRACE.push(format!("timer{arg} at {}", isr.time()));
    }

    let kernel = boot(KernelCfg::new());
    let one_shot = kernel
        .timer_create(
            TimerAttr::new("one-shot", TimerHandler::Interrupt(handler))
                .delay(4)
                .arg(0),
        )
        .unwrap();
    let periodic = kernel
        .timer_create(
            TimerAttr::new("periodic", TimerHandler::Interrupt(handler))
                .delay(1)
                .period(3)
                .arg(1),
        )
        .unwrap();
    kernel.timer_add(one_shot).unwrap();
    kernel.timer_add(periodic).unwrap();

    ember_port_std::run_for(kernel, 8);
    kernel.timer_cancel(periodic).unwrap();
    ember_port_std::run_for(kernel, 8);

    assert_eq!(
        TRACE.take(),
        ["timer1 at 1", "timer0 at 4", "timer1 at 4", "timer1 at 7"]
    );
    assert_eq!(kernel.port().pending_tick(), None);
    assert!(kernel.timer_flags(one_shot).unwrap().contains(TimerFlags::EXPIRED));
    assert!(!kernel.timer_flags(one_shot).unwrap().contains(TimerFlags::PERIODIC));

    // Re-adding restarts the delay and clears the expiration
    kernel.timer_add(one_shot).unwrap();
    assert!(!kernel.timer_flags(one_shot).unwrap().contains(TimerFlags::EXPIRED));
    assert_eq!(ember_port_std::advance(kernel), Some(4));
    assert_eq!(TRACE.take(), ["timer0 at 20"]);
}

/// A timer whose task can't be dispatched before the next expiration
/// reports an overflow.
#[test]
fn task_timer_overflow() {
    static TRACE: Trace = Trace::new();
    static TIMER: std::sync::OnceLock<ember_kernel::TimerId> = std::sync::OnceLock::new();

    fn busy(kernel: &'static Kernel<StdPort>, _: usize) {
        let timer = *TIMER.get().unwrap();
        kernel.timer_add(timer).unwrap();

        // Tick interrupts taken while this task keeps the CPU
        for _ in 0..3 {
            kernel.interrupt(|isr| isr.tick(1));
        }

        let flags = kernel.timer_flags(timer).unwrap();
        assert!(flags.contains(TimerFlags::EXPIRED | TimerFlags::OVERFLOW));
        kernel.timer_cancel(timer).unwrap();
        kernel
            .timer_clear_flags(timer, TimerFlags::OVERFLOW)
            .unwrap();
        TRACE.push("busy: done");
    }

    fn worker(kernel: &'static Kernel<StdPort>, _: usize) {
        let flags = kernel.timer_flags(*TIMER.get().unwrap()).unwrap();
        assert!(!flags.contains(TimerFlags::EXPIRED));
        TRACE.push("worker");
    }

    let kernel = boot(KernelCfg::new());
    let busy_task = kernel.task_init(TaskAttr::new("busy", 0)).unwrap();
    let worker_task = kernel.task_init(TaskAttr::new("worker", 5)).unwrap();
    let timer = kernel
        .timer_create(
            TimerAttr::new(
                "worker",
                TimerHandler::Task {
                    task: worker_task,
                    entry: worker,
                },
            )
            .period(1),
        )
        .unwrap();
    TIMER.set(timer).unwrap();

    kernel
        .interrupt(|isr| isr.task_start(busy_task, busy, 0))
        .unwrap();

    // The worker ran once for three expirations
    assert_eq!(TRACE.take(), ["busy: done", "worker"]);
    assert_eq!(kernel.timer_flags(timer), Ok(TimerFlags::PERIODIC));
    assert_eq!(kernel.task_state(worker_task), Ok(TaskSt::Init));
}

/// An expiration while the task is still running restarts it after it
/// exits.
#[test]
fn task_timer_restarts_running_task() {
    static RUNS: AtomicUsize = AtomicUsize::new(0);

    fn worker(kernel: &'static Kernel<StdPort>, _: usize) {
        RUNS.fetch_add(1, Ordering::Relaxed);
        kernel.task_sleep(15).unwrap();
    }

    let kernel = boot(KernelCfg::new());
    let worker_task = kernel.task_init(TaskAttr::new("worker", 1)).unwrap();
    let timer = kernel
        .timer_create(
            TimerAttr::new(
                "worker",
                TimerHandler::Task {
                    task: worker_task,
                    entry: worker,
                },
            )
            .delay(10)
            .period(10),
        )
        .unwrap();
    kernel.timer_add(timer).unwrap();

    ember_port_std::run_for(kernel, 10);
    assert_eq!(RUNS.load(Ordering::Relaxed), 1);

    // Expires at 20 while the worker sleeps until 25
    ember_port_std::run_for(kernel, 14);
    assert_eq!(RUNS.load(Ordering::Relaxed), 1);
    ember_port_std::run_for(kernel, 1);
    assert_eq!(RUNS.load(Ordering::Relaxed), 2);
    assert_eq!(kernel.task_state(worker_task), Ok(TaskSt::Sleep));
    assert!(!kernel.timer_flags(timer).unwrap().contains(TimerFlags::OVERFLOW));
}
