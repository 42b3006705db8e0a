//! Scheduling among tasks of equal priority
use ember_kernel::{Kernel, KernelCfg, StartPolicy, TaskAttr, NO_WAIT};
use ember_port_std::StdPort;

use crate::{boot, Trace};

#[test]
fn zero_sleep_rotates_equal_priority() {
    static TRACE: Trace = Trace::new();

    fn body(kernel: &'static Kernel<StdPort>, name: usize) {
        let name = char::from(b'a' + name as u8);
        for i in 0..3 {
            TRACE.push(format!("{name}{i}"));
            kernel.task_sleep(NO_WAIT).unwrap();
        }
    }

    let kernel = boot(KernelCfg::new());
    let tasks: Vec<_> = (0..3)
        .map(|_| kernel.task_init(TaskAttr::new("rr", 2)).unwrap())
        .collect();
    kernel
        .interrupt(|isr| {
            for (i, &task) in tasks.iter().enumerate() {
                isr.task_start(task, body, i)?;
            }
            Ok::<_, ember_kernel::StartTaskError>(())
        })
        .unwrap();

    assert_eq!(
        TRACE.take(),
        ["a0", "b0", "c0", "a1", "b1", "c1", "a2", "b2", "c2"]
    );
}

#[test]
fn zero_sleep_alone_keeps_running() {
    static TRACE: Trace = Trace::new();

    fn busy(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.task_sleep(NO_WAIT).unwrap();
        TRACE.push("busy: resumed");
    }

    fn lazy(_: &'static Kernel<StdPort>, _: usize) {
        TRACE.push("lazy: running");
    }

    let kernel = boot(KernelCfg::new());
    let busy_task = kernel.task_init(TaskAttr::new("busy", 1)).unwrap();
    let lazy_task = kernel.task_init(TaskAttr::new("lazy", 2)).unwrap();
    kernel
        .interrupt(|isr| {
            isr.task_start(lazy_task, lazy, 0)?;
            isr.task_start(busy_task, busy, 0)
        })
        .unwrap();

    // Only tasks of the same priority can take over
    assert_eq!(TRACE.take(), ["busy: resumed", "lazy: running"]);
}

fn start_child_of_equal_priority(policy: StartPolicy) -> Vec<String> {
    /// One for each policy, as the tests run in parallel
    static TRACES: [Trace; 2] = [Trace::new(), Trace::new()];

    fn parent(kernel: &'static Kernel<StdPort>, i: usize) {
        let child = kernel.task_init(TaskAttr::new("child", 3)).unwrap();
        kernel.task_start(child, child_body, i).unwrap();
        TRACES[i].push("parent: started child");
    }

    fn child_body(_: &'static Kernel<StdPort>, i: usize) {
        TRACES[i].push("child: running");
    }

    let i = match policy {
        StartPolicy::YieldOnEqual => 0,
        StartPolicy::PreemptOnly => 1,
    };
    let kernel = boot(KernelCfg::new().start_policy(policy));
    let parent_task = kernel.task_init(TaskAttr::new("parent", 3)).unwrap();

    kernel
        .interrupt(|isr| isr.task_start(parent_task, parent, i))
        .unwrap();
    TRACES[i].take()
}

#[test]
fn start_yields_on_equal_priority() {
    assert_eq!(
        start_child_of_equal_priority(StartPolicy::YieldOnEqual),
        ["child: running", "parent: started child"]
    );
}

#[test]
fn start_preempts_only_on_higher_priority() {
    assert_eq!(
        start_child_of_equal_priority(StartPolicy::PreemptOnly),
        ["parent: started child", "child: running"]
    );
}
