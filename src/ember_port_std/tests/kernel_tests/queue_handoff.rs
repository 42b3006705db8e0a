//! Queues: buffering, direct handoff and peeking
use ember_kernel::{Kernel, KernelCfg, Queue, QueueEnd, TaskAttr, WaitError, NO_WAIT, WAIT_FOREVER};
use ember_port_std::StdPort;

use crate::{boot, Trace};

/// A second push to a full capacity-1 queue blocks until the consumer makes
/// room for it.
#[test]
fn capacity_one_blocks_second_push() {
    static Q: Queue<char, 1> = Queue::new();
    static TRACE: Trace = Trace::new();

    fn producer(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.queue_push(&Q, 'A', QueueEnd::Back, WAIT_FOREVER).unwrap();
        TRACE.push("pushed A");
        assert_eq!(
            kernel
                .queue_push(&Q, 'X', QueueEnd::Back, NO_WAIT)
                .map_err(|e| e.into_inner()),
            Err('X')
        );
        kernel.queue_push(&Q, 'B', QueueEnd::Back, WAIT_FOREVER).unwrap();
        TRACE.push("pushed B");
    }

    fn consumer(kernel: &'static Kernel<StdPort>, _: usize) {
        for _ in 0..2 {
            let x = kernel
                .queue_pop(&Q, QueueEnd::Front, false, WAIT_FOREVER)
                .unwrap();
            TRACE.push(format!("popped {x}"));
        }
        assert_eq!(
            kernel.queue_pop(&Q, QueueEnd::Front, false, NO_WAIT),
            Err(WaitError::Timeout)
        );
    }

    let kernel = boot(KernelCfg::new());
    let producer_task = kernel.task_init(TaskAttr::new("producer", 2)).unwrap();
    let consumer_task = kernel.task_init(TaskAttr::new("consumer", 3)).unwrap();
    kernel
        .interrupt(|isr| {
            isr.task_start(producer_task, producer, 0)?;
            isr.task_start(consumer_task, consumer, 0)
        })
        .unwrap();

    assert_eq!(TRACE.take(), ["pushed A", "pushed B", "popped A", "popped B"]);
    assert_eq!(kernel.queue_len(&Q), 0);
}

/// A value pushed while tasks are waiting goes to them without passing
/// through the buffer: every peeker gets a copy and the most urgent popper
/// takes it.
#[test]
fn push_hands_off_to_waiters() {
    static Q: Queue<u32, 4> = Queue::new();
    static TRACE: Trace = Trace::new();

    fn popper(kernel: &'static Kernel<StdPort>, name: usize) {
        let x = kernel
            .queue_pop(&Q, QueueEnd::Front, false, WAIT_FOREVER)
            .unwrap();
        TRACE.push(format!("popper{name}: {x}"));
    }

    fn peeker(kernel: &'static Kernel<StdPort>, _: usize) {
        let x = kernel
            .queue_pop(&Q, QueueEnd::Back, true, WAIT_FOREVER)
            .unwrap();
        TRACE.push(format!("peeker: {x}"));
    }

    fn producer(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.queue_push(&Q, 7, QueueEnd::Back, NO_WAIT).unwrap();
        TRACE.push(format!("pushed 7, len = {}", kernel.queue_len(&Q)));
        kernel.queue_push(&Q, 8, QueueEnd::Back, NO_WAIT).unwrap();
        TRACE.push(format!("pushed 8, len = {}", kernel.queue_len(&Q)));
        kernel.queue_push(&Q, 9, QueueEnd::Back, NO_WAIT).unwrap();
        TRACE.push(format!("pushed 9, len = {}", kernel.queue_len(&Q)));
    }

    let kernel = boot(KernelCfg::new());
    // The less urgent popper starts waiting first
    let popper_low = kernel.task_init(TaskAttr::new("popper", 4)).unwrap();
    let popper_high = kernel.task_init(TaskAttr::new("popper", 1)).unwrap();
    let peeker_task = kernel.task_init(TaskAttr::new("peeker", 0)).unwrap();
    let producer_task = kernel.task_init(TaskAttr::new("producer", 5)).unwrap();
    kernel
        .interrupt(|isr| isr.task_start(popper_low, popper, 1))
        .unwrap();
    kernel
        .interrupt(|isr| {
            isr.task_start(popper_high, popper, 0)?;
            isr.task_start(peeker_task, peeker, 0)
        })
        .unwrap();
    assert!(TRACE.take().is_empty());

    kernel
        .interrupt(|isr| isr.task_start(producer_task, producer, 0))
        .unwrap();

    assert_eq!(
        TRACE.take(),
        [
            "peeker: 7",
            "popper0: 7",
            "pushed 7, len = 0",
            "popper1: 8",
            "pushed 8, len = 0",
            "pushed 9, len = 1",
        ]
    );
}

/// A popper taking the last slot of a full queue refills it from a blocked
/// pusher, and values pushed to the front come out first.
#[test]
fn both_ends() {
    static Q: Queue<u32, 2> = Queue::new();
    static TRACE: Trace = Trace::new();

    fn pusher(kernel: &'static Kernel<StdPort>, _: usize) {
        kernel.queue_push(&Q, 1, QueueEnd::Back, NO_WAIT).unwrap();
        kernel.queue_push(&Q, 0, QueueEnd::Front, NO_WAIT).unwrap();
        // Blocks until `popper` takes a value
        kernel.queue_push(&Q, 9, QueueEnd::Front, WAIT_FOREVER).unwrap();
        TRACE.push("pushed 9");
    }

    fn popper(kernel: &'static Kernel<StdPort>, _: usize) {
        for end in [QueueEnd::Front, QueueEnd::Back, QueueEnd::Front] {
            let x = kernel.queue_pop(&Q, end, false, NO_WAIT).unwrap();
            TRACE.push(format!("popped {x}"));
        }
    }

    let kernel = boot(KernelCfg::new());
    let pusher_task = kernel.task_init(TaskAttr::new("pusher", 1)).unwrap();
    let popper_task = kernel.task_init(TaskAttr::new("popper", 2)).unwrap();
    kernel
        .interrupt(|isr| {
            isr.task_start(pusher_task, pusher, 0)?;
            isr.task_start(popper_task, popper, 0)
        })
        .unwrap();

    assert_eq!(TRACE.take(), ["pushed 9", "popped 0", "popped 1", "popped 9"]);
}
