//! Timers
//!
//! A timer fires after a delay and, if it's periodic, again every period
//! afterwards. Its handler is either a function called in the interrupt
//! context of the tick, or a task that is started (or restarted after it
//! exits) on each expiration.
use core::fmt;

use crate::{
    error::{BadIdError, CreateTimerError, TimerError},
    interrupt::Isr,
    task::{self, TaskId, TaskSt},
    timeout::{DeltaNode, Ticks},
    utils::intrusive_list::{Link, Linked},
    Kernel, Port, State, TaskEntry,
};

/// Identifies a timer created by [`Kernel::timer_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) usize);

bitflags::bitflags! {
    /// The status of a timer
    pub struct TimerFlags: u8 {
        /// The timer is rearmed after it fires.
        const PERIODIC = 1 << 0;
        /// The handler runs in the interrupt context of the tick.
        const ASYNC = 1 << 1;
        /// The timer has fired. For a task-backed timer, this is cleared when
        /// the task is dispatched.
        const EXPIRED = 1 << 2;
        /// An activation was lost: the timer fired again before the task it
        /// had started or restarted was dispatched, or more than one period
        /// elapsed within a single tick.
        const OVERFLOW = 1 << 3;
    }
}

/// What happens when a timer fires
pub enum TimerHandler<P: Port> {
    /// Call a function in the interrupt context of the tick.
    Interrupt(fn(&Isr<P>, usize)),
    /// Start `task` at `entry`. If the task is not in the Init state, it's
    /// restarted at `entry` once it exits and is reaped.
    Task { task: TaskId, entry: TaskEntry<P> },
}

impl<P: Port> Clone for TimerHandler<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for TimerHandler<P> {}

impl<P: Port> fmt::Debug for TimerHandler<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Interrupt(_) => f.write_str("Interrupt(..)"),
            Self::Task { task, .. } => f.debug_struct("Task").field("task", task).finish(),
        }
    }
}

/// The creation parameters of a timer.
pub struct TimerAttr<P: Port> {
    name: &'static str,
    delay: Ticks,
    period: Option<Ticks>,
    handler: TimerHandler<P>,
    arg: usize,
}

impl<P: Port> TimerAttr<P> {
    /// Describe a one-shot timer that fires one tick after it's armed.
    pub const fn new(name: &'static str, handler: TimerHandler<P>) -> Self {
        Self {
            name,
            delay: 1,
            period: None,
            handler,
            arg: 0,
        }
    }

    /// Specify the number of ticks from [`Kernel::timer_add`] to the first
    /// expiration.
    pub const fn delay(mut self, delay: Ticks) -> Self {
        self.delay = delay;
        self
    }

    /// Make the timer periodic. A period of zero is treated as one.
    pub const fn period(mut self, period: Ticks) -> Self {
        self.period = Some(if period == 0 { 1 } else { period });
        self
    }

    /// Specify the argument passed to the handler.
    pub const fn arg(mut self, arg: usize) -> Self {
        self.arg = arg;
        self
    }
}

impl<P: Port> Clone for TimerAttr<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for TimerAttr<P> {}

impl<P: Port> fmt::Debug for TimerAttr<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerAttr")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .field("period", &self.period)
            .field("handler", &self.handler)
            .field("arg", &self.arg)
            .finish()
    }
}

/// Which list a timer is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerSt {
    Idle,
    /// In `State::timer_list`
    Armed,
    /// In `State::timers_fired`, waiting for its handler to be run
    Fired,
}

/// Timer control block
pub(crate) struct TimerCb<P: Port> {
    attr: TimerAttr<P>,
    pub flags: TimerFlags,
    pub st: TimerSt,
    delta: Ticks,
    /// The number of ticks between the deadline and the tick that found
    /// the timer expired
    pub overshoot: Ticks,
    link: Option<Link>,
}

impl<P: Port> Linked for TimerCb<P> {
    fn link(&self) -> Option<Link> {
        self.link
    }
    fn link_mut(&mut self) -> &mut Option<Link> {
        &mut self.link
    }
}

impl<P: Port> DeltaNode for TimerCb<P> {
    fn delta(&self) -> Ticks {
        self.delta
    }
    fn delta_mut(&mut self) -> &mut Ticks {
        &mut self.delta
    }
}

impl<P: Port> fmt::Debug for TimerCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("attr", &self.attr)
            .field("flags", &self.flags)
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

fn timer_cb<P: Port>(st: &mut State<P>, timer: TimerId) -> Result<&mut TimerCb<P>, BadIdError> {
    st.timers.get_mut(timer.0).ok_or(BadIdError::BadId)
}

/// Insert a timer into the timer list.
fn arm<P: Port>(st: &mut State<P>, timer: usize, ticks: Ticks) {
    st.timer_list.insert(&mut st.timers, timer, ticks);
    st.timers[timer].st = TimerSt::Armed;
    if st.timer_list.front() == Some(timer) {
        st.tick_dirty = true;
    }
}

/// Remove a timer from whichever list it's in.
fn disarm<P: Port>(st: &mut State<P>, timer: usize) {
    match st.timers[timer].st {
        TimerSt::Idle => {}
        TimerSt::Armed => {
            if st.timer_list.remove(&mut st.timers, timer) {
                st.tick_dirty = true;
            }
        }
        TimerSt::Fired => {
            st.timers_fired.remove(&mut st.timers, timer);
        }
    }
    st.timers[timer].st = TimerSt::Idle;
}

fn create<P: Port>(
    kernel: &Kernel<P>,
    st: &mut State<P>,
    attr: TimerAttr<P>,
) -> Result<TimerId, CreateTimerError> {
    if st.timers.len() >= kernel.cfg.max_timers {
        return Err(CreateTimerError::OutOfMemory);
    }

    let mut flags = TimerFlags::empty();
    match attr.handler {
        TimerHandler::Interrupt(_) => flags |= TimerFlags::ASYNC,
        TimerHandler::Task { task, .. } => {
            task::task_cb(st, task)?;
        }
    }
    if attr.period.is_some() {
        flags |= TimerFlags::PERIODIC;
    }

    let timer = TimerId(st.timers.insert(TimerCb {
        attr,
        flags,
        st: TimerSt::Idle,
        delta: 0,
        overshoot: 0,
        link: None,
    }));
    log::debug!("created {timer:?} ({:?})", attr.name);
    Ok(timer)
}

/// (Re)arm a timer to fire after its delay.
fn add<P: Port>(st: &mut State<P>, timer: TimerId) -> Result<(), TimerError> {
    let delay = timer_cb(st, timer)?.attr.delay;
    disarm(st, timer.0);
    st.timers[timer.0].flags.remove(TimerFlags::EXPIRED);
    arm(st, timer.0, delay);
    Ok(())
}

fn cancel<P: Port>(st: &mut State<P>, timer: TimerId) -> Result<(), TimerError> {
    timer_cb(st, timer)?;
    disarm(st, timer.0);
    Ok(())
}

/// Run the handlers of the timers in `State::timers_fired`. Called in the
/// interrupt context of the tick.
pub(crate) fn fire_pending<P: Port>(kernel: &'static Kernel<P>) {
    loop {
        let mut lock = kernel.lock_cpu();
        let st = &mut *lock;
        let Some(i) = st.timers_fired.pop_front(&mut st.timers) else {
            break;
        };

        let cb = &mut st.timers[i];
        cb.st = TimerSt::Idle;
        let overshoot = cb.overshoot;
        let TimerAttr {
            handler,
            arg,
            period,
            ..
        } = cb.attr;

        let timer = TimerId(i);
        if let Some(period) = period {
            // The next deadline is relative to the one that just passed
            arm(st, i, period - overshoot % period);

            let missed = overshoot / period;
            if missed > 0 {
                st.timers[i].flags.insert(TimerFlags::OVERFLOW);
                log::warn!("{timer:?} missed {missed} expiration(s) in a single tick");
            }
        }

        match handler {
            TimerHandler::Interrupt(func) => {
                st.timers[i].flags.insert(TimerFlags::EXPIRED);
                drop(lock);
                log::trace!("calling the handler of {timer:?}");
                func(&Isr::new(kernel), arg);
            }
            TimerHandler::Task { task, entry } => {
                let flags = &mut st.timers[i].flags;
                if flags.contains(TimerFlags::EXPIRED) {
                    flags.insert(TimerFlags::OVERFLOW);
                    log::warn!("{timer:?} expired before {task:?} was dispatched");
                    continue;
                }
                flags.insert(TimerFlags::EXPIRED);

                let Some(task_cb) = st.tasks.get_mut(task.0) else {
                    log::warn!("{timer:?} refers to a deleted task {task:?}");
                    continue;
                };
                task_cb.timer = Some(timer);
                if task_cb.st == TaskSt::Init {
                    task::activate(kernel, st, task, entry, arg);
                } else {
                    log::trace!("{task:?} will be restarted by {timer:?}");
                    task_cb.restart = Some((entry, arg));
                }
            }
        }
    }
}

impl<P: Port> Kernel<P> {
    /// Create a timer. The timer does not run until it's armed by
    /// [`Self::timer_add`].
    pub fn timer_create(&self, attr: TimerAttr<P>) -> Result<TimerId, CreateTimerError> {
        create(self, &mut self.lock_cpu(), attr)
    }

    /// Arm a timer to fire after its delay. If it's already armed, the delay
    /// starts over. Clears [`TimerFlags::EXPIRED`].
    pub fn timer_add(&self, timer: TimerId) -> Result<(), TimerError> {
        add(&mut self.lock_cpu(), timer)
    }

    /// Disarm a timer. Does nothing if it's not armed.
    pub fn timer_cancel(&self, timer: TimerId) -> Result<(), TimerError> {
        cancel(&mut self.lock_cpu(), timer)
    }

    pub fn timer_flags(&self, timer: TimerId) -> Result<TimerFlags, TimerError> {
        Ok(timer_cb(&mut self.lock_cpu(), timer)?.flags)
    }

    /// Clear the specified status flags, such as [`TimerFlags::OVERFLOW`].
    /// [`TimerFlags::PERIODIC`] and [`TimerFlags::ASYNC`] can't be cleared.
    pub fn timer_clear_flags(&self, timer: TimerId, flags: TimerFlags) -> Result<(), TimerError> {
        let mut lock = self.lock_cpu();
        let cb = timer_cb(&mut lock, timer)?;
        cb.flags
            .remove(flags & (TimerFlags::EXPIRED | TimerFlags::OVERFLOW));
        Ok(())
    }
}

impl<P: Port> Isr<P> {
    pub fn timer_add(&self, timer: TimerId) -> Result<(), TimerError> {
        self.kernel().timer_add(timer)
    }

    pub fn timer_cancel(&self, timer: TimerId) -> Result<(), TimerError> {
        self.kernel().timer_cancel(timer)
    }

    pub fn timer_flags(&self, timer: TimerId) -> Result<TimerFlags, TimerError> {
        self.kernel().timer_flags(timer)
    }

    pub fn timer_clear_flags(&self, timer: TimerId, flags: TimerFlags) -> Result<(), TimerError> {
        self.kernel().timer_clear_flags(timer, flags)
    }
}
