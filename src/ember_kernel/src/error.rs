//! Result codes and per-operation error types
use core::fmt;

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use ember_kernel::ResultCode;
            /// assert_eq!(ResultCode::BadObjectState.as_str(), "BadObjectState");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Display for ResultCode {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_result_code! {
    /// All result codes that a kernel operation can produce.
    ///
    /// Each operation has its own error type (e.g., [`WaitError`]) whose
    /// variants are a subset of these.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful.
        Success = 0,
        /// A parameter is invalid in a way that is not covered by any other
        /// error code.
        BadParam = -17,
        /// The specified object identifier does not refer to a live object.
        BadId = -18,
        /// The current context disallows the operation.
        BadContext = -25,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// An object is full and can't accept any more items.
        QueueOverflow = -43,
        /// A fixed-capacity kernel arena is exhausted.
        OutOfMemory = -45,
        /// The operation timed out.
        Timeout = -50,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Debug::fmt(&ResultCode::from(*self), f)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&ResultCode::from(*self), f)
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $( $name::$vname => Self::$vname, )*
                }
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(ResultCode::$vname, ResultCode::from($name::$vname));
                    assert_eq!(ResultCode::$vname as i8, $name::$vname as i8);
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $( $name::$vname => Self::$vname, )*
                        }
                    }
                }
            };
        }
    };
}

// Shared sub-errors. Kernel internals return these and `?` widens them into
// the error type of each operation.

define_error! {
    mod bad_context_error {}
    /// The operation was requested from a context that disallows it.
    pub enum BadContextError {
        /// The current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod bad_id_error {}
    /// The specified task or timer does not exist.
    pub enum BadIdError {
        /// The identifier is stale or was never issued.
        BadId,
    }
}

define_error! {
    mod bad_object_state_error {}
    /// The target object is in a state that disallows the operation.
    pub enum BadObjectStateError {
        /// See the documentation of each operation.
        BadObjectState,
    }
}

define_error! {
    mod create_task_error {}
    /// Error type for [`Kernel::task_init`](crate::Kernel::task_init).
    pub enum CreateTaskError {
        /// The task arena is full.
        OutOfMemory,
    }
}

define_error! {
    mod start_task_error {}
    /// Error type for [`Kernel::task_start`](crate::Kernel::task_start).
    pub enum StartTaskError: BadContextError, BadIdError, BadObjectStateError {
        /// Called from a non-task context.
        BadContext,
        /// The task does not exist.
        BadId,
        /// The task is not in the Init state.
        BadObjectState,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`Kernel::task_sleep`](crate::Kernel::task_sleep).
    pub enum SleepError: BadContextError {
        /// Called from a non-task context.
        BadContext,
    }
}

define_error! {
    mod exit_task_error {}
    /// Error type for [`Kernel::task_exit`](crate::Kernel::task_exit).
    pub enum ExitTaskError: BadContextError {
        /// Called from a non-task context.
        BadContext,
    }
}

define_error! {
    mod wake_task_error {}
    /// Error type for [`Isr::task_wake`](crate::Isr::task_wake).
    pub enum WakeTaskError: BadIdError, BadObjectStateError {
        /// The task does not exist.
        BadId,
        /// The task is not sleeping.
        BadObjectState,
    }
}

define_error! {
    mod get_task_error {}
    /// Error type for task queries.
    pub enum GetTaskError: BadContextError, BadIdError {
        /// Called from a non-task context.
        BadContext,
        /// The task does not exist.
        BadId,
    }
}

define_error! {
    mod set_task_priority_error {}
    /// Error type for [`Kernel::task_priority`](crate::Kernel::task_priority).
    pub enum SetTaskPriorityError: BadContextError, BadIdError {
        /// Called from a non-task context.
        BadContext,
        /// The task does not exist.
        BadId,
    }
}

define_error! {
    mod task_data_error {}
    /// Error type for [`Kernel::task_set_data`](crate::Kernel::task_set_data).
    pub enum TaskDataError: BadIdError {
        /// The task does not exist.
        BadId,
        /// All of the task's data slots are in use.
        OutOfMemory,
    }
}

define_error! {
    mod wait_error {}
    /// Error type for blocking operations such as
    /// [`Kernel::semaphore_take`](crate::Kernel::semaphore_take).
    pub enum WaitError: BadContextError {
        /// Called from a non-task context.
        BadContext,
        /// More wait objects were given than a task can wait on at once.
        BadParam,
        /// The operation timed out, or it would block and the timeout was
        /// [`NO_WAIT`](crate::NO_WAIT).
        Timeout,
    }
}

define_error! {
    mod poll_error {}
    /// Error type for non-blocking takes from an interrupt handler.
    pub enum PollError {
        /// The object was not ready.
        Timeout,
    }
}

define_error! {
    mod signal_error {}
    /// Error type for [`Kernel::semaphore_give`](crate::Kernel::semaphore_give).
    pub enum SignalError: BadContextError {
        /// Called from a non-task context.
        BadContext,
        /// The semaphore is already at its maximum count.
        QueueOverflow,
    }
}

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Kernel::mutex_lock`](crate::Kernel::mutex_lock).
    pub enum LockMutexError: BadContextError {
        /// Called from a non-task context.
        BadContext,
        /// The mutex stayed held by another task until the timeout expired.
        Timeout,
        /// The current task already holds
        /// [`MAX_HELD_MUTEXES`](crate::MAX_HELD_MUTEXES) mutexes.
        OutOfMemory,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Kernel::mutex_unlock`](crate::Kernel::mutex_unlock).
    pub enum UnlockMutexError: BadContextError {
        /// Called from a non-task context.
        BadContext,
    }
}

define_error! {
    mod create_timer_error {}
    /// Error type for [`Kernel::timer_create`](crate::Kernel::timer_create).
    pub enum CreateTimerError: BadIdError {
        /// The task driven by the timer does not exist.
        BadId,
        /// The timer arena is full.
        OutOfMemory,
    }
}

define_error! {
    mod timer_error {}
    /// Error type for timer operations.
    pub enum TimerError: BadIdError {
        /// The timer does not exist.
        BadId,
    }
}

/// Error type for queue pushes. The rejected value is handed back to the
/// caller.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PushError<T> {
    /// Called from a non-task context.
    BadContext(T),
    /// The queue stayed full until the timeout expired, or it was full and the
    /// timeout was [`NO_WAIT`](crate::NO_WAIT).
    Timeout(T),
}

impl<T> PushError<T> {
    /// Take back the value that could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            Self::BadContext(x) | Self::Timeout(x) => x,
        }
    }

    /// Get the result code of the error.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::BadContext(_) => ResultCode::BadContext,
            Self::Timeout(_) => ResultCode::Timeout,
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}(..)", self.code())
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.code(), f)
    }
}
