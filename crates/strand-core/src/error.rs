//! Error types for the strand runtime

use core::fmt;

/// Result type for runtime operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors reported by the scheduler, I/O manager, and fiber layer.
///
/// Syscall-surface errors never appear here: hooked POSIX calls keep the
/// `-1`/`errno` contract of the functions they replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Fiber stack allocation failed.
    StackAllocation,

    /// The fiber is not in a state that permits the operation.
    InvalidFiberState,

    /// The event is already registered on this file descriptor.
    EventExists,

    /// A syscall failed; carries the errno value.
    Platform(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::StackAllocation => write!(f, "fiber stack allocation failed"),
            SchedError::InvalidFiberState => write!(f, "invalid fiber state for operation"),
            SchedError::EventExists => write!(f, "event already registered for fd"),
            SchedError::Platform(errno) => write!(f, "platform error: errno {}", errno),
        }
    }
}

impl std::error::Error for SchedError {}
