use crate::state::IomgrState;

use std::io;

/// Errors reported by the I/O manager.
///
/// Capacity and configuration errors are surfaced to the caller that
/// caused them. Delivery failures are not errors: `send_msg` and `run_on`
/// report them through their return values.
#[derive(Debug, thiserror::Error)]
pub enum IomgrError {
    /// Every reactor slot is taken.
    #[error("io thread capacity exhausted (max {max} reactors)")]
    ThreadCapacity { max: usize },

    /// Every message module id is taken.
    #[error("message module capacity exhausted (max {max} modules)")]
    ModuleCapacity { max: usize },

    /// The operation is not allowed in the current lifecycle state.
    #[error("io manager is {actual}, expected {expected}")]
    InvalidState {
        expected: IomgrState,
        actual: IomgrState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The calling thread does not run a reactor.
    #[error("calling thread is not an io reactor")]
    NotAReactor,

    #[error("calling thread already runs an io reactor")]
    AlreadyAReactor,

    /// A worker reactor died before it finished starting.
    #[error("worker reactor failed during startup")]
    WorkerStartup,

    #[error("failed to spawn reactor thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("reactor backend failure: {0}")]
    Poller(#[source] io::Error),

    #[error("aligned allocation of {size} bytes (align {align}) failed")]
    Alloc { size: usize, align: usize },

    #[error("device error: {0}")]
    Device(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, IomgrError>;
