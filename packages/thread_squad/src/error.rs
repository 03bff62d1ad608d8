use thiserror::Error;

/// Errors that can occur when building or operating a thread squad.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The squad parameters are contradictory or out of range.
    #[error("invalid thread squad configuration: {problem}")]
    InvalidConfiguration {
        /// Description of the specific problem with the configuration.
        problem: String,
    },

    /// Pinning to hardware threads was requested but the target hardware
    /// thread cannot be resolved on this system, either because affinity is
    /// not supported by the operating system or because no hardware thread
    /// with the mapped id exists.
    #[error("cannot pin to hardware thread {hardware_thread}: not supported on this system")]
    PinningUnsupported {
        /// The hardware thread id that could not be resolved.
        hardware_thread: usize,
    },

    /// The operating system refused to create a worker thread.
    #[error("failed to spawn worker thread")]
    Spawn {
        /// The underlying operating system error.
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, crate::Error>;
