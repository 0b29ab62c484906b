use thiserror::Error;

pub type Result<T> = std::result::Result<T, HcdError>;

/// Synchronous submission-time failures.
///
/// Transfer-time failures (stall, babble, CRC, ...) never appear here; they are
/// normalized into [`crate::transfer::TransferStatus`] and delivered through the
/// completion handler. A submission that fails leaves no schedule state behind.
#[derive(Debug, Error)]
pub enum HcdError {
    #[error("descriptor pool exhausted")]
    PoolExhausted,

    #[error("periodic bandwidth unavailable: request needs {load} us, best phase already carries {worst} us of {budget} us")]
    NoBandwidth { load: u16, worst: u16, budget: u16 },

    #[error("invalid periodic interval {0}")]
    InvalidInterval(u16),

    #[error("isochronous submission with no packets")]
    InvalidPacketCount,

    #[error("controller is dead")]
    ControllerDead,

    #[error("controller did not leave reset")]
    ResetTimeout,
}
