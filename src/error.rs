//! Crate-level error type.
//!
//! The emulation distinguishes recoverable faults (an undocumented opcode
//! is logged and skipped, a timer underflow simply wraps) from fatal ones
//! (a snapshot marker mismatch, an illegal IEC re-entry).  Only the fatal
//! kinds surface through `Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Serialization marker mismatch or an IEC state machine re-entered in
    /// an illegal state.  The machine stops.
    #[error("bus consistency error: {0}")]
    BusConsistency(String),

    /// A disk image could not be mounted or a GCR sector failed to decode
    /// on write-back.  The drive detaches the image.
    #[error("disk image error: {0}")]
    Image(String),

    /// A drive channel was opened on a resource with no backing store.
    /// Reported on the command channel; hosts usually never see this.
    #[error("resource not available: {0}")]
    ResourceNotAvailable(String),

    /// Snapshot version or environment mismatch (e.g. the SID sample rate
    /// differs at restore time).  The snapshot is refused.
    #[error("snapshot error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
