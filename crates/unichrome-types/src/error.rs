//! Error taxonomy shared across the subsystem.
//!
//! Low-level components (lock, fence, ring) return these directly; the
//! execbuf dispatcher propagates them unchanged and is responsible only for
//! unwinding its own state, never for reclassifying.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Malformed request shape, out-of-range value, bad flag combination.
    #[error("invalid argument: {what}")]
    InvalidArgument { what: &'static str },

    /// A handle does not resolve to a live object.
    #[error("no object for handle {handle:#x}")]
    NotFound { handle: u32 },

    /// Backing-store allocation failure or accounting-quota rejection.
    #[error("out of memory ({requested} bytes requested)")]
    OutOfMemory { requested: u64 },

    /// The operation would need to block but the caller asked not to.
    #[error("resource busy")]
    Busy,

    /// A blocking wait was interrupted, or the subsystem is in kill mode.
    /// The caller is expected to retry the whole operation from scratch.
    #[error("interrupted (signal {signal:?})")]
    Interrupted { signal: Option<i32> },

    /// The GPU posted an error on a fence. Frozen into that fence; surfaced
    /// to every current and future waiter.
    #[error("hardware error {code:#x}")]
    HardwareError { code: u32 },

    /// A client broke a usage contract (concurrent execbuf on one context,
    /// relocation index outside the validated set, ...). Always hard.
    #[error("protocol violation: {what}")]
    ProtocolViolation { what: &'static str },

    /// One entry of a submission's validate list could not be placed.
    /// `index` names the offending entry so the client can report or drop
    /// the right buffer; entries before it validated, entries after it were
    /// not attempted.
    #[error("buffer {index} failed validation: {source}")]
    BufferValidation {
        index: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn interrupted() -> Self {
        Error::Interrupted { signal: None }
    }

    /// True for the errors a caller may resolve by retrying the whole
    /// operation once the transient condition clears.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::Interrupted { .. })
    }
}
