//! Fence tracking for the UniChrome engines.
//!
//! A [`Fence`] represents "engine E has completed work up to sequence N" for
//! a requested set of completion-type bits. Fences are signaled only by the
//! poll path, which is driven from three places collapsed into one
//! [`poller::FencePoller`] task: a hardware-event callback, a periodic tick,
//! and explicit flushes from waiters.
#![forbid(unsafe_code)]

mod fence;
pub mod poller;

pub use fence::{EngineError, EngineStatus, Fence, FenceDriver, FenceMachine};
pub use poller::FencePoller;
