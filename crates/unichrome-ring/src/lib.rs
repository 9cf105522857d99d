//! Command submission for the UniChrome engine.
//!
//! Three pieces live here: the circular DMA ring with pause/jump flow
//! control and sequence trackers, the register-port verifier used when no
//! ring exists, and the scatter-gather blit engines the memory manager
//! drives for aperture↔system migration. A software device model backs all
//! of it for hosted testing.
#![forbid(unsafe_code)]

pub mod blit;
pub mod cmd;
pub mod ring;
pub mod soft;

pub use blit::{BlitDevice, BlitEngine, ABORT_CODE, BLIT_PAGE};
pub use ring::{CmdRing, RingConfig, RingHardware};
pub use soft::{SoftDevice, SoftGpu};
