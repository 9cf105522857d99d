//! Buffer-object and memory-placement management for UniChrome devices.
//!
//! The pieces, bottom up:
//! - [`lock::SubsystemLock`] — many short in-kernel readers vs. one exclusive
//!   writer (whole-subsystem teardown), with kill mode for client eviction;
//! - [`account::AccountingPool`] — global byte quota, checked before any
//!   backing store is touched;
//! - [`range_alloc::RangeAllocator`] — per-domain offset/size free list;
//! - [`manager::MemTypeManager`] — one per placement domain, owns the
//!   domain's allocator and eviction bookkeeping;
//! - [`bo::BufferObject`] — a GPU-addressable allocation with placement,
//!   reservation and a weak fence back-reference;
//! - [`registry::HandleRegistry`] — handle ↔ object map with per-client
//!   reference tracking;
//! - [`device::MemoryManager`] — ties it all together and implements the
//!   user-facing create/validate/set-status/sync-cpu operations.
#![forbid(unsafe_code)]

pub mod account;
pub mod bo;
pub mod device;
pub mod lock;
pub mod manager;
pub mod pages;
pub mod range_alloc;
pub mod registry;
pub mod stats;

pub use bo::{Backing, BufferObject};
pub use device::{BlitMover, BlitRequest, DeviceConfig, MemoryManager, PageSpan};
pub use lock::SubsystemLock;
pub use pages::Pages;
pub use registry::ClientId;
