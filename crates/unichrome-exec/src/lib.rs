//! Command-buffer submission: contexts, relocation patching, and the
//! dispatch pipeline tying the memory manager, fence machine, and ring
//! together behind one entry point.
#![forbid(unsafe_code)]

pub mod context;
pub mod dispatch;
pub mod reloc;
pub mod request;

pub use context::{ContextTable, ExecContext};
pub use dispatch::{Dispatcher, SubmitMode};
pub use request::{
    ClipRect, EntryFlags, ExecBufReply, ExecBufRequest, ExecFlags, RelocKind, RelocPage,
    Relocation, ValidateEntry, ValidateReport,
};
