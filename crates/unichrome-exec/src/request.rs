//! The submission request surface.
//!
//! One call bundles the command bytes, the buffer validate list, a chain of
//! relocation pages, and optional clip rectangles. Everything here is plain
//! data; interpretation happens in the dispatcher after it has been copied
//! into context scratch.

use std::sync::Arc;

use bitflags::bitflags;
use unichrome_fence::Fence;
use unichrome_types::{FenceTypes, PlacementFlags};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ExecFlags: u32 {
        /// Replay the buffer once per clip rectangle.
        const HAS_CLIP = 1 << 0;
        /// The caller does not want a fence back.
        const NO_USER_FENCE = 1 << 1;
        /// Block on the registered ordering barriers named by the
        /// submission's fence-type mask before dispatching.
        const WAIT_BARRIER = 1 << 2;
        /// Emit the sequence but defer fence-object creation to a later
        /// call on the same engine.
        const DEFER_FENCE = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// `presumed_offset` reflects the client's belief about the
        /// buffer's GPU address; when it holds, relocations against this
        /// buffer are skipped.
        const USE_PRESUMED = 1 << 0;
    }
}

/// One buffer reference in the validate list.
#[derive(Clone, Copy, Debug)]
pub struct ValidateEntry {
    pub handle: u32,
    pub flags: EntryFlags,
    /// Placement bits to add for this submission.
    pub set_placement: PlacementFlags,
    /// Placement bits to drop for this submission.
    pub clear_placement: PlacementFlags,
    pub presumed_offset: u64,
}

impl ValidateEntry {
    pub fn new(handle: u32) -> ValidateEntry {
        ValidateEntry {
            handle,
            flags: EntryFlags::empty(),
            set_placement: PlacementFlags::empty(),
            clear_placement: PlacementFlags::empty(),
            presumed_offset: 0,
        }
    }
}

/// Per-buffer outcome reported back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidateReport {
    pub handle: u32,
    pub gpu_offset: u64,
    pub placement: PlacementFlags,
    /// The presumed offset was stale; the caller must adopt `gpu_offset`
    /// before presuming again.
    pub presumed_corrected: bool,
}

/// The fixed relocation kinds the dispatcher knows how to patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// 2D engine addressing: a 32-byte-aligned base field plus the
    /// sub-tile remainder folded into the pixel position.
    Blit2d { bpp: u32, pos: u32 },
    /// Depth-buffer base, 32-byte aligned.
    ZBuffer,
    /// Destination-surface base, 8-byte aligned.
    DstBuffer,
    /// Multi-mip texture base: per-mip low dwords plus one shared
    /// high-bits field.
    TexBaseHiLo { mips: u32 },
    /// Planar video source: per-plane bases derived from one buffer
    /// address with a common shift.
    YuvPlanar { planes: u32, shift: u32 },
}

/// One patch against the copied command buffer. `offset` is a dword index;
/// `delta` is added to the buffer's GPU address before packing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub buf_index: u32,
    pub offset: u32,
    pub delta: u64,
    pub kind: RelocKind,
}

/// Fixed-size page of relocation records, chained via `next`.
#[derive(Clone, Debug, Default)]
pub struct RelocPage {
    pub records: Vec<Relocation>,
    pub next: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClipRect {
    pub x1: u16,
    pub y1: u16,
    pub x2: u16,
    pub y2: u16,
}

impl ClipRect {
    /// The two dwords the per-rectangle rewrite plants in the stream.
    pub fn encode(self) -> [u32; 2] {
        [
            (u32::from(self.y1) << 16) | u32::from(self.x1),
            (u32::from(self.y2) << 16) | u32::from(self.x2),
        ]
    }
}

#[derive(Clone, Debug)]
pub struct ExecBufRequest {
    pub context: u32,
    pub buffers: Vec<ValidateEntry>,
    pub reloc_pages: Vec<RelocPage>,
    /// Index of the first relocation page, if any.
    pub first_reloc_page: Option<usize>,
    pub commands: Vec<u8>,
    pub clip_rects: Vec<ClipRect>,
    /// Dword index of the two clip dwords rewritten per rectangle.
    pub clip_offset: u32,
    /// Completion types the submission's fence should track.
    pub fence_types: FenceTypes,
    pub flags: ExecFlags,
}

impl ExecBufRequest {
    pub fn new(context: u32, commands: Vec<u8>) -> ExecBufRequest {
        ExecBufRequest {
            context,
            buffers: Vec::new(),
            reloc_pages: Vec::new(),
            first_reloc_page: None,
            commands,
            clip_rects: Vec::new(),
            clip_offset: 0,
            fence_types: FenceTypes::EXE,
            flags: ExecFlags::empty(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecBufReply {
    /// Sequence number of the (last) ring submission; zero on the
    /// register-port path, which carries no sequences.
    pub seq: u32,
    pub fence: Option<Arc<Fence>>,
    /// The fence-or-idle degradation fired: no fence exists, but the
    /// engine was synchronously drained before returning.
    pub engine_idled: bool,
    pub buffers: Vec<ValidateReport>,
}
