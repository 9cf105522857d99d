//! The submission dispatcher.
//!
//! One call walks the full pipeline: claim the context, take the subsystem
//! read lock, resolve and reserve the buffer list under one ordering
//! ticket, validate each buffer into its agreed placement, copy commands
//! and relocation records into context scratch, patch addresses, honor
//! barrier waits, dispatch (once per clip rectangle if asked), and hand
//! back a fence or a synchronously-idled engine. Resources unwind in
//! reverse acquisition order on every path: submit mutex, reservations,
//! read lock, context claim.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use unichrome_fence::FenceMachine;
use unichrome_mm::{BufferObject, ClientId, MemoryManager};
use unichrome_types::{EngineId, Error, FenceTypes, MemDomain};
use unichrome_ring::CmdRing;

use crate::context::{ContextTable, ExecContext};
use crate::reloc;
use crate::request::{ExecBufReply, ExecBufRequest, ExecFlags, Relocation, ValidateReport};
use crate::request::EntryFlags;

/// How command bytes reach the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitMode {
    /// DMA ring; streams are trusted and tracked by sequence.
    Agp,
    /// Register port; every stream is re-verified, execution is
    /// synchronous and carries no sequence.
    Pci,
}

pub struct Dispatcher {
    mm: Arc<MemoryManager>,
    ring: Arc<CmdRing>,
    contexts: ContextTable,
    mode: SubmitMode,
    /// At most one submission touches the engine at a time.
    submit: Mutex<()>,
}

impl Dispatcher {
    pub fn new(mm: Arc<MemoryManager>, ring: Arc<CmdRing>, mode: SubmitMode) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            mm,
            ring,
            contexts: ContextTable::new(),
            mode,
            submit: Mutex::new(()),
        })
    }

    pub fn mm(&self) -> &Arc<MemoryManager> {
        &self.mm
    }

    pub fn ring(&self) -> &Arc<CmdRing> {
        &self.ring
    }

    pub fn mode(&self) -> SubmitMode {
        self.mode
    }

    pub fn contexts(&self) -> &ContextTable {
        &self.contexts
    }

    pub fn create_context(&self) -> u32 {
        self.contexts.create()
    }

    pub fn destroy_context(&self, id: u32) -> Result<(), Error> {
        self.contexts.destroy(id)
    }

    pub fn execbuf(&self, client: ClientId, req: &ExecBufRequest) -> Result<ExecBufReply, Error> {
        if req.commands.is_empty() || req.commands.len() % 4 != 0 {
            return Err(Error::InvalidArgument {
                what: "command buffer not dword-granular",
            });
        }
        if req.flags.contains(ExecFlags::HAS_CLIP) && req.clip_rects.is_empty() {
            return Err(Error::InvalidArgument {
                what: "clip replay without rectangles",
            });
        }
        let context = self.contexts.begin(req.context)?;
        let result = self.with_context(client, req, &context);
        self.contexts.end(&context);
        if let Err(err) = &result {
            debug!(context = req.context, %err, "execbuf failed");
        }
        result
    }

    fn with_context(
        &self,
        client: ClientId,
        req: &ExecBufRequest,
        context: &Arc<ExecContext>,
    ) -> Result<ExecBufReply, Error> {
        let _read = self.mm.subsystem_lock().read_lock(true)?;

        let mut bos = Vec::with_capacity(req.buffers.len());
        for entry in &req.buffers {
            bos.push(self.mm.lookup(client, entry.handle)?);
        }
        self.mm.reserve_all(&bos)?;
        let result = self.with_reservations(req, context, &bos);
        self.mm.unreserve_all(&bos);
        result
    }

    fn with_reservations(
        &self,
        req: &ExecBufRequest,
        context: &Arc<ExecContext>,
        bos: &[Arc<BufferObject>],
    ) -> Result<ExecBufReply, Error> {
        let mut reports = Vec::with_capacity(bos.len());
        let mut offsets = Vec::with_capacity(bos.len());
        let mut needs_patch = Vec::with_capacity(bos.len());
        for (index, (entry, bo)) in req.buffers.iter().zip(bos).enumerate() {
            let target =
                (bo.proposed() & !entry.clear_placement) | entry.set_placement;
            let (gpu_offset, placement) = self
                .mm
                .validate_reserved(bo, target, true, false)
                .map_err(|source| Error::BufferValidation {
                    index: index as u32,
                    source: Box::new(source),
                })?;
            // System residency counts as "presumption holds" without an
            // offset comparison; system relocations are not
            // distance-sensitive in this pipeline.
            let in_system = bo.current_domain() == MemDomain::System;
            let presumed = entry.flags.contains(EntryFlags::USE_PRESUMED);
            let presumed_holds = presumed && (in_system || entry.presumed_offset == gpu_offset);
            needs_patch.push(!presumed_holds);
            reports.push(ValidateReport {
                handle: entry.handle,
                gpu_offset,
                placement,
                presumed_corrected: presumed && !in_system && entry.presumed_offset != gpu_offset,
            });
            offsets.push(gpu_offset);
        }

        let mut scratch = context.scratch.lock().unwrap();
        collect_relocations(req, &mut scratch.relocs)?;
        for r in &scratch.relocs {
            if r.buf_index as usize >= bos.len() {
                return Err(Error::ProtocolViolation {
                    what: "relocation index outside the validated set",
                });
            }
        }

        let _submit = self.submit.lock().unwrap();

        scratch.commands.clear();
        scratch.commands.extend_from_slice(&req.commands);
        apply_relocations(&mut scratch, &offsets, &needs_patch)?;

        if req.flags.contains(ExecFlags::WAIT_BARRIER) {
            self.wait_barriers(req.fence_types)?;
        }

        let seq = self.dispatch(req, &mut scratch, &offsets, &needs_patch)?;

        // Scratch contents are dead once dispatched; capacity stays with
        // the context.
        scratch.relocs.clear();
        scratch.commands.clear();
        drop(scratch);

        let mut fence = None;
        let mut engine_idled = false;
        let want_user_fence = !req
            .flags
            .intersects(ExecFlags::NO_USER_FENCE | ExecFlags::DEFER_FENCE);
        match self.mode {
            SubmitMode::Agp => {
                match self
                    .ring
                    .fence_for(seq, req.fence_types | FenceTypes::EXE)
                {
                    Ok(created) => {
                        // Every buffer this submission touched stays guarded
                        // by its fence until the engine passes the sequence.
                        for bo in bos {
                            bo.set_sync_fence(&created, req.fence_types | FenceTypes::EXE);
                        }
                        if want_user_fence {
                            fence = Some(created);
                        }
                    }
                    Err(err) => {
                        // Documented degradation: no fence object could
                        // be built, so drain the engine instead.
                        warn!(%err, "fence creation failed, idling the engine");
                        self.mm.fences().wait_engine_idle(EngineId::Cmd, true)?;
                        engine_idled = true;
                    }
                }
            }
            SubmitMode::Pci => {
                // Register-port execution carries no sequence to fence.
                if want_user_fence {
                    self.mm.fences().wait_engine_idle(EngineId::Cmd, true)?;
                    engine_idled = true;
                }
            }
        }

        Ok(ExecBufReply {
            seq,
            fence,
            engine_idled,
            buffers: reports,
        })
    }

    fn wait_barriers(&self, mask: FenceTypes) -> Result<(), Error> {
        let fences: &Arc<FenceMachine> = self.mm.fences();
        for (slot, class) in FenceTypes::BARRIER_CLASSES.iter().enumerate() {
            if !mask.contains(*class) {
                continue;
            }
            if let Some(barrier) = fences.barrier(slot) {
                fences.wait(&barrier, false, true, *class)?;
            }
        }
        Ok(())
    }

    /// Push the scratch buffer at the engine, once per clip rectangle when
    /// replay is requested. On the register-port path the whole buffer is
    /// rebuilt from the request between rectangles so the verifier sees
    /// each pass in full.
    fn dispatch(
        &self,
        req: &ExecBufRequest,
        scratch: &mut crate::context::Scratch,
        offsets: &[u64],
        needs_patch: &[bool],
    ) -> Result<u32, Error> {
        if !req.flags.contains(ExecFlags::HAS_CLIP) {
            return self.dispatch_once(&scratch.commands);
        }
        let mut seq = 0;
        for (i, rect) in req.clip_rects.iter().enumerate() {
            if i > 0 && self.mode == SubmitMode::Pci {
                scratch.commands.clear();
                scratch.commands.extend_from_slice(&req.commands);
                apply_relocations(scratch, offsets, needs_patch)?;
            }
            reloc::patch_clip(&mut scratch.commands, req.clip_offset, *rect)?;
            seq = self.dispatch_once(&scratch.commands)?;
        }
        Ok(seq)
    }

    fn dispatch_once(&self, cmds: &[u8]) -> Result<u32, Error> {
        match self.mode {
            SubmitMode::Agp => self.ring.submit(cmds, false),
            SubmitMode::Pci => {
                self.ring.submit_system(cmds)?;
                Ok(0)
            }
        }
    }
}

fn apply_relocations(
    scratch: &mut crate::context::Scratch,
    offsets: &[u64],
    needs_patch: &[bool],
) -> Result<(), Error> {
    let (relocs, commands) = (&scratch.relocs, &mut scratch.commands);
    for r in relocs {
        let idx = r.buf_index as usize;
        if needs_patch[idx] {
            reloc::apply(commands, r, offsets[idx])?;
        }
    }
    Ok(())
}

/// Copy the relocation-page chain into scratch, following `next` links.
/// The chain is bounded by the page count, so a cycle cannot spin forever.
fn collect_relocations(req: &ExecBufRequest, out: &mut Vec<Relocation>) -> Result<(), Error> {
    out.clear();
    let mut next = req.first_reloc_page;
    let mut visited = 0usize;
    while let Some(index) = next {
        let page = req
            .reloc_pages
            .get(index)
            .ok_or(Error::InvalidArgument {
                what: "relocation page link out of range",
            })?;
        visited += 1;
        if visited > req.reloc_pages.len() {
            return Err(Error::ProtocolViolation {
                what: "relocation page chain loops",
            });
        }
        out.extend_from_slice(&page.records);
        next = page.next;
    }
    Ok(())
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.mode)
            .field("contexts", &self.contexts.len())
            .finish()
    }
}
