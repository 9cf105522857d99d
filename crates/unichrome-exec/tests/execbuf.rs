//! Full-stack submission tests: memory manager, fence machine, ring, and
//! dispatcher wired over the software device model.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use unichrome_exec::{
    ClipRect, Dispatcher, EntryFlags, ExecBufRequest, ExecFlags, RelocKind, RelocPage, Relocation,
    SubmitMode, ValidateEntry,
};
use unichrome_fence::FenceMachine;
use unichrome_mm::{ClientId, DeviceConfig, MemoryManager, Pages};
use unichrome_ring::{CmdRing, RingConfig, SoftDevice, SoftGpu};
use unichrome_types::{Error, FenceTypes, PlacementFlags};

struct Harness {
    hw: Arc<SoftGpu>,
    fences: Arc<FenceMachine>,
    mm: Arc<MemoryManager>,
    ring_pages: Arc<Pages>,
    ring: Arc<CmdRing>,
    dispatcher: Arc<Dispatcher>,
    client: ClientId,
}

fn harness(mode: SubmitMode) -> Harness {
    let dev = SoftDevice::new(Duration::from_secs(2));
    let mm = MemoryManager::new(DeviceConfig::default(), dev.fences.clone());
    mm.set_blitter(dev.blitter.clone());
    let ring_pages = Pages::new(64 * 1024);
    let ring = CmdRing::new(
        RingConfig::default(),
        ring_pages.clone(),
        0,
        dev.hw.clone(),
        dev.fences.clone(),
    )
    .unwrap();
    ring.start();
    let dispatcher = Dispatcher::new(mm.clone(), ring.clone(), mode);
    let client = mm.open_client();
    Harness {
        hw: dev.hw,
        fences: dev.fences,
        mm,
        ring_pages,
        ring,
        dispatcher,
        client,
    }
}

fn zero_commands(dwords: usize) -> Vec<u8> {
    vec![0u8; dwords * 4]
}

fn ring_dword(h: &Harness, ring_offset: u32, index: u32) -> u32 {
    let mut buf = [0u8; 4];
    h.ring_pages
        .read(u64::from(ring_offset) + u64::from(index) * 4, &mut buf);
    u32::from_le_bytes(buf)
}

fn one_reloc(reloc: Relocation) -> (Vec<RelocPage>, Option<usize>) {
    (
        vec![RelocPage {
            records: vec![reloc],
            next: None,
        }],
        Some(0),
    )
}

#[test]
fn blit2d_relocation_packs_base_and_position_fields() {
    let h = harness(SubmitMode::Agp);
    // Filler pushes the target buffer to VRAM offset 0x1000.
    h.mm.create(h.client, 0x1000, PlacementFlags::VRAM, 0)
        .unwrap();
    let (target, offset) = h
        .mm
        .create(h.client, 0x1000, PlacementFlags::VRAM, 0)
        .unwrap();
    assert_eq!(offset, 0x1000);

    let ctx = h.dispatcher.create_context();
    let mut req = ExecBufRequest::new(ctx, zero_commands(4));
    let mut entry = ValidateEntry::new(target);
    entry.set_placement = PlacementFlags::VRAM;
    req.buffers.push(entry);
    (req.reloc_pages, req.first_reloc_page) = one_reloc(Relocation {
        buf_index: 0,
        offset: 0,
        delta: 0,
        kind: RelocKind::Blit2d { bpp: 32, pos: 100 },
    });

    let start = h.ring.write_offset();
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();

    assert_eq!(ring_dword(&h, start, 0), (0x1000 & !0x1f) >> 3);
    assert_eq!(ring_dword(&h, start, 1), 100 + ((0x1000 & 0x1f) >> 2));
    assert_eq!(reply.buffers[0].gpu_offset, 0x1000);

    let fence = reply.fence.unwrap();
    h.fences
        .wait(&fence, false, false, FenceTypes::EXE)
        .unwrap();
}

#[test]
fn matching_presumed_offset_skips_the_patch() {
    let h = harness(SubmitMode::Agp);
    let (handle, gpu_offset) = h
        .mm
        .create(h.client, 0x1000, PlacementFlags::VRAM, 0)
        .unwrap();
    let ctx = h.dispatcher.create_context();

    let sentinel = 0x0ABC_DEF0u32;
    let mut commands = Vec::new();
    for _ in 0..4 {
        commands.extend_from_slice(&sentinel.to_le_bytes());
    }
    let mut req = ExecBufRequest::new(ctx, commands);
    let mut entry = ValidateEntry::new(handle);
    entry.set_placement = PlacementFlags::VRAM;
    entry.flags = EntryFlags::USE_PRESUMED;
    entry.presumed_offset = gpu_offset;
    req.buffers.push(entry);
    (req.reloc_pages, req.first_reloc_page) = one_reloc(Relocation {
        buf_index: 0,
        offset: 0,
        delta: 0,
        kind: RelocKind::DstBuffer,
    });

    let start = h.ring.write_offset();
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();
    assert!(!reply.buffers[0].presumed_corrected);
    // The sentinel went out unpatched.
    assert_eq!(ring_dword(&h, start, 0), sentinel);
}

#[test]
fn stale_presumed_offset_is_corrected_and_patched() {
    let h = harness(SubmitMode::Agp);
    let (handle, gpu_offset) = h
        .mm
        .create(h.client, 0x1000, PlacementFlags::VRAM, 0)
        .unwrap();
    let ctx = h.dispatcher.create_context();

    let sentinel = 0x0ABC_DEF0u32;
    let mut commands = Vec::new();
    for _ in 0..4 {
        commands.extend_from_slice(&sentinel.to_le_bytes());
    }
    let mut req = ExecBufRequest::new(ctx, commands);
    let mut entry = ValidateEntry::new(handle);
    entry.set_placement = PlacementFlags::VRAM;
    entry.flags = EntryFlags::USE_PRESUMED;
    entry.presumed_offset = gpu_offset + 0x8000;
    req.buffers.push(entry);
    (req.reloc_pages, req.first_reloc_page) = one_reloc(Relocation {
        buf_index: 0,
        offset: 0,
        delta: 0,
        kind: RelocKind::DstBuffer,
    });

    let start = h.ring.write_offset();
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();
    // Copy-back: the caller learns the real offset and the patch ran.
    assert!(reply.buffers[0].presumed_corrected);
    assert_eq!(reply.buffers[0].gpu_offset, gpu_offset);
    assert_eq!(
        ring_dword(&h, start, 0),
        u32::try_from(gpu_offset >> 3).unwrap()
    );
}

#[test]
fn system_residency_short_circuits_the_presumed_check() {
    let h = harness(SubmitMode::Agp);
    let (handle, _) = h
        .mm
        .create(h.client, 0x1000, PlacementFlags::SYSTEM, 0)
        .unwrap();
    let ctx = h.dispatcher.create_context();

    let sentinel = 0x0ABC_DEF0u32;
    let mut commands = Vec::new();
    for _ in 0..4 {
        commands.extend_from_slice(&sentinel.to_le_bytes());
    }
    let mut req = ExecBufRequest::new(ctx, commands);
    let mut entry = ValidateEntry::new(handle);
    entry.set_placement = PlacementFlags::SYSTEM;
    entry.flags = EntryFlags::USE_PRESUMED;
    // Wildly wrong, but system buffers are treated as presumed-ok
    // without an offset comparison.
    entry.presumed_offset = 0xDEAD_0000;
    req.buffers.push(entry);
    (req.reloc_pages, req.first_reloc_page) = one_reloc(Relocation {
        buf_index: 0,
        offset: 0,
        delta: 0,
        kind: RelocKind::DstBuffer,
    });

    let start = h.ring.write_offset();
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();
    assert!(!reply.buffers[0].presumed_corrected);
    assert_eq!(ring_dword(&h, start, 0), sentinel);
}

#[test]
fn disjoint_submissions_run_concurrently() {
    let h = harness(SubmitMode::Agp);
    let h = Arc::new(h);
    let mut handles = Vec::new();
    for _ in 0..2 {
        let (buf, _) = h
            .mm
            .create(h.client, 0x1000, PlacementFlags::VRAM, 0)
            .unwrap();
        let ctx = h.dispatcher.create_context();
        let h = h.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..16 {
                let mut req = ExecBufRequest::new(ctx, zero_commands(4));
                let mut entry = ValidateEntry::new(buf);
                entry.set_placement = PlacementFlags::VRAM;
                req.buffers.push(entry);
                h.dispatcher.execbuf(h.client, &req).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    h.ring.wait_idle();
}

#[test]
fn concurrent_calls_on_one_context_are_rejected() {
    let h = harness(SubmitMode::Agp);
    let ctx = h.dispatcher.create_context();

    // First call in flight, modeled by holding the context claim.
    let claim = h.dispatcher.contexts().begin(ctx).unwrap();
    let req = ExecBufRequest::new(ctx, zero_commands(4));
    assert_eq!(
        h.dispatcher.execbuf(h.client, &req).unwrap_err(),
        Error::ProtocolViolation {
            what: "concurrent execbuf on one context"
        }
    );

    // The first call proceeds unaffected and the context recovers.
    h.dispatcher.contexts().end(&claim);
    h.dispatcher.execbuf(h.client, &req).unwrap();
}

#[test]
fn fence_creation_failure_degrades_to_synchronous_idle() {
    let h = harness(SubmitMode::Agp);
    let ctx = h.dispatcher.create_context();
    h.fences.force_create_failures(1);

    let req = ExecBufRequest::new(ctx, zero_commands(4));
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();
    assert!(reply.fence.is_none());
    assert!(reply.engine_idled);

    // The degradation is one-shot; the next call gets a fence again.
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();
    assert!(reply.fence.is_some());
}

#[test]
fn clip_replay_resubmits_per_rectangle() {
    let h = harness(SubmitMode::Agp);
    let ctx = h.dispatcher.create_context();

    let mut req = ExecBufRequest::new(ctx, zero_commands(4));
    req.flags = ExecFlags::HAS_CLIP;
    req.clip_offset = 0;
    req.clip_rects = vec![
        ClipRect {
            x1: 0,
            y1: 0,
            x2: 64,
            y2: 64,
        },
        ClipRect {
            x1: 64,
            y1: 0,
            x2: 128,
            y2: 32,
        },
    ];

    let start = h.ring.write_offset();
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();
    // Two ring submissions went out; each carries its own rectangle.
    assert_eq!(reply.seq, 2);
    let [tl1, br1] = req.clip_rects[0].encode();
    let [tl2, br2] = req.clip_rects[1].encode();
    assert_eq!(ring_dword(&h, start, 0), tl1);
    assert_eq!(ring_dword(&h, start, 1), br1);
    let second = start + RingConfig::default().min_submit;
    assert_eq!(ring_dword(&h, second, 0), tl2);
    assert_eq!(ring_dword(&h, second, 1), br2);
}

#[test]
fn register_port_path_verifies_and_idles() {
    let h = harness(SubmitMode::Pci);
    let ctx = h.dispatcher.create_context();

    let reply = h
        .dispatcher
        .execbuf(h.client, &ExecBufRequest::new(ctx, zero_commands(4)))
        .unwrap();
    assert_eq!(reply.seq, 0);
    assert!(reply.fence.is_none());
    assert!(reply.engine_idled);

    // A privileged dword in the stream never reaches the engine.
    let mut commands = zero_commands(3);
    commands.extend_from_slice(&0xC100_0000u32.to_le_bytes());
    assert_eq!(
        h.dispatcher
            .execbuf(h.client, &ExecBufRequest::new(ctx, commands))
            .unwrap_err(),
        Error::ProtocolViolation {
            what: "privileged command in user stream"
        }
    );
}

#[test]
fn out_of_range_relocation_index_unwinds_cleanly() {
    let h = harness(SubmitMode::Agp);
    let (handle, _) = h
        .mm
        .create(h.client, 0x1000, PlacementFlags::VRAM, 0)
        .unwrap();
    let ctx = h.dispatcher.create_context();

    let mut req = ExecBufRequest::new(ctx, zero_commands(4));
    let mut entry = ValidateEntry::new(handle);
    entry.set_placement = PlacementFlags::VRAM;
    req.buffers.push(entry);
    (req.reloc_pages, req.first_reloc_page) = one_reloc(Relocation {
        buf_index: 7,
        offset: 0,
        delta: 0,
        kind: RelocKind::ZBuffer,
    });

    assert_eq!(
        h.dispatcher.execbuf(h.client, &req).unwrap_err(),
        Error::ProtocolViolation {
            what: "relocation index outside the validated set"
        }
    );

    // Nothing stayed reserved and the context is reusable.
    assert!(h.mm.lookup(h.client, handle).unwrap().reserved_ticket().is_none());
    req.first_reloc_page = None;
    h.dispatcher.execbuf(h.client, &req).unwrap();
}

#[test]
fn submitted_buffers_are_guarded_by_the_submission_fence() {
    let h = harness(SubmitMode::Agp);
    let (handle, _) = h
        .mm
        .create(h.client, 0x1000, PlacementFlags::VRAM, 0)
        .unwrap();
    let ctx = h.dispatcher.create_context();

    // Stall the fetch engine so the submission stays outstanding.
    h.hw.hold(true);
    let mut req = ExecBufRequest::new(ctx, zero_commands(4));
    let mut entry = ValidateEntry::new(handle);
    entry.set_placement = PlacementFlags::VRAM;
    req.buffers.push(entry);
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();

    // The buffer is guarded by the submission's unsignaled fence; anything
    // that would recycle its memory has to wait on it.
    let bo = h.mm.lookup(h.client, handle).unwrap();
    let (guard, types) = bo.sync_fence().expect("buffer left unguarded");
    assert_eq!(guard.sequence(), reply.seq);
    assert!(types.contains(FenceTypes::EXE));
    assert!(!guard.signaled(FenceTypes::EXE));

    h.hw.hold(false);
    h.fences
        .wait(&guard, false, false, FenceTypes::EXE)
        .unwrap();
}

#[test]
fn validation_failure_names_the_offending_buffer() {
    let h = harness(SubmitMode::Agp);
    let (ok, _) = h
        .mm
        .create(h.client, 0x1000, PlacementFlags::VRAM, 0)
        .unwrap();
    // Larger than the whole private pool, so it can never be placed there.
    let (huge, _) = h
        .mm
        .create(h.client, 0x20_0000, PlacementFlags::SYSTEM, 0)
        .unwrap();
    let ctx = h.dispatcher.create_context();

    let mut req = ExecBufRequest::new(ctx, zero_commands(4));
    let mut entry = ValidateEntry::new(ok);
    entry.set_placement = PlacementFlags::VRAM;
    req.buffers.push(entry);
    let mut entry = ValidateEntry::new(huge);
    entry.set_placement = PlacementFlags::PRIV0;
    entry.clear_placement = PlacementFlags::SYSTEM;
    req.buffers.push(entry);

    assert_eq!(
        h.dispatcher.execbuf(h.client, &req).unwrap_err(),
        Error::BufferValidation {
            index: 1,
            source: Box::new(Error::OutOfMemory {
                requested: 0x20_0000
            }),
        }
    );
    // Reservations unwound; the list is submittable once repaired.
    assert!(h.mm.lookup(h.client, huge).unwrap().reserved_ticket().is_none());
    req.buffers.pop();
    h.dispatcher.execbuf(h.client, &req).unwrap();
}

#[test]
fn barrier_wait_orders_against_the_video_class() {
    let h = harness(SubmitMode::Agp);
    let ctx = h.dispatcher.create_context();

    // First submission registers the HQV0 barrier.
    let mut req = ExecBufRequest::new(ctx, zero_commands(4));
    req.fence_types = FenceTypes::EXE | FenceTypes::HQV0;
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();
    let barrier_seq = reply.seq;

    // The video unit catches up, so the barrier can fully signal.
    h.hw.post_video_progress(0, barrier_seq);

    let mut req = ExecBufRequest::new(ctx, zero_commands(4));
    req.fence_types = FenceTypes::EXE | FenceTypes::HQV0;
    req.flags = ExecFlags::WAIT_BARRIER;
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();
    assert!(reply.fence.is_some());
}

#[test]
fn validation_migrates_deferred_buffers_for_submission() {
    let h = harness(SubmitMode::Agp);
    // SYSTEM creation defers placement entirely.
    let (handle, offset) = h
        .mm
        .create(h.client, 0x2000, PlacementFlags::SYSTEM, 0)
        .unwrap();
    assert_eq!(offset, 0);
    let ctx = h.dispatcher.create_context();

    let mut req = ExecBufRequest::new(ctx, zero_commands(4));
    let mut entry = ValidateEntry::new(handle);
    entry.set_placement = PlacementFlags::VRAM;
    entry.clear_placement = PlacementFlags::SYSTEM;
    req.buffers.push(entry);
    let reply = h.dispatcher.execbuf(h.client, &req).unwrap();

    assert!(reply.buffers[0]
        .placement
        .contains(PlacementFlags::VRAM));
    assert_eq!(
        h.mm.lookup(h.client, handle).unwrap().current_domain(),
        unichrome_types::MemDomain::Vram
    );
}

#[test]
fn unknown_context_id_is_not_found() {
    let h = harness(SubmitMode::Agp);
    assert_eq!(
        h.dispatcher
            .execbuf(h.client, &ExecBufRequest::new(999, zero_commands(4)))
            .unwrap_err(),
        Error::NotFound { handle: 999 }
    );
}
