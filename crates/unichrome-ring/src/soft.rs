//! Software model of the device, standing in for register access.
//!
//! [`SoftGpu`] implements both sides of the hardware seam: the ring's fetch
//! engine ([`RingHardware`]) and the fence poll source ([`FenceDriver`]).
//! The fetch model interprets the privileged command set for real: it walks
//! the ring dword by dword, follows jumps, retires fence writes into the
//! completed-sequence register, and stops at pause traps. That makes the
//! producer's pause/jump/hook choreography observable instead of mocked.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::error;
use unichrome_fence::{EngineError, EngineStatus, FenceDriver, FenceMachine};
use unichrome_mm::Pages;
use unichrome_types::{seq_passed, EngineId, FenceTypes};

use crate::blit::{BlitDevice, BlitEngine};
use crate::cmd;
use crate::ring::RingHardware;

/// Posted when the fetch model exhausts its step budget without reaching
/// the commanded pause, which means the ring content is corrupt.
pub const RUNAWAY_CODE: u32 = 0xFE;

struct Binding {
    pages: Arc<Pages>,
    base: u64,
    size: u32,
}

struct FetchState {
    binding: Option<Binding>,
    exec_pos: u32,
    pause_pos: u32,
    /// While held, resume requests are recorded but not executed.
    held: bool,
    pending_pause: Option<u32>,
}

pub struct SoftGpu {
    fetch: Mutex<FetchState>,
    drift: AtomicU32,
    cmd_completed: AtomicU32,
    cmd_error: Mutex<Option<u32>>,
    /// Progress of the video ordering classes, in command-sequence space.
    video_completed: [AtomicU32; FenceTypes::BARRIER_CLASSES.len()],
    blits: Mutex<[Option<Arc<BlitEngine>>; 4]>,
}

impl SoftGpu {
    pub fn new() -> Arc<SoftGpu> {
        Arc::new(SoftGpu {
            fetch: Mutex::new(FetchState {
                binding: None,
                exec_pos: 0,
                pause_pos: 0,
                held: false,
                pending_pause: None,
            }),
            drift: AtomicU32::new(0),
            cmd_completed: AtomicU32::new(0),
            cmd_error: Mutex::new(None),
            video_completed: Default::default(),
            blits: Mutex::new(Default::default()),
        })
    }

    pub fn attach_blit(&self, n: usize, engine: Arc<BlitEngine>) {
        if let Some(slot) = self.blits.lock().unwrap().get_mut(n) {
            *slot = Some(engine);
        }
    }

    /// Shift the reported reader position away from the calibrated value,
    /// as a marginal bus would.
    pub fn set_drift(&self, bytes: u32) {
        self.drift.store(bytes, Ordering::Relaxed);
    }

    /// Suspend or resume fetch execution. While held, resume requests
    /// accumulate; releasing runs to the last commanded pause.
    pub fn hold(&self, on: bool) {
        let mut fetch = self.fetch.lock().unwrap();
        fetch.held = on;
        if !on {
            if let Some(pause_at) = fetch.pending_pause.take() {
                self.run(&mut fetch, pause_at);
            }
        }
    }

    /// Record video-class progress in command-sequence space; drives the
    /// partial-signal path for fences that track an ordering class.
    pub fn post_video_progress(&self, slot: usize, seq: u32) {
        if let Some(counter) = self.video_completed.get(slot) {
            counter.store(seq, Ordering::Relaxed);
        }
    }

    fn run(&self, fetch: &mut FetchState, pause_at: u32) {
        let Some(binding) = fetch.binding.as_ref() else {
            return;
        };
        // Generous budget; anything longer means the producer wrote a loop.
        let mut budget = binding.size / cmd::DWORD * 4;
        while fetch.exec_pos != pause_at {
            if budget == 0 {
                error!(pos = fetch.exec_pos, pause_at, "fetch engine runaway");
                *self.cmd_error.lock().unwrap() = Some(RUNAWAY_CODE);
                break;
            }
            budget -= 1;
            let at = binding.base + u64::from(fetch.exec_pos);
            let dword = cmd::read_dword(&binding.pages, at);
            match cmd::header(dword) {
                cmd::HDR_JUMP => {
                    fetch.exec_pos = cmd::jump_target(dword) % binding.size;
                }
                cmd::HDR_FENCE => {
                    let seq = cmd::read_dword(&binding.pages, at + u64::from(cmd::DWORD));
                    self.cmd_completed.store(seq, Ordering::Release);
                    fetch.exec_pos = (fetch.exec_pos + 2 * cmd::DWORD) % binding.size;
                }
                cmd::HDR_PAUSE => {
                    // A trap the producer has not hooked yet; stay on it.
                    break;
                }
                _ => {
                    fetch.exec_pos = (fetch.exec_pos + cmd::DWORD) % binding.size;
                }
            }
        }
    }
}

impl RingHardware for SoftGpu {
    fn start(&self, pages: Arc<Pages>, base: u64, size: u32) {
        let mut fetch = self.fetch.lock().unwrap();
        fetch.binding = Some(Binding { pages, base, size });
        fetch.exec_pos = 0;
        fetch.pause_pos = 0;
        fetch.pending_pause = None;
    }

    fn reader_pos(&self) -> u32 {
        let fetch = self.fetch.lock().unwrap();
        let size = match fetch.binding.as_ref() {
            Some(binding) => binding.size,
            None => return 0,
        };
        (fetch.pause_pos + self.drift.load(Ordering::Relaxed)) % size
    }

    fn resume_to(&self, pause_at: u32) {
        let mut fetch = self.fetch.lock().unwrap();
        fetch.pause_pos = pause_at;
        if fetch.held {
            fetch.pending_pause = Some(pause_at);
            return;
        }
        self.run(&mut fetch, pause_at);
    }

    fn set_fetch(&self, target: u32) {
        self.fetch.lock().unwrap().exec_pos = target;
    }

    fn execute_immediate(&self, cmds: &[u8]) {
        // The register port feeds the engine synchronously; a verified user
        // stream carries no privileged dwords, so there is nothing to
        // retire here.
        let _ = cmds;
    }
}

impl FenceDriver for SoftGpu {
    fn poll(&self, engine: EngineId) -> EngineStatus {
        match engine {
            EngineId::Cmd => {
                let completed = self.cmd_completed.load(Ordering::Acquire);
                let mut signaled = FenceTypes::EXE;
                for (slot, class) in FenceTypes::BARRIER_CLASSES.iter().enumerate() {
                    let video = self.video_completed[slot].load(Ordering::Relaxed);
                    if seq_passed(video, completed) {
                        signaled |= *class;
                    }
                }
                EngineStatus {
                    completed,
                    signaled_types: signaled,
                    // A runaway wedges the whole engine, not one sequence.
                    error: self
                        .cmd_error
                        .lock()
                        .unwrap()
                        .map(|code| EngineError { code, seq: None }),
                }
            }
            EngineId::Blit0 | EngineId::Blit1 | EngineId::Blit2 | EngineId::Blit3 => {
                let n = engine.index() - EngineId::Blit0.index();
                let blit = self.blits.lock().unwrap()[n].clone();
                match blit {
                    Some(blit) => {
                        blit.pump();
                        blit.status()
                    }
                    None => EngineStatus {
                        completed: 0,
                        signaled_types: FenceTypes::EXE,
                        error: None,
                    },
                }
            }
            EngineId::Hqv0 | EngineId::Hqv1 | EngineId::Mpeg0 | EngineId::Mpeg1 => {
                let slot = engine.index() - EngineId::Hqv0.index();
                EngineStatus {
                    completed: self.video_completed[slot].load(Ordering::Relaxed),
                    signaled_types: FenceTypes::all(),
                    error: None,
                }
            }
        }
    }
}

/// Fully wired software device: fetch model, fence machine, and four blit
/// engines behind one mover.
pub struct SoftDevice {
    pub hw: Arc<SoftGpu>,
    pub fences: Arc<FenceMachine>,
    pub blitter: Arc<BlitDevice>,
}

impl SoftDevice {
    pub fn new(blit_abort_after: Duration) -> SoftDevice {
        let hw = SoftGpu::new();
        let fences = FenceMachine::new(hw.clone());
        let engines = [
            BlitEngine::new(EngineId::Blit0, blit_abort_after),
            BlitEngine::new(EngineId::Blit1, blit_abort_after),
            BlitEngine::new(EngineId::Blit2, blit_abort_after),
            BlitEngine::new(EngineId::Blit3, blit_abort_after),
        ];
        for (n, engine) in engines.iter().enumerate() {
            hw.attach_blit(n, engine.clone());
        }
        let blitter = BlitDevice::new(engines, fences.clone());
        SoftDevice {
            hw,
            fences,
            blitter,
        }
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        SoftDevice::new(Duration::from_secs(2))
    }
}
