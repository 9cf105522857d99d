//! The circular command ring feeding the main engine.
//!
//! The producer keeps two absolute byte counters: `low`, everything ever
//! written, and `free`, everything the fetch engine is known to have passed.
//! The dword at ring offset `low % size` always holds the live pause trap;
//! each submission overwrites it with its first command and plants a fresh
//! trap at its own end, so the fetch engine can never run off into stale
//! bytes. Retirement is tracker-driven: every submission records the
//! sequence number it emitted, and space is reclaimed when the fence class
//! reports that sequence passed.
//!
//! When the contiguous tail is too small for a submission the ring rewinds:
//! the old pause trap becomes a jump to offset zero, where filler and a new
//! trap have already been written. Before hooking the trap the producer
//! cross-checks the position hardware reports against the drift calibrated
//! at start; on disagreement it falls back to the slow register path.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};
use unichrome_fence::{Fence, FenceMachine};
use unichrome_mm::Pages;
use unichrome_types::{seq_passed, EngineId, Error, FenceTypes};

use crate::cmd;

/// Inline fence write: header plus sequence dword.
const FENCE_BYTES: u32 = 2 * cmd::DWORD;
const PAUSE_BYTES: u32 = cmd::DWORD;
/// Filler dwords written at the ring head by a rewind, ahead of the trap.
const REWIND_FILLERS: u32 = 2;
const REWIND_HEAD: u32 = REWIND_FILLERS * cmd::DWORD + PAUSE_BYTES;

#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    /// Ring size in bytes; must be a power of two.
    pub size: u32,
    /// Submissions smaller than this are padded with fillers, keeping the
    /// fetch engine from starving on tiny bursts.
    pub min_submit: u32,
    /// Acceptable disagreement, in bytes, between the calibrated reader
    /// position and the one hardware reports at a rewind.
    pub drift_tolerance: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            size: 64 * 1024,
            min_submit: 64,
            drift_tolerance: 32,
        }
    }
}

/// Register-level access to the fetch engine.
pub trait RingHardware: Send + Sync {
    /// Bind the fetch engine to the ring storage, positioned at offset zero.
    fn start(&self, pages: Arc<Pages>, base: u64, size: u32);

    /// Ring-relative byte offset the fetch engine reports for its position.
    /// Reports lag the true pause point by a device-specific drift.
    fn reader_pos(&self) -> u32;

    /// Run from the current position up to the pause trap at `pause_at`.
    fn resume_to(&self, pause_at: u32);

    /// Force the fetch position through registers. Slow, but independent of
    /// the in-ring pause hook.
    fn set_fetch(&self, target: u32);

    /// Feed a verified stream through the register port, bypassing the ring.
    fn execute_immediate(&self, cmds: &[u8]);
}

struct Tracker {
    /// Absolute producer position at the end of the tracked submission.
    end: u64,
    seq: u32,
}

/// Outcome of asking for `total` contiguous bytes at the producer cursor.
enum Claim {
    /// Space granted at this ring offset.
    At(u32),
    /// The contiguous tail is too small but the head is free enough to
    /// wrap into.
    NeedsRewind,
    /// Nothing to do but wait for trackers to retire.
    NeedsSpace,
}

struct RingState {
    started: bool,
    /// Absolute bytes produced; `low % size` is the live pause trap.
    low: u64,
    /// Absolute bytes retired through trackers.
    free: u64,
    /// Calibrated reader-position offset in bytes.
    drift: u32,
    trackers: VecDeque<Tracker>,
    rewinds: u64,
    /// Rewinds that took the register path because the pause hook could not
    /// be trusted.
    slow_jumps: u64,
}

pub struct CmdRing {
    config: RingConfig,
    pages: Arc<Pages>,
    base: u64,
    hw: Arc<dyn RingHardware>,
    fences: Arc<FenceMachine>,
    state: Mutex<RingState>,
    space_cond: Condvar,
}

impl CmdRing {
    pub fn new(
        config: RingConfig,
        pages: Arc<Pages>,
        base: u64,
        hw: Arc<dyn RingHardware>,
        fences: Arc<FenceMachine>,
    ) -> Result<Arc<CmdRing>, Error> {
        if !config.size.is_power_of_two() || config.size < 4 * REWIND_HEAD {
            return Err(Error::InvalidArgument {
                what: "ring size must be a power of two and hold a rewind",
            });
        }
        if config.min_submit % cmd::DWORD != 0
            || config.min_submit < FENCE_BYTES
            || config.min_submit > config.size / 4
        {
            return Err(Error::InvalidArgument {
                what: "ring minimum submission size out of range",
            });
        }
        if base
            .checked_add(u64::from(config.size))
            .map_or(true, |end| end > pages.len())
        {
            return Err(Error::InvalidArgument {
                what: "ring storage span exceeds backing pages",
            });
        }
        Ok(Arc::new(CmdRing {
            config,
            pages,
            base,
            hw,
            fences,
            state: Mutex::new(RingState {
                started: false,
                low: 0,
                free: 0,
                drift: 0,
                trackers: VecDeque::new(),
                rewinds: 0,
                slow_jumps: 0,
            }),
            space_cond: Condvar::new(),
        }))
    }

    /// Bind the fetch engine to the ring and calibrate the reader-position
    /// drift against a known pause point.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        cmd::write_dword(&self.pages, self.base, cmd::pause());
        self.hw
            .start(self.pages.clone(), self.base, self.config.size);
        self.hw.resume_to(0);
        // The trap is at offset zero, so whatever the register reports now
        // is pure drift.
        state.drift = self.hw.reader_pos();
        state.started = true;
        info!(drift_bytes = state.drift, size = self.config.size, "command ring started");
    }

    fn ring_offset(&self, pos: u64) -> u32 {
        (pos % u64::from(self.config.size)) as u32
    }

    fn retire_locked(&self, state: &mut RingState) {
        self.fences.poll(EngineId::Cmd);
        let completed = self.fences.completed(EngineId::Cmd);
        let mut progressed = false;
        while let Some(front) = state.trackers.front() {
            if !seq_passed(completed, front.seq) {
                break;
            }
            state.free = front.end;
            state.trackers.pop_front();
            progressed = true;
        }
        if progressed {
            self.space_cond.notify_all();
        }
    }

    fn available(&self, state: &RingState) -> u32 {
        self.config.size - (state.low - state.free) as u32
    }

    /// Free bytes after retiring what hardware has passed.
    pub fn space(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        self.retire_locked(&mut state);
        self.available(&state)
    }

    /// Ring offset the next submission will start at.
    pub fn write_offset(&self) -> u32 {
        let state = self.state.lock().unwrap();
        self.ring_offset(state.low)
    }

    pub fn rewinds(&self) -> u64 {
        self.state.lock().unwrap().rewinds
    }

    pub fn slow_jumps(&self) -> u64 {
        self.state.lock().unwrap().slow_jumps
    }

    fn try_claim(&self, state: &RingState, total: u32) -> Claim {
        let offset = self.ring_offset(state.low);
        let contig = self.config.size - offset;
        let avail = self.available(state);
        if contig < total + PAUSE_BYTES {
            if avail >= contig + REWIND_HEAD {
                Claim::NeedsRewind
            } else {
                Claim::NeedsSpace
            }
        } else if avail >= total + PAUSE_BYTES {
            Claim::At(offset)
        } else {
            Claim::NeedsSpace
        }
    }

    /// Wrap the producer back to offset zero.
    ///
    /// The head content (fillers plus the new trap) is written before the
    /// old trap is hooked into a jump, so the fetch engine can never chase
    /// the jump into unwritten bytes.
    fn rewind_locked(&self, state: &mut RingState) {
        let offset = self.ring_offset(state.low);
        let contig = self.config.size - offset;

        for i in 0..REWIND_FILLERS {
            cmd::write_dword(&self.pages, self.base + u64::from(i * cmd::DWORD), cmd::nop());
        }
        cmd::write_dword(
            &self.pages,
            self.base + u64::from(REWIND_FILLERS * cmd::DWORD),
            cmd::pause(),
        );

        let expected = (offset + state.drift) % self.config.size;
        let reported = self.hw.reader_pos();
        let direct = expected.abs_diff(reported);
        let diff = direct.min(self.config.size - direct);
        if diff > self.config.drift_tolerance {
            // The trap position cannot be trusted; neutralize it and move
            // the fetch engine through registers instead.
            warn!(
                expected,
                reported,
                tolerance = self.config.drift_tolerance,
                "reader drift outside calibration, taking register jump"
            );
            cmd::write_dword(&self.pages, self.base + u64::from(offset), cmd::nop());
            self.hw.set_fetch(0);
            state.slow_jumps += 1;
        } else {
            cmd::write_dword(&self.pages, self.base + u64::from(offset), cmd::jump(0));
        }

        // The dead tail plus the head fillers count as produced; the new
        // trap at REWIND_FILLERS dwords is not.
        state.low += u64::from(contig + REWIND_HEAD - PAUSE_BYTES);
        state.rewinds += 1;
        debug!(skipped = contig, "ring rewind");
    }

    /// Queue `cmds` on the ring, emitting an inline fence write after them.
    /// Returns the sequence number the fence write carries; pair it with
    /// [`Self::fence_for`] to obtain a waitable fence.
    pub fn submit(&self, cmds: &[u8], no_wait: bool) -> Result<u32, Error> {
        if cmds.is_empty() || cmds.len() % cmd::DWORD as usize != 0 {
            return Err(Error::InvalidArgument {
                what: "ring submission not dword-granular",
            });
        }
        let len = u32::try_from(cmds.len()).map_err(|_| Error::InvalidArgument {
            what: "ring submission length",
        })?;
        let total = (len + FENCE_BYTES).max(self.config.min_submit);
        if total + PAUSE_BYTES + REWIND_HEAD > self.config.size {
            return Err(Error::InvalidArgument {
                what: "submission larger than the ring",
            });
        }

        let mut state = self.state.lock().unwrap();
        if !state.started {
            return Err(Error::InvalidArgument {
                what: "ring not started",
            });
        }
        let offset = loop {
            self.retire_locked(&mut state);
            match self.try_claim(&state, total) {
                Claim::At(offset) => break offset,
                Claim::NeedsRewind => {
                    self.rewind_locked(&mut state);
                    continue;
                }
                Claim::NeedsSpace => {}
            }
            if no_wait {
                return Err(Error::Busy);
            }
            // Space appears only when trackers retire; poll on a short tick.
            let (next, _) = self
                .space_cond
                .wait_timeout(state, Duration::from_millis(1))
                .unwrap();
            state = next;
        };

        let start = self.base + u64::from(offset);
        self.pages.write(start, cmds);

        let seq = self.fences.alloc_seq(EngineId::Cmd);
        let mut pos = len;
        cmd::write_dword(&self.pages, start + u64::from(pos), cmd::fence_header());
        cmd::write_dword(&self.pages, start + u64::from(pos) + 4, seq);
        pos += FENCE_BYTES;
        while pos < total {
            cmd::write_dword(&self.pages, start + u64::from(pos), cmd::nop());
            pos += cmd::DWORD;
        }
        cmd::write_dword(&self.pages, start + u64::from(total), cmd::pause());

        let end = state.low + u64::from(total);
        state.trackers.push_back(Tracker { end, seq });
        state.low = end;
        let pause_at = self.ring_offset(state.low);
        self.hw.resume_to(pause_at);
        debug!(seq, bytes = total, pause_at, "ring submit");
        Ok(seq)
    }

    /// Fence object for a sequence returned by [`Self::submit`].
    pub fn fence_for(&self, seq: u32, types: FenceTypes) -> Result<Arc<Fence>, Error> {
        self.fences.create_at(EngineId::Cmd, types, seq)
    }

    /// Register-port submission for devices without a DMA ring. The stream
    /// is verified first and execution is serialized against ring traffic.
    pub fn submit_system(&self, cmds: &[u8]) -> Result<(), Error> {
        cmd::verify_stream(cmds)?;
        let _state = self.state.lock().unwrap();
        self.hw.execute_immediate(cmds);
        Ok(())
    }

    /// Block until every tracked submission has retired.
    pub fn wait_idle(&self) {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                self.retire_locked(&mut state);
                if state.trackers.is_empty() {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl std::fmt::Debug for CmdRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CmdRing")
            .field("size", &self.config.size)
            .field("low", &state.low)
            .field("free", &state.free)
            .field("trackers", &state.trackers.len())
            .field("slow_jumps", &state.slow_jumps)
            .finish()
    }
}
