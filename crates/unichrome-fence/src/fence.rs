use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::warn;
use unichrome_types::{seq_passed, EngineId, Error, FenceTypes};

/// Snapshot of an engine's progress, as read back from hardware (or a
/// software model standing in for it).
///
/// `signaled_types` are the completion-type bits that hold for every
/// sequence at or below `completed`.
#[derive(Clone, Copy, Debug)]
pub struct EngineStatus {
    pub completed: u32,
    pub signaled_types: FenceTypes,
    pub error: Option<EngineError>,
}

/// An engine-posted failure. `seq` scopes the error to one sequence (a
/// single aborted transfer); `None` means the whole engine is wedged and
/// every fence retired by the report inherits the error.
#[derive(Clone, Copy, Debug)]
pub struct EngineError {
    pub code: u32,
    pub seq: Option<u32>,
}

/// Hardware access used by the poll path.
///
/// Implementations read a last-completed-sequence register (command engine)
/// or inspect a completion queue (blit engines). `flush` asks the device to
/// publish its freshest view for the given types; the default is a no-op for
/// hardware that always reports current state.
pub trait FenceDriver: Send + Sync {
    fn poll(&self, engine: EngineId) -> EngineStatus;

    fn flush(&self, engine: EngineId, types: FenceTypes) {
        let _ = (engine, types);
    }
}

#[derive(Debug)]
struct FenceState {
    signaled: FenceTypes,
    error: Option<u32>,
}

/// A single completion point on one engine.
///
/// `signaled` bits only ever accumulate; once `error` is posted the fence is
/// terminal and its signaled set is frozen.
#[derive(Debug)]
pub struct Fence {
    engine: EngineId,
    types: FenceTypes,
    seq: u32,
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl Fence {
    fn new(engine: EngineId, types: FenceTypes, seq: u32) -> Arc<Fence> {
        Arc::new(Fence {
            engine,
            types,
            seq,
            state: Mutex::new(FenceState {
                signaled: FenceTypes::empty(),
                error: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    /// The completion-type bits this fence tracks.
    pub fn types(&self) -> FenceTypes {
        self.types
    }

    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Whether every bit in `mask` (restricted to the tracked types) has
    /// signaled. An errored fence reports `false`; waiters see the error.
    pub fn signaled(&self, mask: FenceTypes) -> bool {
        let state = self.state.lock().unwrap();
        state.error.is_none() && state.signaled.contains(mask & self.types)
    }

    pub fn error(&self) -> Option<u32> {
        self.state.lock().unwrap().error
    }

    /// Accumulate signaled bits. Returns true once the fence is terminal
    /// (fully signaled or errored).
    fn signal(&self, types: FenceTypes) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.error.is_some() {
            return true;
        }
        let add = types & self.types;
        if !state.signaled.contains(add) {
            state.signaled |= add;
            self.cond.notify_all();
        }
        state.signaled == self.types
    }

    fn post_error(&self, code: u32) {
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(code);
            self.cond.notify_all();
        }
    }
}

#[derive(Debug)]
struct ClassInner {
    completed: u32,
    pending: Vec<Arc<Fence>>,
}

/// Per-engine sequence space.
///
/// The pending list holds strong references until a fence is terminal, so a
/// buffer object's weak `sync_obj` reference failing to upgrade always means
/// the fence finished (one way or the other) and the memory is safe.
#[derive(Debug)]
struct FenceClass {
    next_seq: AtomicU32,
    inner: Mutex<ClassInner>,
}

impl FenceClass {
    fn new() -> FenceClass {
        FenceClass {
            next_seq: AtomicU32::new(0),
            inner: Mutex::new(ClassInner {
                completed: 0,
                pending: Vec::new(),
            }),
        }
    }
}

const BARRIER_SLOTS: usize = FenceTypes::BARRIER_CLASSES.len();

/// Fence bookkeeping for one device: one class per engine plus the barrier
/// slots retaining "the most recent fence of each ordering class".
pub struct FenceMachine {
    driver: Arc<dyn FenceDriver>,
    classes: Vec<FenceClass>,
    barriers: Mutex<[Option<Arc<Fence>>; BARRIER_SLOTS]>,
    killed: AtomicBool,
    // Remaining forced create failures; lets callers exercise the
    // synchronous-idle fallback without real memory pressure.
    forced_create_failures: AtomicU32,
}

impl FenceMachine {
    pub fn new(driver: Arc<dyn FenceDriver>) -> Arc<FenceMachine> {
        Arc::new(FenceMachine {
            driver,
            classes: (0..EngineId::COUNT).map(|_| FenceClass::new()).collect(),
            barriers: Mutex::new(Default::default()),
            killed: AtomicBool::new(false),
            forced_create_failures: AtomicU32::new(0),
        })
    }

    fn class(&self, engine: EngineId) -> &FenceClass {
        &self.classes[engine.index()]
    }

    /// Claim the next sequence number for `engine` without creating a fence
    /// object. Used by the ring, which must emit the sequence into the
    /// command stream before the fence exists.
    pub fn alloc_seq(&self, engine: EngineId) -> u32 {
        self.class(engine).next_seq.fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Create a fence bound to a freshly allocated sequence.
    pub fn create(&self, engine: EngineId, types: FenceTypes) -> Result<Arc<Fence>, Error> {
        let seq = self.alloc_seq(engine);
        self.create_at(engine, types, seq)
    }

    /// Create a fence for an already-claimed sequence (see [`Self::alloc_seq`]).
    pub fn create_at(
        &self,
        engine: EngineId,
        types: FenceTypes,
        seq: u32,
    ) -> Result<Arc<Fence>, Error> {
        if types.is_empty() {
            return Err(Error::InvalidArgument {
                what: "fence with empty type mask",
            });
        }
        if self
            .forced_create_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::OutOfMemory { requested: 0 });
        }

        let fence = Fence::new(engine, types, seq);
        {
            let mut inner = self.class(engine).inner.lock().unwrap();
            // A sequence claimed before a reset may already be complete.
            if seq_passed(inner.completed, seq) {
                fence.signal(types);
            } else {
                inner.pending.push(fence.clone());
            }
        }
        self.update_barriers(&fence);
        Ok(fence)
    }

    /// Arrange for the next `count` creations to fail, for exercising the
    /// fence-or-synchronous-idle fallback.
    pub fn force_create_failures(&self, count: u32) {
        self.forced_create_failures.store(count, Ordering::Relaxed);
    }

    fn update_barriers(&self, fence: &Arc<Fence>) {
        let mut barriers = self.barriers.lock().unwrap();
        for (slot, class) in FenceTypes::BARRIER_CLASSES.iter().enumerate() {
            if fence.types().contains(*class) {
                // Replacing drops our reference to the superseded barrier.
                barriers[slot] = Some(fence.clone());
            }
        }
    }

    /// The most recent fence of a barrier ordering class, if any.
    pub fn barrier(&self, slot: usize) -> Option<Arc<Fence>> {
        self.barriers.lock().unwrap().get(slot)?.clone()
    }

    /// Poll one engine: read hardware progress and retire pending fences
    /// whose sequences have been passed.
    pub fn poll(&self, engine: EngineId) {
        let status = self.driver.poll(engine);
        let mut inner = self.class(engine).inner.lock().unwrap();
        // A stale hardware read must never roll progress back.
        if seq_passed(status.completed, inner.completed) {
            inner.completed = status.completed;
        }
        let completed = inner.completed;
        inner.pending.retain(|fence| {
            if !seq_passed(completed, fence.sequence()) {
                return true;
            }
            if let Some(error) = status.error {
                if error.seq.map_or(true, |seq| seq == fence.sequence()) {
                    fence.post_error(error.code);
                    return false;
                }
            }
            // Partially satisfied fences stay pending until every tracked
            // type bit has signaled.
            !fence.signal(status.signaled_types)
        });
    }

    /// Last completed sequence observed for `engine` (as of the last poll).
    pub fn completed(&self, engine: EngineId) -> u32 {
        self.class(engine).inner.lock().unwrap().completed
    }

    /// Request an immediate poll pass for the freshest view.
    pub fn flush(&self, engine: EngineId, types: FenceTypes) {
        self.driver.flush(engine, types);
        self.poll(engine);
    }

    /// Block until `mask` has signaled on `fence` or an error is posted.
    ///
    /// `lazy` trades wakeup latency for fewer poll passes. In kill mode an
    /// interruptible wait fails with [`Error::Interrupted`] so teardown can
    /// evict sleeping clients.
    pub fn wait(
        &self,
        fence: &Fence,
        lazy: bool,
        interruptible: bool,
        mask: FenceTypes,
    ) -> Result<(), Error> {
        let mask = mask & fence.types();
        if mask.is_empty() {
            return Err(Error::InvalidArgument {
                what: "fence wait with no tracked types",
            });
        }
        let tick = if lazy {
            Duration::from_millis(10)
        } else {
            Duration::from_millis(1)
        };
        loop {
            if interruptible && self.killed.load(Ordering::Acquire) {
                return Err(Error::interrupted());
            }
            self.flush(fence.engine(), mask);

            let state = fence.state.lock().unwrap();
            if let Some(code) = state.error {
                return Err(Error::HardwareError { code });
            }
            if state.signaled.contains(mask) {
                return Ok(());
            }
            // Re-polled on timeout; the poller task also notifies us through
            // the fence condvar when it makes progress.
            let _ = fence.cond.wait_timeout(state, tick).unwrap();
        }
    }

    /// Synchronously drain an engine: poll until nothing is pending.
    ///
    /// This is the degraded path used when fence creation fails; the caller
    /// learns "the engine is idle" instead of receiving a fence.
    pub fn wait_engine_idle(&self, engine: EngineId, interruptible: bool) -> Result<(), Error> {
        loop {
            if interruptible && self.killed.load(Ordering::Acquire) {
                return Err(Error::interrupted());
            }
            self.poll(engine);
            if self.class(engine).inner.lock().unwrap().pending.is_empty() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Enter/leave kill mode: interruptible waiters fail instead of
    /// sleeping. Set during whole-device teardown.
    pub fn set_kill(&self, kill: bool) {
        self.killed.store(kill, Ordering::Release);
        if kill {
            // Kick every sleeping waiter so it observes the flag.
            for engine in EngineId::ALL {
                let inner = self.class(engine).inner.lock().unwrap();
                for fence in &inner.pending {
                    fence.cond.notify_all();
                }
            }
        }
    }

    /// Engine-reset recovery: force-signal every outstanding fence with a
    /// frozen error so no waiter can hang, and advance each class's
    /// completed sequence past everything handed out.
    pub fn reset(&self, code: u32) {
        warn!(code, "fence machine reset: force-signaling outstanding fences");
        for engine in EngineId::ALL {
            let class = self.class(engine);
            let mut inner = class.inner.lock().unwrap();
            inner.completed = class.next_seq.load(Ordering::Relaxed);
            for fence in inner.pending.drain(..) {
                fence.post_error(code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Driver whose reported progress is set directly by the test.
    #[derive(Default)]
    struct ScriptedDriver {
        status: StdMutex<Vec<EngineStatus>>,
    }

    impl ScriptedDriver {
        fn new() -> Arc<ScriptedDriver> {
            Arc::new(ScriptedDriver {
                status: StdMutex::new(
                    (0..EngineId::COUNT)
                        .map(|_| EngineStatus {
                            completed: 0,
                            signaled_types: FenceTypes::EXE,
                            error: None,
                        })
                        .collect(),
                ),
            })
        }

        fn set(&self, engine: EngineId, status: EngineStatus) {
            self.status.lock().unwrap()[engine.index()] = status;
        }
    }

    impl FenceDriver for ScriptedDriver {
        fn poll(&self, engine: EngineId) -> EngineStatus {
            self.status.lock().unwrap()[engine.index()]
        }
    }

    #[test]
    fn sequences_are_strictly_increasing() {
        let machine = FenceMachine::new(ScriptedDriver::new());
        let mut last = None;
        for _ in 0..64 {
            let fence = machine.create(EngineId::Cmd, FenceTypes::EXE).unwrap();
            if let Some(prev) = last {
                assert_eq!(fence.sequence(), u32::wrapping_add(prev, 1));
            }
            last = Some(fence.sequence());
        }
    }

    #[test]
    fn poll_signals_passed_fences_only() {
        let driver = ScriptedDriver::new();
        let machine = FenceMachine::new(driver.clone());
        let f1 = machine.create(EngineId::Cmd, FenceTypes::EXE).unwrap();
        let f2 = machine.create(EngineId::Cmd, FenceTypes::EXE).unwrap();

        driver.set(
            EngineId::Cmd,
            EngineStatus {
                completed: f1.sequence(),
                signaled_types: FenceTypes::EXE,
                error: None,
            },
        );
        machine.poll(EngineId::Cmd);
        assert!(f1.signaled(FenceTypes::EXE));
        assert!(!f2.signaled(FenceTypes::EXE));
    }

    #[test]
    fn signaled_types_accumulate_monotonically() {
        let driver = ScriptedDriver::new();
        let machine = FenceMachine::new(driver.clone());
        let fence = machine
            .create(EngineId::Cmd, FenceTypes::EXE | FenceTypes::HQV0)
            .unwrap();

        driver.set(
            EngineId::Cmd,
            EngineStatus {
                completed: fence.sequence(),
                signaled_types: FenceTypes::HQV0,
                error: None,
            },
        );
        machine.poll(EngineId::Cmd);
        assert!(fence.signaled(FenceTypes::HQV0));
        assert!(!fence.signaled(FenceTypes::EXE | FenceTypes::HQV0));

        // A later poll reporting only EXE must not clear HQV0.
        driver.set(
            EngineId::Cmd,
            EngineStatus {
                completed: fence.sequence(),
                signaled_types: FenceTypes::EXE,
                error: None,
            },
        );
        machine.poll(EngineId::Cmd);
        assert!(fence.signaled(FenceTypes::EXE | FenceTypes::HQV0));
    }

    #[test]
    fn wait_returns_hardware_error() {
        let driver = ScriptedDriver::new();
        let machine = FenceMachine::new(driver.clone());
        let fence = machine.create(EngineId::Cmd, FenceTypes::EXE).unwrap();

        driver.set(
            EngineId::Cmd,
            EngineStatus {
                completed: fence.sequence(),
                signaled_types: FenceTypes::empty(),
                error: Some(EngineError {
                    code: 0xdead,
                    seq: None,
                }),
            },
        );
        let err = machine
            .wait(&fence, false, false, FenceTypes::EXE)
            .unwrap_err();
        assert_eq!(err, Error::HardwareError { code: 0xdead });
        // Frozen: later progress does not clear the error.
        driver.set(
            EngineId::Cmd,
            EngineStatus {
                completed: fence.sequence(),
                signaled_types: FenceTypes::EXE,
                error: None,
            },
        );
        machine.poll(EngineId::Cmd);
        assert_eq!(fence.error(), Some(0xdead));
    }

    #[test]
    fn stale_completed_reports_do_not_regress_progress() {
        let driver = ScriptedDriver::new();
        let machine = FenceMachine::new(driver.clone());
        let f1 = machine.create(EngineId::Cmd, FenceTypes::EXE).unwrap();
        driver.set(
            EngineId::Cmd,
            EngineStatus {
                completed: f1.sequence(),
                signaled_types: FenceTypes::EXE,
                error: None,
            },
        );
        machine.poll(EngineId::Cmd);
        assert!(f1.signaled(FenceTypes::EXE));

        // A read that went stale and reports an older position must not
        // roll the class's completed sequence back.
        driver.set(
            EngineId::Cmd,
            EngineStatus {
                completed: f1.sequence().wrapping_sub(1),
                signaled_types: FenceTypes::EXE,
                error: None,
            },
        );
        machine.poll(EngineId::Cmd);
        assert_eq!(machine.completed(EngineId::Cmd), f1.sequence());
    }

    #[test]
    fn reset_terminates_all_waiters() {
        let driver = ScriptedDriver::new();
        let machine = FenceMachine::new(driver.clone());
        let fence = machine.create(EngineId::Blit1, FenceTypes::EXE).unwrap();

        let waiter = {
            let machine = machine.clone();
            let fence = fence.clone();
            std::thread::spawn(move || machine.wait(&fence, true, false, FenceTypes::EXE))
        };
        std::thread::sleep(Duration::from_millis(5));
        machine.reset(0xbad);
        let result = waiter.join().unwrap();
        assert_eq!(result, Err(Error::HardwareError { code: 0xbad }));
    }

    #[test]
    fn barrier_slot_tracks_most_recent_class_fence() {
        let machine = FenceMachine::new(ScriptedDriver::new());
        let slot = FenceTypes::HQV0.barrier_slot().unwrap();
        assert!(machine.barrier(slot).is_none());

        let a = machine
            .create(EngineId::Hqv0, FenceTypes::EXE | FenceTypes::HQV0)
            .unwrap();
        assert_eq!(machine.barrier(slot).unwrap().sequence(), a.sequence());

        let b = machine
            .create(EngineId::Hqv0, FenceTypes::EXE | FenceTypes::HQV0)
            .unwrap();
        assert_eq!(machine.barrier(slot).unwrap().sequence(), b.sequence());
    }

    #[test]
    fn forced_create_failure_surfaces_out_of_memory() {
        let machine = FenceMachine::new(ScriptedDriver::new());
        machine.force_create_failures(1);
        assert!(matches!(
            machine.create(EngineId::Cmd, FenceTypes::EXE),
            Err(Error::OutOfMemory { .. })
        ));
        assert!(machine.create(EngineId::Cmd, FenceTypes::EXE).is_ok());
    }

    #[test]
    fn kill_mode_fails_interruptible_waits() {
        let machine = FenceMachine::new(ScriptedDriver::new());
        let fence = machine.create(EngineId::Cmd, FenceTypes::EXE).unwrap();
        machine.set_kill(true);
        assert_eq!(
            machine.wait(&fence, false, true, FenceTypes::EXE),
            Err(Error::interrupted())
        );
        // Non-interruptible waits keep going; clear kill and signal instead.
        machine.set_kill(false);
    }
}
