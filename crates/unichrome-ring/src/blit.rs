//! Scatter-gather DMA blit engines.
//!
//! Each engine consumes a queue of transfers; a transfer is a chain of
//! page-granular descriptors built back to front, so every descriptor's next
//! link already points at finished memory by the time the head is armed. The
//! memory manager drives these through [`BlitDevice`], which round-robins
//! the four engines and hands back the fence that signals completion.
//!
//! A transfer that makes no progress for longer than the abort window is
//! failed terminally and the engine re-armed on the next queued transfer,
//! so one wedged chain cannot stall migration forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use unichrome_fence::{EngineError, EngineStatus, Fence, FenceMachine};
use unichrome_mm::{BlitMover, BlitRequest, Pages};
use unichrome_types::{EngineId, Error, FenceTypes};

/// Descriptor granularity.
pub const BLIT_PAGE: u64 = 4096;
/// Longest descriptor chain one transfer may carry.
const MAX_CHAIN: usize = 4096;
/// Error code posted on a fence whose transfer was aborted.
pub const ABORT_CODE: u32 = 0xB1;

const ENGINES: usize = 4;

#[derive(Clone, Copy, Debug)]
struct Descriptor {
    src: u64,
    dst: u64,
    len: u64,
    next: Option<usize>,
}

/// Split a request into page descriptors, linked back to front.
fn build_chain(request: &BlitRequest) -> Result<Vec<Descriptor>, Error> {
    let count = usize::try_from(request.len.div_ceil(BLIT_PAGE))
        .map_err(|_| Error::InvalidArgument { what: "blit length" })?;
    if count == 0 || count > MAX_CHAIN {
        return Err(Error::InvalidArgument {
            what: "blit descriptor chain length out of range",
        });
    }
    let mut chain = Vec::with_capacity(count);
    chain.resize(
        count,
        Descriptor {
            src: 0,
            dst: 0,
            len: 0,
            next: None,
        },
    );
    let mut next = None;
    for i in (0..count).rev() {
        let start = i as u64 * BLIT_PAGE;
        chain[i] = Descriptor {
            src: request.src.offset + start,
            dst: request.dst.offset + start,
            len: (request.len - start).min(BLIT_PAGE),
            next,
        };
        next = Some(i);
    }
    Ok(chain)
}

struct Transfer {
    seq: u32,
    src: Arc<Pages>,
    dst: Arc<Pages>,
    chain: Vec<Descriptor>,
    queued: Instant,
}

struct BlitInner {
    queue: VecDeque<Transfer>,
    completed: u32,
    /// Aborted (sequence, code) pairs not yet reported, oldest first.
    aborted: VecDeque<(u32, u32)>,
    /// Pump passes that should simulate a stalled engine.
    stalled: u32,
}

pub struct BlitEngine {
    engine: EngineId,
    abort_after: Duration,
    inner: Mutex<BlitInner>,
    aborts: AtomicU64,
}

impl BlitEngine {
    pub fn new(engine: EngineId, abort_after: Duration) -> Arc<BlitEngine> {
        debug_assert!(matches!(
            engine,
            EngineId::Blit0 | EngineId::Blit1 | EngineId::Blit2 | EngineId::Blit3
        ));
        Arc::new(BlitEngine {
            engine,
            abort_after,
            inner: Mutex::new(BlitInner {
                queue: VecDeque::new(),
                completed: 0,
                aborted: VecDeque::new(),
                stalled: 0,
            }),
            aborts: AtomicU64::new(0),
        })
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    /// Queue one transfer under an already-claimed sequence number.
    pub fn queue(&self, request: &BlitRequest, seq: u32) -> Result<(), Error> {
        if request.len == 0 {
            return Err(Error::InvalidArgument { what: "empty blit" });
        }
        let src_end = request.src.offset.checked_add(request.len);
        let dst_end = request.dst.offset.checked_add(request.len);
        if src_end.map_or(true, |end| end > request.src.pages.len())
            || dst_end.map_or(true, |end| end > request.dst.pages.len())
        {
            return Err(Error::InvalidArgument {
                what: "blit span exceeds backing pages",
            });
        }
        let chain = build_chain(request)?;
        let mut inner = self.inner.lock().unwrap();
        debug!(engine = ?self.engine, seq, descriptors = chain.len(), "blit queued");
        inner.queue.push_back(Transfer {
            seq,
            src: request.src.pages.clone(),
            dst: request.dst.pages.clone(),
            chain,
            queued: Instant::now(),
        });
        Ok(())
    }

    /// Drive the engine: execute queued transfers, aborting any that have
    /// exceeded the abort window without progress. Called from the fence
    /// poll path.
    pub fn pump(&self) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.stalled > 0 {
                let (seq, expired) = match inner.queue.front() {
                    Some(front) => (front.seq, front.queued.elapsed() >= self.abort_after),
                    None => break,
                };
                inner.stalled -= 1;
                if !expired {
                    break;
                }
                warn!(engine = ?self.engine, seq, "blit transfer aborted");
                inner.queue.pop_front();
                inner.completed = seq;
                inner.aborted.push_back((seq, ABORT_CODE));
                self.aborts.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let Some(transfer) = inner.queue.pop_front() else {
                break;
            };
            let mut at = Some(0);
            while let Some(i) = at {
                let d = transfer.chain[i];
                Pages::copy(&transfer.src, d.src, &transfer.dst, d.dst, d.len);
                at = d.next;
            }
            inner.completed = transfer.seq;
        }
    }

    /// Progress snapshot for the fence poll path.
    ///
    /// Each abort is delivered exactly once, scoped to the aborted sequence;
    /// while one is outstanding the reported progress stops at it, so a
    /// transfer that completed in the same pump pass signals cleanly on the
    /// following read.
    pub fn status(&self) -> EngineStatus {
        let mut inner = self.inner.lock().unwrap();
        if let Some((seq, code)) = inner.aborted.pop_front() {
            return EngineStatus {
                completed: seq,
                signaled_types: FenceTypes::EXE,
                error: Some(EngineError {
                    code,
                    seq: Some(seq),
                }),
            };
        }
        EngineStatus {
            completed: inner.completed,
            signaled_types: FenceTypes::EXE,
            error: None,
        }
    }

    /// Make the next `pumps` pump passes act as a hung engine.
    pub fn force_stall(&self, pumps: u32) {
        self.inner.lock().unwrap().stalled = pumps;
    }
}

impl std::fmt::Debug for BlitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("BlitEngine")
            .field("engine", &self.engine)
            .field("queued", &inner.queue.len())
            .field("completed", &inner.completed)
            .finish()
    }
}

/// The four blit engines behind one [`BlitMover`] face, round-robined per
/// transfer so concurrent migrations spread across hardware.
pub struct BlitDevice {
    engines: [Arc<BlitEngine>; ENGINES],
    fences: Arc<FenceMachine>,
    next: AtomicUsize,
}

impl BlitDevice {
    pub fn new(engines: [Arc<BlitEngine>; ENGINES], fences: Arc<FenceMachine>) -> Arc<BlitDevice> {
        Arc::new(BlitDevice {
            engines,
            fences,
            next: AtomicUsize::new(0),
        })
    }

    pub fn engine(&self, n: usize) -> Option<&Arc<BlitEngine>> {
        self.engines.get(n)
    }
}

impl BlitMover for BlitDevice {
    fn queue_copy(&self, request: BlitRequest) -> Result<Arc<Fence>, Error> {
        let n = self.next.fetch_add(1, Ordering::Relaxed) % ENGINES;
        let engine = EngineId::blit(n).ok_or(Error::InvalidArgument {
            what: "blit engine index",
        })?;
        let seq = self.fences.alloc_seq(engine);
        self.engines[n].queue(&request, seq)?;
        self.fences.create_at(engine, FenceTypes::EXE, seq)
    }
}
