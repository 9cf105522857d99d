//! Buffer objects.
//!
//! A buffer object couples backing storage with placement bookkeeping, a
//! reservation slot (claimed under the global validate-sequence order during
//! execbuf), per-client CPU-grab nesting, and a weak back-reference to the
//! fence that last touched the memory. The weak reference never extends the
//! fence's life: if the upgrade fails the fence already reached a terminal
//! state and the memory is safe.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};

use unichrome_fence::Fence;
use unichrome_types::{Error, FenceTypes, MemDomain, PlacementFlags};

use crate::pages::Pages;
use crate::registry::ClientId;

/// Where a buffer's bytes currently live.
#[derive(Clone, Debug)]
pub enum Backing {
    /// Created but never populated; reads are undefined, moves are free.
    None,
    /// Unmanaged system pages owned by this object alone.
    System { pages: Arc<Pages> },
    /// A range inside a managed domain aperture.
    Aperture {
        domain: MemDomain,
        offset: u64,
        pages: Arc<Pages>,
    },
}

impl Backing {
    pub fn domain(&self) -> MemDomain {
        match self {
            Backing::None | Backing::System { .. } => MemDomain::System,
            Backing::Aperture { domain, .. } => *domain,
        }
    }

    /// CPU-visible span of the bytes, if populated.
    pub fn span(&self) -> Option<(Arc<Pages>, u64)> {
        match self {
            Backing::None => None,
            Backing::System { pages } => Some((pages.clone(), 0)),
            Backing::Aperture { offset, pages, .. } => Some((pages.clone(), *offset)),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SyncObj {
    fence: Option<(Weak<Fence>, FenceTypes)>,
}

pub(crate) struct BoState {
    pub backing: Backing,
    /// Current placement: exactly one domain flag plus caching bits once
    /// placed; the requested mask before first validation.
    pub placement: PlacementFlags,
    /// What the next validation should aim for.
    pub proposed: PlacementFlags,
    /// GPU-visible address (domain base + offset); 0 until first placed in a
    /// GPU domain.
    pub gpu_offset: u64,
    pub sync: SyncObj,
    /// Validate-sequence ticket of the execbuf call holding the reservation.
    pub reserved: Option<u64>,
    pub cpu_grabs: HashMap<ClientId, u32>,
}

pub struct BufferObject {
    handle: u32,
    size: u64,
    alignment: u64,
    /// Stable cookie for the (external) memory-mapping layer.
    map_offset: u64,
    pub(crate) state: Mutex<BoState>,
    pub(crate) cond: Condvar,
}

impl BufferObject {
    pub(crate) fn new(
        handle: u32,
        size: u64,
        alignment: u64,
        map_offset: u64,
        requested: PlacementFlags,
    ) -> Arc<BufferObject> {
        Arc::new(BufferObject {
            handle,
            size,
            alignment,
            map_offset,
            state: Mutex::new(BoState {
                backing: Backing::None,
                placement: PlacementFlags::SYSTEM | requested.caching(),
                proposed: requested,
                gpu_offset: 0,
                sync: SyncObj::default(),
                reserved: None,
                cpu_grabs: HashMap::new(),
            }),
            cond: Condvar::new(),
        })
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn map_offset(&self) -> u64 {
        self.map_offset
    }

    pub fn placement(&self) -> PlacementFlags {
        self.state.lock().unwrap().placement
    }

    pub fn proposed(&self) -> PlacementFlags {
        self.state.lock().unwrap().proposed
    }

    pub fn current_domain(&self) -> MemDomain {
        self.state.lock().unwrap().backing.domain()
    }

    pub fn gpu_offset(&self) -> u64 {
        self.state.lock().unwrap().gpu_offset
    }

    /// CPU-visible span of the current backing, if populated.
    pub fn span(&self) -> Option<(Arc<Pages>, u64)> {
        self.state.lock().unwrap().backing.span()
    }

    /// The fence (and type mask) guarding the last GPU access, if it is
    /// still outstanding.
    pub fn sync_fence(&self) -> Option<(Arc<Fence>, FenceTypes)> {
        let state = self.state.lock().unwrap();
        let (weak, types) = state.sync.fence.as_ref()?;
        Some((weak.upgrade()?, *types))
    }

    /// Attach the fence of the operation that now owns the memory.
    pub fn set_sync_fence(&self, fence: &Arc<Fence>, types: FenceTypes) {
        let mut state = self.state.lock().unwrap();
        state.sync.fence = Some((Arc::downgrade(fence), types));
    }

    pub fn clear_sync_fence(&self) {
        let mut state = self.state.lock().unwrap();
        state.sync.fence = None;
    }

    // ---- reservation -------------------------------------------------

    /// Claim the reservation for ticket `seq`. Fails (without blocking) if
    /// another call holds it.
    pub fn try_reserve(&self, seq: u64) -> bool {
        self.try_reserve_ordered(seq).is_ok()
    }

    /// Claim the reservation for ticket `seq`, or learn which ticket holds
    /// it. List reservation uses the holder's ticket to decide who backs
    /// off: lower ticket wins.
    pub fn try_reserve_ordered(&self, seq: u64) -> Result<(), u64> {
        let mut state = self.state.lock().unwrap();
        match state.reserved {
            None => {
                state.reserved = Some(seq);
                Ok(())
            }
            Some(holder) => Err(holder),
        }
    }

    pub fn reserved_ticket(&self) -> Option<u64> {
        self.state.lock().unwrap().reserved
    }

    pub fn unreserve(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.reserved.is_some());
        state.reserved = None;
        self.cond.notify_all();
    }

    /// Block until the current reservation (if any) is released. The caller
    /// must hold no reservations of its own; that discipline is what makes
    /// the backoff in list reservation deadlock-free.
    pub fn wait_unreserved(&self) {
        let mut state = self.state.lock().unwrap();
        while state.reserved.is_some() {
            state = self.cond.wait(state).unwrap();
        }
    }

    // ---- CPU grabs ---------------------------------------------------

    /// Nested per-client exclusive CPU access. The device-level entry point
    /// waits for DMA idle first; this only tracks nesting.
    pub(crate) fn cpu_grab(&self, client: ClientId) {
        let mut state = self.state.lock().unwrap();
        *state.cpu_grabs.entry(client).or_insert(0) += 1;
    }

    pub(crate) fn cpu_release(&self, client: ClientId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let Some(count) = state.cpu_grabs.get_mut(&client) else {
            return Err(Error::ProtocolViolation {
                what: "sync-cpu release without grab",
            });
        };
        *count -= 1;
        if *count == 0 {
            state.cpu_grabs.remove(&client);
            self.cond.notify_all();
        }
        Ok(())
    }

    pub fn cpu_grabbed(&self) -> bool {
        !self.state.lock().unwrap().cpu_grabs.is_empty()
    }

    /// Drop every grab `client` holds (file-close cleanup).
    pub(crate) fn cpu_release_all(&self, client: ClientId) {
        let mut state = self.state.lock().unwrap();
        if state.cpu_grabs.remove(&client).is_some() {
            self.cond.notify_all();
        }
    }

    /// Wait until no client holds a CPU grab.
    pub(crate) fn wait_cpu_free(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.cpu_grabs.is_empty() {
            state = self.cond.wait(state).unwrap();
        }
    }
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("placement", &self.placement())
            .field("gpu_offset", &self.gpu_offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bo() -> Arc<BufferObject> {
        BufferObject::new(1, 0x1000, 0, 0x10_0000, PlacementFlags::VRAM)
    }

    #[test]
    fn reservation_is_exclusive() {
        let bo = bo();
        assert!(bo.try_reserve(1));
        assert!(!bo.try_reserve(2));
        assert_eq!(bo.reserved_ticket(), Some(1));
        bo.unreserve();
        assert!(bo.try_reserve(2));
    }

    #[test]
    fn reservation_conflict_reports_the_holding_ticket() {
        let bo = bo();
        assert!(bo.try_reserve_ordered(5).is_ok());
        assert_eq!(bo.try_reserve_ordered(9), Err(5));
        bo.unreserve();
        assert!(bo.try_reserve_ordered(9).is_ok());
    }

    #[test]
    fn cpu_grabs_nest_per_client() {
        let bo = bo();
        let a = ClientId::from_raw(1);
        let b = ClientId::from_raw(2);
        bo.cpu_grab(a);
        bo.cpu_grab(a);
        bo.cpu_grab(b);
        bo.cpu_release(a).unwrap();
        assert!(bo.cpu_grabbed());
        bo.cpu_release(a).unwrap();
        assert!(bo.cpu_grabbed());
        bo.cpu_release_all(b);
        assert!(!bo.cpu_grabbed());
        assert!(bo.cpu_release(a).is_err());
    }

    #[test]
    fn wait_unreserved_wakes_on_release() {
        let bo = bo();
        assert!(bo.try_reserve(7));
        let waiter = {
            let bo = bo.clone();
            std::thread::spawn(move || {
                bo.wait_unreserved();
                assert!(bo.try_reserve(8));
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        bo.unreserve();
        waiter.join().unwrap();
    }
}
