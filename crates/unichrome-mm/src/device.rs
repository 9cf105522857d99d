//! Device-level memory manager: the user-facing create / validate /
//! set-status / sync-cpu operations, eviction policy, and move paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use unichrome_fence::{Fence, FenceMachine};
use unichrome_types::{Error, FenceTypes, MemDomain, PlacementFlags};

use crate::account::AccountingPool;
use crate::bo::{Backing, BufferObject};
use crate::lock::SubsystemLock;
use crate::manager::{DomainSetup, MemTypeManager};
use crate::pages::Pages;
use crate::registry::{ClientId, HandleRegistry};
use crate::stats::{MmStats, MmStatsSnapshot};

/// A CPU-visible span handed to a blit engine.
#[derive(Clone)]
pub struct PageSpan {
    pub pages: Arc<Pages>,
    pub offset: u64,
}

/// One queued copy between two spans.
#[derive(Clone)]
pub struct BlitRequest {
    pub src: PageSpan,
    pub dst: PageSpan,
    pub len: u64,
}

/// DMA-blit capability used for VRAM↔system moves. Returns the fence that
/// signals when the transfer is done; the old memory must not be reused
/// before that fence's EXE bit signals.
pub trait BlitMover: Send + Sync {
    fn queue_copy(&self, request: BlitRequest) -> Result<Arc<Fence>, Error>;
}

/// Static device layout plus eviction policy.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub vram: DomainSetup,
    pub tt: DomainSetup,
    pub priv0: DomainSetup,
    pub accounting_capacity: u64,
    /// Eviction target order when the device is quiet.
    pub idle_eviction: Vec<MemDomain>,
    /// Eviction target order under thrashing: spill directly rather than
    /// contend for the next aperture.
    pub busy_eviction: Vec<MemDomain>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            vram: DomainSetup {
                size: 8 << 20,
                gpu_base: 0,
            },
            tt: DomainSetup {
                size: 16 << 20,
                gpu_base: 0x1000_0000,
            },
            priv0: DomainSetup {
                size: 1 << 20,
                gpu_base: 0x2000_0000,
            },
            accounting_capacity: 64 << 20,
            idle_eviction: vec![MemDomain::Priv0, MemDomain::Tt, MemDomain::System],
            busy_eviction: vec![MemDomain::System],
        }
    }
}

pub struct MemoryManager {
    config: DeviceConfig,
    pub lock: SubsystemLock,
    accounting: AccountingPool,
    managers: Vec<MemTypeManager>,
    registry: HandleRegistry,
    fences: Arc<FenceMachine>,
    blitter: Mutex<Option<Arc<dyn BlitMover>>>,
    stats: MmStats,
    val_seq: AtomicU64,
    next_map_offset: AtomicU64,
    /// Set while allocations are only succeeding through eviction.
    thrashing: AtomicBool,
}

impl MemoryManager {
    pub fn new(config: DeviceConfig, fences: Arc<FenceMachine>) -> Arc<MemoryManager> {
        let managers = MemDomain::ALL
            .iter()
            .map(|domain| match domain {
                MemDomain::Vram => MemTypeManager::managed(MemDomain::Vram, config.vram),
                MemDomain::Tt => MemTypeManager::managed(MemDomain::Tt, config.tt),
                MemDomain::Priv0 => MemTypeManager::managed(MemDomain::Priv0, config.priv0),
                MemDomain::System => MemTypeManager::unmanaged(MemDomain::System),
            })
            .collect();
        Arc::new(MemoryManager {
            accounting: AccountingPool::new(config.accounting_capacity),
            config,
            lock: SubsystemLock::new(),
            managers,
            registry: HandleRegistry::new(),
            fences,
            blitter: Mutex::new(None),
            stats: MmStats::default(),
            val_seq: AtomicU64::new(1),
            next_map_offset: AtomicU64::new(0x1000),
            thrashing: AtomicBool::new(false),
        })
    }

    pub fn set_blitter(&self, blitter: Arc<dyn BlitMover>) {
        *self.blitter.lock().unwrap() = Some(blitter);
    }

    pub fn fences(&self) -> &Arc<FenceMachine> {
        &self.fences
    }

    /// The subsystem reader/writer lock; submission paths hold it in read
    /// mode for their whole lifetime, quiescing takes it in write mode.
    pub fn subsystem_lock(&self) -> &SubsystemLock {
        &self.lock
    }

    pub fn manager(&self, domain: MemDomain) -> &MemTypeManager {
        &self.managers[domain.index()]
    }

    pub fn stats(&self) -> MmStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn live_objects(&self) -> usize {
        self.registry.live_objects()
    }

    /// Ticket source for ordered (deadlock-free) list reservation.
    pub fn next_validate_seq(&self) -> u64 {
        self.val_seq.fetch_add(1, Ordering::Relaxed)
    }

    // ---- client lifecycle -------------------------------------------

    pub fn open_client(&self) -> ClientId {
        ClientId::next()
    }

    /// File-close cleanup: drop the client's references and CPU grabs,
    /// force-release a held write lock, destroy orphans.
    pub fn close_client(&self, client: ClientId) {
        let (touched, dead) = self.registry.close_client(client);
        for bo in &touched {
            bo.cpu_release_all(client);
        }
        for bo in dead {
            self.finalize_bo(&bo);
        }
        self.lock.release_dead_owner(client);
    }

    // ---- object lifecycle -------------------------------------------

    /// Create a buffer object. Eagerly placed when the request names only
    /// GPU domains (so `create → validate(same)` is a strict no-op);
    /// otherwise placement is deferred to the first validation and the
    /// returned offset is 0.
    pub fn create(
        &self,
        client: ClientId,
        size: u64,
        flags: PlacementFlags,
        alignment: u64,
    ) -> Result<(u32, u64), Error> {
        if size == 0 {
            return Err(Error::InvalidArgument {
                what: "zero-sized buffer object",
            });
        }
        if flags.domains().is_empty() {
            return Err(Error::InvalidArgument {
                what: "buffer create without a memory domain",
            });
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument {
                what: "alignment must be a power of two",
            });
        }
        // Creation races with write-locked teardown only through here.
        let _read = self.lock.read_lock(true)?;

        self.accounting.reserve(size)?;
        let handle = self.registry.alloc_handle();
        let map_offset = self
            .next_map_offset
            .fetch_add(size.next_multiple_of(0x1000).max(0x1000), Ordering::Relaxed);
        let bo = BufferObject::new(handle, size, alignment, map_offset, flags);

        let mut gpu_offset = 0;
        if !flags.contains(PlacementFlags::SYSTEM) {
            // Eager placement; unwind accounting on failure.
            match self.validate_reserved(&bo, flags, true, false) {
                Ok((offset, _)) => gpu_offset = offset,
                Err(err) => {
                    self.accounting.release(size);
                    return Err(err);
                }
            }
        }

        self.registry.insert(client, bo);
        MmStats::bump(&self.stats.creations);
        Ok((handle, gpu_offset))
    }

    /// Create a buffer backed by caller-supplied bytes, the hosted stand-in
    /// for user-page backing. The object starts resident in system memory
    /// holding a copy of `bytes`; later validation migrates it like any
    /// other object, contents included.
    pub fn create_user(
        &self,
        client: ClientId,
        bytes: &[u8],
        flags: PlacementFlags,
        alignment: u64,
    ) -> Result<(u32, u64), Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidArgument {
                what: "zero-sized buffer object",
            });
        }
        if flags.domains().is_empty() {
            return Err(Error::InvalidArgument {
                what: "buffer create without a memory domain",
            });
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument {
                what: "alignment must be a power of two",
            });
        }
        let _read = self.lock.read_lock(true)?;

        let size = bytes.len() as u64;
        self.accounting.reserve(size)?;
        let handle = self.registry.alloc_handle();
        let map_offset = self
            .next_map_offset
            .fetch_add(size.next_multiple_of(0x1000).max(0x1000), Ordering::Relaxed);
        // User backing is system memory by definition; placement elsewhere
        // waits for the first validation.
        let bo = BufferObject::new(
            handle,
            size,
            alignment,
            map_offset,
            flags | PlacementFlags::SYSTEM,
        );
        {
            let pages = Pages::new(size);
            pages.write(0, bytes);
            let mut state = bo.state.lock().unwrap();
            state.backing = Backing::System { pages };
        }

        self.registry.insert(client, bo);
        MmStats::bump(&self.stats.creations);
        Ok((handle, 0))
    }

    pub fn lookup(&self, client: ClientId, handle: u32) -> Result<Arc<BufferObject>, Error> {
        self.registry.lookup(client, handle)
    }

    pub fn reference(&self, client: ClientId, handle: u32) -> Result<(), Error> {
        self.registry.reference(client, handle).map(|_| ())
    }

    pub fn unreference(&self, client: ClientId, handle: u32) -> Result<(), Error> {
        if let Some(bo) = self.registry.unreference(client, handle)? {
            self.finalize_bo(&bo);
        }
        Ok(())
    }

    fn finalize_bo(&self, bo: &Arc<BufferObject>) {
        // Never release memory the GPU may still be reading.
        if let Some((fence, types)) = bo.sync_fence() {
            if self.fences.wait(&fence, true, false, types).is_err() {
                // Errored fence: hardware is wedged or reset; memory reuse
                // is gated by the device-level reset path.
            }
        }
        let mut state = bo.state.lock().unwrap();
        if let Backing::Aperture { domain, offset, .. } = state.backing {
            self.manager(domain).free(offset, bo.size());
            self.manager(domain).forget(bo);
        }
        state.backing = Backing::None;
        drop(state);
        self.accounting.release(bo.size());
        MmStats::bump(&self.stats.destructions);
    }

    // ---- reservation helpers ----------------------------------------

    /// Reserve a set of buffers atomically under one ticket.
    ///
    /// Conflicts resolve in ticket order: meeting an older holder drops
    /// every reservation taken so far before blocking, meeting a younger
    /// one keeps them and waits it out (the younger side yields on its own
    /// next conflict). Anyone holding-and-waiting therefore waits only on
    /// strictly younger tickets, so two calls with overlapping sets can
    /// neither deadlock nor livelock each other. Duplicate entries are a
    /// caller bug surfaced as `ProtocolViolation`.
    pub fn reserve_all(&self, bos: &[Arc<BufferObject>]) -> Result<u64, Error> {
        for (i, bo) in bos.iter().enumerate() {
            if bos[..i].iter().any(|other| other.handle() == bo.handle()) {
                return Err(Error::ProtocolViolation {
                    what: "duplicate buffer in validate list",
                });
            }
        }
        let seq = self.next_validate_seq();
        'retry: loop {
            'list: for (i, bo) in bos.iter().enumerate() {
                loop {
                    let holder = match bo.try_reserve_ordered(seq) {
                        Ok(()) => continue 'list,
                        Err(holder) => holder,
                    };
                    if holder < seq {
                        for reserved in &bos[..i] {
                            reserved.unreserve();
                        }
                        bo.wait_unreserved();
                        continue 'retry;
                    }
                    bo.wait_unreserved();
                }
            }
            return Ok(seq);
        }
    }

    pub fn unreserve_all(&self, bos: &[Arc<BufferObject>]) {
        for bo in bos {
            bo.unreserve();
        }
    }

    // ---- validation / migration -------------------------------------

    /// Public validation entry point: reserves the object, migrates if the
    /// requested placement is not already satisfied, unreserves.
    pub fn validate(
        &self,
        client: ClientId,
        handle: u32,
        target: PlacementFlags,
        interruptible: bool,
        no_wait: bool,
    ) -> Result<(u64, PlacementFlags), Error> {
        let _read = self.lock.read_lock(interruptible)?;
        let bo = self.registry.lookup(client, handle)?;
        let seq = self.next_validate_seq();
        while !bo.try_reserve(seq) {
            if no_wait {
                return Err(Error::Busy);
            }
            bo.wait_unreserved();
        }
        let result = self.validate_reserved(&bo, target, interruptible, no_wait);
        bo.unreserve();
        result
    }

    /// Validation with the reservation already held (the execbuf path).
    pub fn validate_reserved(
        &self,
        bo: &Arc<BufferObject>,
        target: PlacementFlags,
        interruptible: bool,
        no_wait: bool,
    ) -> Result<(u64, PlacementFlags), Error> {
        MmStats::bump(&self.stats.validations);
        let target = if target.domains().is_empty() {
            bo.proposed()
        } else {
            target
        };

        // Fast path: current placement already satisfies the request.
        {
            let state = bo.state.lock().unwrap();
            let populated = !matches!(state.backing, Backing::None);
            let domain_ok = target.domains().contains(state.backing.domain().flag());
            let caching_ok = target.caching().is_empty()
                || target.caching().intersects(state.placement.caching());
            if populated && domain_ok && caching_ok {
                return Ok((state.gpu_offset, state.placement));
            }
        }

        // Migration required. CPU grabs pin the contents.
        if bo.cpu_grabbed() {
            if no_wait {
                return Err(Error::Busy);
            }
            bo.wait_cpu_free();
        }
        // The previous operation on this memory must retire first. Eviction
        // of other buffers from the target domain is preferred over waiting
        // (see place_into), so this wait only covers this buffer's own move.
        if let Some((fence, types)) = bo.sync_fence() {
            if !fence.signaled(types) {
                if no_wait {
                    return Err(Error::Busy);
                }
                self.fences.wait(&fence, true, interruptible, types)?;
            }
            bo.clear_sync_fence();
        }

        let (domain, offset) = self.place_into(bo, target, interruptible, no_wait)?;
        self.move_bo(bo, domain, offset, target)?;

        let state = bo.state.lock().unwrap();
        Ok((state.gpu_offset, state.placement))
    }

    /// Pick the cheapest domain satisfying `target` and allocate space in
    /// it, evicting other residents if necessary.
    fn place_into(
        &self,
        bo: &Arc<BufferObject>,
        target: PlacementFlags,
        interruptible: bool,
        no_wait: bool,
    ) -> Result<(MemDomain, u64), Error> {
        let mut any_candidate = false;
        for domain in MemDomain::candidates(target.domains()) {
            any_candidate = true;
            if domain == MemDomain::System {
                return Ok((MemDomain::System, 0));
            }
            let manager = self.manager(domain);
            if let Some(offset) = manager.alloc(bo.size(), bo.alignment()) {
                self.thrashing.store(false, Ordering::Relaxed);
                return Ok((domain, offset));
            }
            if no_wait {
                continue;
            }
            // Evict residents until the allocation fits or candidates run out.
            loop {
                let Some(victim) = manager.evict_candidate() else {
                    break;
                };
                // The candidate was unreserved when selected but may have
                // been claimed since; a busy victim ends this domain's try.
                if !victim.try_reserve(self.next_validate_seq()) {
                    break;
                }
                let evicted = self.evict(&victim, interruptible);
                victim.unreserve();
                evicted?;
                if let Some(offset) = manager.alloc(bo.size(), bo.alignment()) {
                    // Consecutive eviction-backed allocations mean the
                    // domain is churning; the next victims spill straight
                    // out instead of cascading through the apertures.
                    self.thrashing.store(true, Ordering::Relaxed);
                    return Ok((domain, offset));
                }
            }
        }
        if !any_candidate {
            return Err(Error::InvalidArgument {
                what: "validate without a memory domain",
            });
        }
        if no_wait {
            return Err(Error::Busy);
        }
        Err(Error::OutOfMemory {
            requested: bo.size(),
        })
    }

    /// Move `victim` out of its domain, to the first target in the active
    /// eviction priority list with room. System always fits.
    fn evict(&self, victim: &Arc<BufferObject>, interruptible: bool) -> Result<(), Error> {
        let priorities = if self.thrashing.load(Ordering::Relaxed) {
            &self.config.busy_eviction
        } else {
            &self.config.idle_eviction
        };
        debug!(handle = victim.handle(), "evicting buffer");
        // Eviction must not fight the victim's in-flight work.
        if let Some((fence, types)) = victim.sync_fence() {
            self.fences.wait(&fence, true, interruptible, types)?;
            victim.clear_sync_fence();
        }
        let (domain, offset) = priorities
            .iter()
            .find_map(|&domain| {
                if domain == MemDomain::System {
                    return Some((MemDomain::System, 0));
                }
                let offset = self.manager(domain).alloc(victim.size(), victim.alignment())?;
                Some((domain, offset))
            })
            .unwrap_or((MemDomain::System, 0));
        self.move_bo(victim, domain, offset, domain.flag())?;
        MmStats::bump(&self.stats.evictions);
        Ok(())
    }

    /// Perform the data movement and swap the backing. The reservation held
    /// by the caller serializes moves per object, so the state lock is only
    /// taken to read and to commit.
    fn move_bo(
        &self,
        bo: &Arc<BufferObject>,
        new_domain: MemDomain,
        new_offset: u64,
        requested: PlacementFlags,
    ) -> Result<(), Error> {
        let old_backing = bo.state.lock().unwrap().backing.clone();
        let size = bo.size();

        let new_backing = match new_domain {
            MemDomain::System => Backing::System {
                pages: Pages::new(size),
            },
            domain => Backing::Aperture {
                domain,
                offset: new_offset,
                pages: self
                    .manager(domain)
                    .pages()
                    .expect("managed domain has pages"),
            },
        };

        let result = self.copy_backing(&old_backing, &new_backing, size, bo);
        if let Err(err) = result {
            // Failed move: release the just-allocated space, keep old state.
            if let Backing::Aperture { domain, offset, .. } = new_backing {
                self.manager(domain).free(offset, size);
            }
            return Err(err);
        }

        // Commit.
        let caching = if requested.caching().is_empty() {
            let current = bo.placement().caching();
            if current.is_empty() {
                PlacementFlags::CACHED
            } else {
                current
            }
        } else {
            requested.caching()
        };
        let gpu_offset = match new_domain {
            MemDomain::System => 0,
            domain => self.manager(domain).gpu_base() + new_offset,
        };
        {
            let mut state = bo.state.lock().unwrap();
            state.backing = new_backing;
            state.placement = new_domain.flag() | caching;
            state.proposed = requested.domains() | caching;
            state.gpu_offset = gpu_offset;
        }

        // Old aperture space is safe to reuse: blit paths waited on their
        // fence inside copy_backing.
        if let Backing::Aperture { domain, offset, .. } = old_backing {
            self.manager(domain).free(offset, size);
            self.manager(domain).forget(bo);
        }
        if new_domain != MemDomain::System {
            self.manager(new_domain).touch(bo);
        }
        Ok(())
    }

    /// Copy bytes between backings, choosing the move path.
    fn copy_backing(
        &self,
        old: &Backing,
        new: &Backing,
        size: u64,
        bo: &Arc<BufferObject>,
    ) -> Result<(), Error> {
        let old_domain = old.domain();
        let new_domain = new.domain();
        match (old, new) {
            // Nothing to preserve.
            (Backing::None, _) => {
                MmStats::bump(&self.stats.moves_null);
                Ok(())
            }
            // Pure flag change between system placements.
            (Backing::System { .. }, Backing::System { .. }) => {
                MmStats::bump(&self.stats.moves_null);
                Ok(())
            }
            (old, new) => {
                let (src_pages, src_offset) = old.span().expect("populated source");
                let (dst_pages, dst_offset) = new.span().expect("populated destination");

                let vram_system = matches!(
                    (old_domain, new_domain),
                    (MemDomain::Vram, MemDomain::System) | (MemDomain::System, MemDomain::Vram)
                );
                let vram_tt = matches!(
                    (old_domain, new_domain),
                    (MemDomain::Vram, MemDomain::Tt) | (MemDomain::Tt, MemDomain::Vram)
                );

                let blitter = self.blitter.lock().unwrap().clone();
                if vram_system {
                    if let Some(blitter) = blitter {
                        let fence = blitter.queue_copy(BlitRequest {
                            src: PageSpan {
                                pages: src_pages,
                                offset: src_offset,
                            },
                            dst: PageSpan {
                                pages: dst_pages,
                                offset: dst_offset,
                            },
                            len: size,
                        })?;
                        bo.set_sync_fence(&fence, FenceTypes::EXE);
                        // The old range is recycled by our caller; the blit
                        // must have landed first.
                        self.fences.wait(&fence, true, false, FenceTypes::EXE)?;
                        MmStats::bump(&self.stats.moves_blit);
                        return Ok(());
                    }
                }
                if vram_tt {
                    // No direct fast path between the apertures: stage
                    // through system memory.
                    let staging = Pages::new(size);
                    Pages::copy(&src_pages, src_offset, &staging, 0, size);
                    Pages::copy(&staging, 0, &dst_pages, dst_offset, size);
                    MmStats::bump(&self.stats.moves_staged);
                    return Ok(());
                }
                Pages::copy(&src_pages, src_offset, &dst_pages, dst_offset, size);
                MmStats::bump(&self.stats.moves_memcpy);
                Ok(())
            }
        }
    }

    // ---- status / CPU access ----------------------------------------

    /// Adjust proposed-placement flags and re-validate.
    pub fn set_status(
        &self,
        client: ClientId,
        handle: u32,
        set: PlacementFlags,
        clear: PlacementFlags,
    ) -> Result<(u64, PlacementFlags), Error> {
        if set.intersects(clear) {
            return Err(Error::InvalidArgument {
                what: "set and clear flags overlap",
            });
        }
        let bo = {
            let _read = self.lock.read_lock(true)?;
            self.registry.lookup(client, handle)?
        };
        let proposed = (bo.proposed() & !clear) | set;
        if proposed.domains().is_empty() {
            return Err(Error::InvalidArgument {
                what: "status change would leave no memory domain",
            });
        }
        self.validate(client, handle, proposed, true, false)
    }

    /// Exclusive CPU access: waits for (or refuses, with `no_block`) any
    /// outstanding GPU access, then records a nested per-client grab.
    pub fn sync_cpu_grab(
        &self,
        client: ClientId,
        handle: u32,
        no_block: bool,
    ) -> Result<(), Error> {
        let _read = self.lock.read_lock(true)?;
        let bo = self.registry.lookup(client, handle)?;
        if let Some((fence, types)) = bo.sync_fence() {
            if !fence.signaled(types) {
                if no_block {
                    return Err(Error::Busy);
                }
                self.fences.wait(&fence, true, true, types)?;
            }
        }
        // Unpopulated objects become CPU-visible system memory on grab.
        {
            let mut state = bo.state.lock().unwrap();
            if matches!(state.backing, Backing::None) {
                state.backing = Backing::System {
                    pages: Pages::new(bo.size()),
                };
            }
        }
        bo.cpu_grab(client);
        Ok(())
    }

    pub fn sync_cpu_release(&self, client: ClientId, handle: u32) -> Result<(), Error> {
        let bo = self.registry.lookup(client, handle)?;
        bo.cpu_release(client)
    }

    /// Direct CPU write; requires a grab so DMA engines cannot race it.
    pub fn bo_write(
        &self,
        client: ClientId,
        handle: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        let bo = self.registry.lookup(client, handle)?;
        self.check_cpu_access(&bo, client, offset, data.len() as u64)?;
        let (pages, base) = bo.span().expect("grabbed object is populated");
        pages.write(base + offset, data);
        Ok(())
    }

    pub fn bo_read(
        &self,
        client: ClientId,
        handle: u32,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let bo = self.registry.lookup(client, handle)?;
        self.check_cpu_access(&bo, client, offset, buf.len() as u64)?;
        let (pages, base) = bo.span().expect("grabbed object is populated");
        pages.read(base + offset, buf);
        Ok(())
    }

    fn check_cpu_access(
        &self,
        bo: &Arc<BufferObject>,
        client: ClientId,
        offset: u64,
        len: u64,
    ) -> Result<(), Error> {
        let state = bo.state.lock().unwrap();
        if state.cpu_grabs.get(&client).copied().unwrap_or(0) == 0 {
            return Err(Error::ProtocolViolation {
                what: "CPU access without a sync-cpu grab",
            });
        }
        if offset.checked_add(len).map_or(true, |end| end > bo.size()) {
            return Err(Error::InvalidArgument {
                what: "CPU access outside the buffer",
            });
        }
        Ok(())
    }

    /// Block until the last GPU access to the buffer retires.
    pub fn wait_idle(&self, client: ClientId, handle: u32, lazy: bool) -> Result<(), Error> {
        let bo = self.registry.lookup(client, handle)?;
        if let Some((fence, types)) = bo.sync_fence() {
            self.fences.wait(&fence, lazy, true, types)?;
        }
        Ok(())
    }

    /// Whole-device quiescing used around teardown: kill-mode the lock,
    /// then force everything idle.
    pub fn quiesce(&self, signal: i32) {
        warn!("quiescing memory manager");
        self.lock.set_kill(Some(signal));
        self.fences.set_kill(true);
    }

    pub fn resume(&self) {
        self.fences.set_kill(false);
        self.lock.set_kill(None);
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("live_objects", &self.live_objects())
            .field("accounting_used", &self.accounting.used())
            .finish()
    }
}
