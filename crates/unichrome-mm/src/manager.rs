//! Per-domain memory-type managers.
//!
//! Each managed domain (VRAM, the translated AGP aperture, the private fixed
//! pool) owns a range allocator over its GPU-addressable space plus an LRU of
//! resident objects consulted when validation has to evict. The system
//! domain is unmanaged: objects there carry their own pages and no offsets.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use unichrome_types::{MemDomain, PlacementFlags};

use crate::bo::BufferObject;
use crate::pages::Pages;
use crate::range_alloc::RangeAllocator;

/// Static layout of one managed domain.
#[derive(Clone, Copy, Debug)]
pub struct DomainSetup {
    pub size: u64,
    /// GPU address of the domain's first byte.
    pub gpu_base: u64,
}

pub struct MemTypeManager {
    domain: MemDomain,
    gpu_base: u64,
    pages: Option<Arc<Pages>>,
    alloc: Mutex<RangeAllocator>,
    lru: Mutex<VecDeque<Weak<BufferObject>>>,
}

impl MemTypeManager {
    pub fn managed(domain: MemDomain, setup: DomainSetup) -> MemTypeManager {
        MemTypeManager {
            domain,
            gpu_base: setup.gpu_base,
            pages: Some(Pages::new(setup.size)),
            alloc: Mutex::new(RangeAllocator::new(setup.size)),
            lru: Mutex::new(VecDeque::new()),
        }
    }

    pub fn unmanaged(domain: MemDomain) -> MemTypeManager {
        MemTypeManager {
            domain,
            gpu_base: 0,
            pages: None,
            alloc: Mutex::new(RangeAllocator::new(0)),
            lru: Mutex::new(VecDeque::new()),
        }
    }

    pub fn domain(&self) -> MemDomain {
        self.domain
    }

    pub fn is_managed(&self) -> bool {
        self.pages.is_some()
    }

    pub fn gpu_base(&self) -> u64 {
        self.gpu_base
    }

    pub fn pages(&self) -> Option<Arc<Pages>> {
        self.pages.clone()
    }

    pub fn alloc(&self, len: u64, alignment: u64) -> Option<u64> {
        if !self.is_managed() {
            return None;
        }
        self.alloc.lock().unwrap().alloc(len, alignment)
    }

    pub fn free(&self, offset: u64, len: u64) {
        self.alloc.lock().unwrap().free(offset, len);
    }

    pub fn used(&self) -> u64 {
        self.alloc.lock().unwrap().used()
    }

    pub fn size(&self) -> u64 {
        self.alloc.lock().unwrap().size()
    }

    /// Record `bo` as most-recently used in this domain.
    pub fn touch(&self, bo: &Arc<BufferObject>) {
        let mut lru = self.lru.lock().unwrap();
        lru.retain(|weak| {
            weak.upgrade()
                .is_some_and(|existing| existing.handle() != bo.handle())
        });
        lru.push_back(Arc::downgrade(bo));
    }

    pub fn forget(&self, bo: &BufferObject) {
        let mut lru = self.lru.lock().unwrap();
        lru.retain(|weak| {
            weak.upgrade()
                .is_some_and(|existing| existing.handle() != bo.handle())
        });
    }

    /// Least-recently-used object that may legally be evicted right now:
    /// resident here, unreserved, not marked NO_EVICT.
    pub fn evict_candidate(&self) -> Option<Arc<BufferObject>> {
        let lru = self.lru.lock().unwrap();
        lru.iter().find_map(|weak| {
            let bo = weak.upgrade()?;
            if bo.current_domain() != self.domain {
                return None;
            }
            if bo.reserved_ticket().is_some() {
                return None;
            }
            if bo.proposed().contains(PlacementFlags::NO_EVICT) {
                return None;
            }
            Some(bo)
        })
    }
}

impl std::fmt::Debug for MemTypeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTypeManager")
            .field("domain", &self.domain)
            .field("gpu_base", &self.gpu_base)
            .field("size", &self.size())
            .field("used", &self.used())
            .finish()
    }
}
