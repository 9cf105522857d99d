//! Handle/object registry with per-client reference tracking.
//!
//! Guarantees at most one live object per handle value, and that dropping
//! the last outstanding reference synchronously hands the object back to the
//! device for destruction (the registry itself never frees backing memory).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use unichrome_types::Error;

use crate::bo::BufferObject;

/// Identity of an open file / client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn from_raw(raw: u64) -> ClientId {
        ClientId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

impl ClientId {
    /// A fresh, process-unique client identity.
    pub fn next() -> ClientId {
        ClientId(NEXT_CLIENT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct Entry {
    bo: Arc<BufferObject>,
    refs: HashMap<ClientId, u32>,
}

#[derive(Debug)]
pub struct HandleRegistry {
    next_handle: AtomicU32,
    objects: Mutex<HashMap<u32, Entry>>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> HandleRegistry {
        HandleRegistry {
            // Handle 0 is reserved as "no object".
            next_handle: AtomicU32::new(1),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn alloc_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a freshly created object with one reference held by `owner`.
    pub fn insert(&self, owner: ClientId, bo: Arc<BufferObject>) {
        let mut objects = self.objects.lock().unwrap();
        let prev = objects.insert(
            bo.handle(),
            Entry {
                bo,
                refs: HashMap::from([(owner, 1)]),
            },
        );
        debug_assert!(prev.is_none(), "handle reused while live");
    }

    /// Resolve a handle for `client`, which must hold a reference.
    pub fn lookup(&self, client: ClientId, handle: u32) -> Result<Arc<BufferObject>, Error> {
        let objects = self.objects.lock().unwrap();
        let entry = objects.get(&handle).ok_or(Error::NotFound { handle })?;
        if !entry.refs.contains_key(&client) {
            return Err(Error::NotFound { handle });
        }
        Ok(entry.bo.clone())
    }

    /// Add a reference for `client` (which may be seeing the object for the
    /// first time, e.g. handle sharing across connections).
    pub fn reference(&self, client: ClientId, handle: u32) -> Result<Arc<BufferObject>, Error> {
        let mut objects = self.objects.lock().unwrap();
        let entry = objects.get_mut(&handle).ok_or(Error::NotFound { handle })?;
        *entry.refs.entry(client).or_insert(0) += 1;
        Ok(entry.bo.clone())
    }

    /// Drop one of `client`'s references. Returns the object if that was the
    /// last reference anywhere, so the caller can destroy it.
    pub fn unreference(
        &self,
        client: ClientId,
        handle: u32,
    ) -> Result<Option<Arc<BufferObject>>, Error> {
        let mut objects = self.objects.lock().unwrap();
        let entry = objects.get_mut(&handle).ok_or(Error::NotFound { handle })?;
        let count = entry.refs.get_mut(&client).ok_or(Error::NotFound { handle })?;
        *count -= 1;
        if *count == 0 {
            entry.refs.remove(&client);
        }
        if entry.refs.is_empty() {
            let entry = objects.remove(&handle).expect("entry just seen");
            return Ok(Some(entry.bo));
        }
        Ok(None)
    }

    /// Remove every reference `client` holds. Returns `(touched, dead)`:
    /// every object the client referenced, and the subset whose last
    /// reference this was.
    pub fn close_client(
        &self,
        client: ClientId,
    ) -> (Vec<Arc<BufferObject>>, Vec<Arc<BufferObject>>) {
        let mut objects = self.objects.lock().unwrap();
        let mut touched = Vec::new();
        let mut dead_handles = Vec::new();
        for (handle, entry) in objects.iter_mut() {
            if entry.refs.remove(&client).is_some() {
                touched.push(entry.bo.clone());
                if entry.refs.is_empty() {
                    dead_handles.push(*handle);
                }
            }
        }
        let dead = dead_handles
            .into_iter()
            .map(|handle| objects.remove(&handle).expect("entry just seen").bo)
            .collect();
        (touched, dead)
    }

    pub fn live_objects(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}
