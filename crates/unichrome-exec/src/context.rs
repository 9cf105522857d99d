//! Per-context state and the id table.
//!
//! A context owns the scratch buffers one in-flight submission works in, so
//! at most one submission may use a context at a time; a second concurrent
//! call is a client bug, failed loudly. Destruction racing an in-flight
//! submission is expressed as an explicit state machine instead of a
//! refcount dance: a busy context moves to `Destroying` and is removed when
//! the submission finishes.
//!
//! Lookups are frequent and short, so the table has its own reader/writer
//! lock rather than sharing the subsystem lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;
use unichrome_types::Error;

use crate::request::Relocation;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    InUse,
    Destroying,
}

/// Scratch space reused across submissions on one context. Relocation
/// records are copied here before being walked, never interpreted from the
/// caller's memory.
#[derive(Debug, Default)]
pub(crate) struct Scratch {
    pub relocs: Vec<Relocation>,
    pub commands: Vec<u8>,
}

#[derive(Debug)]
pub struct ExecContext {
    id: u32,
    phase: Mutex<Phase>,
    pub(crate) scratch: Mutex<Scratch>,
}

impl ExecContext {
    pub fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Default)]
pub struct ContextTable {
    map: RwLock<HashMap<u32, Arc<ExecContext>>>,
    next_id: AtomicU32,
}

impl ContextTable {
    pub fn new() -> ContextTable {
        ContextTable::default()
    }

    pub fn create(&self) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let context = Arc::new(ExecContext {
            id,
            phase: Mutex::new(Phase::Idle),
            scratch: Mutex::new(Scratch::default()),
        });
        self.map.write().unwrap().insert(id, context);
        debug!(id, "context created");
        id
    }

    /// Claim a context for one submission. `Idle → InUse`; a context that
    /// is already in use means the client issued concurrent submissions.
    pub fn begin(&self, id: u32) -> Result<Arc<ExecContext>, Error> {
        let map = self.map.read().unwrap();
        let context = map.get(&id).ok_or(Error::NotFound { handle: id })?;
        let mut phase = context.phase.lock().unwrap();
        match *phase {
            Phase::Idle => {
                *phase = Phase::InUse;
                Ok(context.clone())
            }
            Phase::InUse => Err(Error::ProtocolViolation {
                what: "concurrent execbuf on one context",
            }),
            Phase::Destroying => Err(Error::NotFound { handle: id }),
        }
    }

    /// Release the claim taken by [`Self::begin`]; completes a destruction
    /// that arrived while the submission was in flight.
    pub fn end(&self, context: &Arc<ExecContext>) {
        let destroy = {
            let mut phase = context.phase.lock().unwrap();
            if *phase == Phase::Destroying {
                true
            } else {
                *phase = Phase::Idle;
                false
            }
        };
        if destroy {
            self.map.write().unwrap().remove(&context.id);
            debug!(id = context.id, "deferred context destruction completed");
        }
    }

    /// Destroy a context. If a submission is in flight the removal is
    /// deferred until it finishes; the id stops resolving immediately.
    pub fn destroy(&self, id: u32) -> Result<(), Error> {
        let mut map = self.map.write().unwrap();
        let context = map.get(&id).ok_or(Error::NotFound { handle: id })?;
        let mut phase = context.phase.lock().unwrap();
        match *phase {
            Phase::InUse => {
                *phase = Phase::Destroying;
                Ok(())
            }
            Phase::Idle | Phase::Destroying => {
                drop(phase);
                map.remove(&id);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_a_busy_context_is_rejected() {
        let table = ContextTable::new();
        let id = table.create();
        let ctx = table.begin(id).unwrap();
        assert_eq!(
            table.begin(id).unwrap_err(),
            Error::ProtocolViolation {
                what: "concurrent execbuf on one context"
            }
        );
        table.end(&ctx);
        table.begin(id).unwrap();
    }

    #[test]
    fn destroying_a_busy_context_is_deferred() {
        let table = ContextTable::new();
        let id = table.create();
        let ctx = table.begin(id).unwrap();

        table.destroy(id).unwrap();
        // The id stops resolving at once, but the context survives until
        // the in-flight claim ends.
        assert_eq!(table.begin(id).unwrap_err(), Error::NotFound { handle: id });
        assert_eq!(table.len(), 1);

        table.end(&ctx);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn destroying_an_idle_context_removes_it_immediately() {
        let table = ContextTable::new();
        let id = table.create();
        table.destroy(id).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.destroy(id), Err(Error::NotFound { handle: id }));
    }
}
