//! The subsystem read/write lock.
//!
//! Counter semantics: a non-negative count is the number of concurrent
//! readers; the sentinel −1 means a writer holds the lock. A pending-writer
//! count gates new readers so writers cannot starve. Kill mode makes every
//! acquisition fail with [`Error::Interrupted`] (recording the configured
//! signal) so no new GPU operation can start while a privileged teardown —
//! a VT switch in the original setting — is in progress.

use std::sync::{Condvar, Mutex};

use unichrome_types::Error;

use crate::registry::ClientId;

#[derive(Debug)]
struct LockState {
    /// Readers (≥ 0) or the writer sentinel (−1).
    count: i32,
    pending_writers: u32,
    /// Client currently holding the write side, for force-release when the
    /// owner dies.
    writer: Option<ClientId>,
    /// Kill mode: `Some(signal)` fails all acquirers immediately.
    kill: Option<i32>,
}

#[derive(Debug)]
pub struct SubsystemLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl Default for SubsystemLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SubsystemLock {
    pub fn new() -> SubsystemLock {
        SubsystemLock {
            state: Mutex::new(LockState {
                count: 0,
                pending_writers: 0,
                writer: None,
                kill: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquire the read side. Blocks while a writer holds the lock or is
    /// pending. `interruptible` only changes how kill mode is reported to
    /// the caller; there is no timeout.
    pub fn read_lock(&self, interruptible: bool) -> Result<ReadGuard<'_>, Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(signal) = state.kill {
                let _ = interruptible;
                return Err(Error::Interrupted {
                    signal: Some(signal),
                });
            }
            if state.pending_writers == 0 && state.count >= 0 {
                state.count += 1;
                return Ok(ReadGuard { lock: self });
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Acquire the write side for `owner`. Raises the pending count first so
    /// new readers stall, then waits for the reader count to drain to zero.
    pub fn write_lock(&self, interruptible: bool, owner: ClientId) -> Result<WriteGuard<'_>, Error> {
        let mut state = self.state.lock().unwrap();
        state.pending_writers += 1;
        loop {
            if let Some(signal) = state.kill {
                let _ = interruptible;
                state.pending_writers -= 1;
                self.cond.notify_all();
                return Err(Error::Interrupted {
                    signal: Some(signal),
                });
            }
            if state.count == 0 {
                state.count = -1;
                state.writer = Some(owner);
                state.pending_writers -= 1;
                return Ok(WriteGuard { lock: self, owner });
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Configure kill mode. While enabled, every acquisition fails with
    /// `Interrupted { signal }` instead of blocking.
    pub fn set_kill(&self, kill: Option<i32>) {
        let mut state = self.state.lock().unwrap();
        state.kill = kill;
        self.cond.notify_all();
    }

    /// Force-release the write side if `client` holds it; part of dead-client
    /// cleanup. Readers owned by the client are released by their guards.
    pub fn release_dead_owner(&self, client: ClientId) {
        let mut state = self.state.lock().unwrap();
        if state.writer == Some(client) {
            debug_assert_eq!(state.count, -1);
            state.count = 0;
            state.writer = None;
            self.cond.notify_all();
        }
    }

    /// Observed reader count / writer sentinel; test and diagnostics aid.
    pub fn raw_count(&self) -> i32 {
        self.state.lock().unwrap().count
    }

    fn read_unlock(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.count > 0);
        state.count -= 1;
        if state.count == 0 {
            self.cond.notify_all();
        }
    }

    fn write_unlock(&self, owner: ClientId) {
        let mut state = self.state.lock().unwrap();
        // The guard may have been force-released by dead-owner cleanup.
        if state.writer == Some(owner) {
            debug_assert_eq!(state.count, -1);
            state.count = 0;
            state.writer = None;
            self.cond.notify_all();
        }
    }
}

/// Scope guard for the read side; the unlock is always reachable.
#[must_use]
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a SubsystemLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Scope guard for the write side.
#[must_use]
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a SubsystemLock,
    owner: ClientId,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock(self.owner);
    }
}
