//! The single poll task driving fence retirement.
//!
//! Hardware completion interrupts, the deferred-work bottom half, and the
//! software fallback timer all used to funnel into the same poll-and-retire
//! logic; here they collapse into one thread woken by [`FencePoller::notify`]
//! (the hardware-event callback) and by a periodic tick for engines without
//! reliable interrupts.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use unichrome_types::EngineId;

use crate::fence::FenceMachine;

struct PollerShared {
    state: Mutex<PollerState>,
    cond: Condvar,
}

struct PollerState {
    kicked: bool,
    stop: bool,
}

pub struct FencePoller {
    shared: Arc<PollerShared>,
    thread: Option<JoinHandle<()>>,
}

impl FencePoller {
    /// Spawn the poll task. `tick` is the fallback period used when no
    /// hardware event arrives.
    pub fn spawn(machine: Arc<FenceMachine>, tick: Duration) -> FencePoller {
        let shared = Arc::new(PollerShared {
            state: Mutex::new(PollerState {
                kicked: false,
                stop: false,
            }),
            cond: Condvar::new(),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::spawn(move || loop {
                {
                    let mut state = shared.state.lock().unwrap();
                    while !state.kicked && !state.stop {
                        let (next, timeout) =
                            shared.cond.wait_timeout(state, tick).unwrap();
                        state = next;
                        if timeout.timed_out() {
                            break;
                        }
                    }
                    if state.stop {
                        return;
                    }
                    state.kicked = false;
                }
                for engine in EngineId::ALL {
                    machine.poll(engine);
                }
            })
        };

        FencePoller {
            shared,
            thread: Some(thread),
        }
    }

    /// Hardware-event callback: schedule an immediate poll pass.
    pub fn notify(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.kicked = true;
        self.shared.cond.notify_one();
    }
}

impl Drop for FencePoller {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
            self.shared.cond.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
