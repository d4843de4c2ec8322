//! Fixed-rate processing loop.
//!
//! A [`Processor`] is the unit of periodic work; [`CadencedLoop`] drives it on
//! a dedicated named thread at [`TICK_RATE_HZ`]. Scheduling is deadline-based:
//! tick, sleep until the next deadline, repeat. If a tick overruns its budget
//! the next tick runs immediately and the deadline is rebased, so a slow tick
//! never causes a burst of catch-up ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::Result;

/// Ticks per second for every cadenced loop.
pub const TICK_RATE_HZ: u32 = 60;

/// Periodic work driven by a [`CadencedLoop`].
///
/// All three methods run on the loop's thread. `on_start` runs before the
/// first tick, `on_stop` after the last.
pub trait Processor: Send + 'static {
    fn on_start(&mut self) {}
    fn tick(&mut self);
    fn on_stop(&mut self) {}
}

/// A dedicated thread invoking a [`Processor`] at a fixed cadence.
///
/// [`stop`](Self::stop) flips a shared flag and joins, so once it returns no
/// tick is in flight and none will follow.
pub struct CadencedLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl CadencedLoop {
    /// Spawns the loop thread. The first tick fires immediately after
    /// `processor.on_start()`.
    pub fn spawn(name: &str, mut processor: impl Processor) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let period = Duration::from_secs(1) / TICK_RATE_HZ;

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                processor.on_start();
                let mut deadline = Instant::now() + period;
                while !flag.load(Ordering::Relaxed) {
                    processor.tick();
                    let now = Instant::now();
                    if now < deadline {
                        thread::sleep(deadline - now);
                        deadline += period;
                    } else {
                        // Overran the budget: run again right away, rebase
                        // the deadline instead of queueing missed ticks.
                        deadline = now + period;
                    }
                }
                processor.on_stop();
            })?;

        debug!(loop_name = name, "cadenced loop started");
        Ok(Self {
            stop,
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    /// Signals the loop to stop and joins the thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(loop_name = %self.name, "cadenced loop thread panicked");
            } else {
                debug!(loop_name = %self.name, "cadenced loop stopped");
            }
        }
    }
}

impl Drop for CadencedLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
