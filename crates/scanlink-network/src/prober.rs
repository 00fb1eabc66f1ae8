//! Periodic liveness probing of an open connection

use crate::sender::{SendQueue, SubmitError};
use crate::transport::{OutboundFrame, TransportError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Default time between probes
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Submits a probe frame every interval while its connection is open.
///
/// Probes go through the same [`SendQueue`] as data, so they never interleave with a
/// partially written envelope. A probe that finds the queue full is skipped. A write
/// failure on a probe is reported by the queue's failure hook; `on_closed` only fires
/// when the queue itself is already gone.
pub struct LivenessProber {
    handle: JoinHandle<()>,
}

impl LivenessProber {
    /// Start probing; the first probe goes out one full interval from now
    pub fn start<F>(interval: Duration, queue: SendQueue, on_closed: F) -> Self
    where
        F: FnOnce(TransportError) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sequence: u64 = 0;

            loop {
                ticker.tick().await;
                sequence = sequence.wrapping_add(1);
                trace!("Liveness probe {}", sequence);

                match queue.submit(OutboundFrame::Probe(sequence.to_be_bytes().to_vec())) {
                    Ok(()) => {}
                    Err(SubmitError::Full) => {
                        debug!("Send queue full, skipping probe {}", sequence)
                    }
                    Err(SubmitError::Closed) => {
                        debug!("Send queue closed, stopping prober");
                        on_closed(TransportError::ConnectionClosed);
                        break;
                    }
                }
            }
        });
        Self { handle }
    }

    /// Stop probing. Idempotent.
    pub fn stop(&self) {
        self.handle.abort();
    }

    /// Handle that stops the prober from outside the owning task
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for LivenessProber {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
