//! Single-writer send queue
//!
//! All outbound frames for one connection go through one bounded FIFO channel
//! drained by one task that owns the [`FrameSink`]. Frames therefore reach the
//! transport in submission order and are never interleaved, no matter how many
//! threads submit. When the transport falls behind and the queue is full, new
//! frames are refused rather than buffered. A failed write is reported once through
//! the failure hook and stops the writer; the frame is not resent.

use crate::transport::{FrameSink, OutboundFrame, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default number of frames a connection may have waiting for the transport
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Why a frame was not queued
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Send queue is full")]
    Full,
    #[error("Send queue writer has stopped")]
    Closed,
}

/// What kind of frame a failed write carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Probe,
}

/// A write the transport rejected
#[derive(Debug)]
pub struct SendFailure {
    pub kind: FrameKind,
    pub error: TransportError,
}

/// Counters shared by the queue, the prober and the connection manager
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub probes_sent: AtomicU64,
    pub events_dropped: AtomicU64,
    pub reconnects: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> StreamerStats {
        StreamerStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about streamed data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamerStats {
    /// Number of envelopes written to a transport
    pub frames_sent: u64,
    /// Total envelope bytes written
    pub bytes_sent: u64,
    /// Number of liveness probes written
    pub probes_sent: u64,
    /// Events dropped because the client was not connected or encoding failed
    pub events_dropped: u64,
    /// Number of reconnect attempts scheduled
    pub reconnects: u64,
}

/// Handle for submitting frames to a connection's writer task
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::Sender<OutboundFrame>,
}

impl SendQueue {
    /// Spawn the writer task for `sink`, holding at most `capacity` pending frames.
    ///
    /// `on_failure` runs at most once, from the writer task, when a write fails.
    pub(crate) fn spawn<F>(
        sink: Box<dyn FrameSink>,
        capacity: usize,
        counters: Arc<Counters>,
        on_failure: F,
    ) -> (Self, JoinHandle<()>)
    where
        F: FnOnce(SendFailure) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(sink, rx, counters, on_failure));
        (Self { tx }, handle)
    }

    /// Queue a frame behind everything submitted before it, without waiting
    pub fn submit(&self, frame: OutboundFrame) -> Result<(), SubmitError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// True once the writer task has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_writer<F>(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    counters: Arc<Counters>,
    on_failure: F,
) where
    F: FnOnce(SendFailure) + Send + 'static,
{
    while let Some(frame) = rx.recv().await {
        let kind = match frame {
            OutboundFrame::Text(_) => FrameKind::Data,
            OutboundFrame::Probe(_) => FrameKind::Probe,
            OutboundFrame::Close => {
                if let Err(e) = sink.send(OutboundFrame::Close).await {
                    debug!("Close handshake failed: {}", e);
                }
                break;
            }
        };
        let size = frame.len() as u64;

        match sink.send(frame).await {
            Ok(()) => match kind {
                FrameKind::Data => {
                    counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                    counters.bytes_sent.fetch_add(size, Ordering::Relaxed);
                    trace!("Wrote {} byte frame", size);
                }
                FrameKind::Probe => {
                    counters.probes_sent.fetch_add(1, Ordering::Relaxed);
                    trace!("Wrote liveness probe");
                }
            },
            Err(error) => {
                warn!("Transport rejected {:?} frame: {}", kind, error);
                on_failure(SendFailure { kind, error });
                break;
            }
        }
    }
    debug!("Send queue writer stopped");
}
