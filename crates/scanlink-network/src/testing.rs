//! In-memory transports for unit tests

use crate::transport::{
    Connector, Endpoint, FrameSink, FrameStream, InboundFrame, OutboundFrame, TransportError,
    TransportHandle,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub(crate) type Written = Arc<Mutex<Vec<OutboundFrame>>>;

/// Sink that records every accepted frame
pub(crate) struct RecordingSink {
    written: Written,
    remaining: Option<usize>,
    fail: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn new() -> (Self, Written) {
        Self::build(None, Arc::new(AtomicBool::new(false)))
    }

    /// Accept `n` frames, then reject every write
    pub fn failing_after(n: usize) -> (Self, Written) {
        Self::build(Some(n), Arc::new(AtomicBool::new(false)))
    }

    fn build(remaining: Option<usize>, fail: Arc<AtomicBool>) -> (Self, Written) {
        let written = Written::default();
        let sink = Self {
            written: Arc::clone(&written),
            remaining,
            fail,
        };
        (sink, written)
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) || self.remaining == Some(0) {
            return Err(TransportError::Other("broken pipe".into()));
        }
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        self.written.lock().unwrap().push(frame);
        Ok(())
    }
}

/// Sink whose writes never complete, like a link that stopped draining
pub(crate) struct StalledSink;

#[async_trait]
impl FrameSink for StalledSink {
    async fn send(&mut self, _frame: OutboundFrame) -> Result<(), TransportError> {
        std::future::pending().await
    }
}

/// Stream fed by the test through a [`MockLink`]
struct ScriptedStream {
    rx: mpsc::UnboundedReceiver<Result<InboundFrame, TransportError>>,
}

#[async_trait]
impl FrameStream for ScriptedStream {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        self.rx.recv().await
    }
}

/// Test-side view of one accepted connection
#[derive(Clone)]
pub(crate) struct MockLink {
    pub written: Written,
    inbound: mpsc::UnboundedSender<Result<InboundFrame, TransportError>>,
    fail: Arc<AtomicBool>,
}

impl MockLink {
    /// Text frames written so far
    pub fn texts(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter_map(|f| match f {
                OutboundFrame::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn probes(&self) -> usize {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|f| matches!(f, OutboundFrame::Probe(_)))
            .count()
    }

    pub fn closed(&self) -> bool {
        self.written
            .lock()
            .unwrap()
            .iter()
            .any(|f| matches!(f, OutboundFrame::Close))
    }

    /// Deliver a frame to the client's receive loop
    pub fn inject(&self, frame: InboundFrame) {
        let _ = self.inbound.send(Ok(frame));
    }

    /// Make the client's receive loop see a read error
    pub fn break_read(&self) {
        let _ = self
            .inbound
            .send(Err(TransportError::Other("connection reset".into())));
    }

    /// Make every further write fail
    pub fn break_write(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Accept,
    Refuse,
    /// Never completes, to exercise connect timeouts
    Hang,
}

struct MockState {
    script: VecDeque<Outcome>,
    fallback: Outcome,
    attempts: Vec<(Instant, String)>,
    links: Vec<MockLink>,
}

/// Connector whose outcomes are scripted by the test
#[derive(Clone)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// Accepts every attempt unless scripted otherwise
    pub fn new() -> Self {
        Self::with_fallback(Outcome::Accept)
    }

    /// Refuses every attempt unless scripted otherwise
    pub fn refusing() -> Self {
        Self::with_fallback(Outcome::Refuse)
    }

    fn with_fallback(fallback: Outcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                fallback,
                attempts: Vec::new(),
                links: Vec::new(),
            })),
        }
    }

    /// Outcomes for the next attempts, consumed in order before the fallback applies
    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state.lock().unwrap().script.extend(outcomes);
    }

    pub fn set_fallback(&self, outcome: Outcome) {
        self.state.lock().unwrap().fallback = outcome;
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .attempts
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn attempted_urls(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .attempts
            .iter()
            .map(|(_, url)| url.clone())
            .collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.state.lock().unwrap().attempts.len()
    }

    pub fn links(&self) -> Vec<MockLink> {
        self.state.lock().unwrap().links.clone()
    }

    pub fn last_link(&self) -> Option<MockLink> {
        self.state.lock().unwrap().links.last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<TransportHandle, TransportError> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state
                .attempts
                .push((Instant::now(), endpoint.url().to_string()));
            let fallback = state.fallback;
            state.script.pop_front().unwrap_or(fallback)
        };

        match outcome {
            Outcome::Refuse => Err(TransportError::Other("connection refused".into())),
            Outcome::Hang => std::future::pending().await,
            Outcome::Accept => {
                let fail = Arc::new(AtomicBool::new(false));
                let (sink, written) = RecordingSink::build(None, Arc::clone(&fail));
                let (inbound, rx) = mpsc::unbounded_channel();
                self.state.lock().unwrap().links.push(MockLink {
                    written,
                    inbound,
                    fail,
                });
                Ok(TransportHandle {
                    sink: Box::new(sink),
                    stream: Box::new(ScriptedStream { rx }),
                })
            }
        }
    }
}
