//! Mesh streaming client
//!
//! [`MeshStreamer`] is a cheap, cloneable handle onto a connection manager task. The
//! public methods never block and never touch the transport: they validate and encode
//! on the caller's thread, then post a request to the manager. The manager is the only
//! owner of the transport, the send queue, the prober and the reconnect bookkeeping.
//!
//! Every `connect`/`disconnect` bumps an epoch while holding the state channel's lock.
//! Timers and in-flight connection attempts carry the epoch they were started under and
//! become no-ops once it has moved on, so a `disconnect` takes effect immediately even
//! if a reconnect timer is about to fire.

use crate::prober::{LivenessProber, DEFAULT_PROBE_INTERVAL};
use crate::protocol::{Protocol, ProtocolError, DEFAULT_MAX_MESSAGE_SIZE};
use crate::reconnect::{ReconnectContext, ReconnectPolicy};
use crate::sender::{
    Counters, FrameKind, SendFailure, SendQueue, StreamerStats, SubmitError,
    DEFAULT_SEND_QUEUE_CAPACITY,
};
use crate::transport::{
    AddressError, Connector, Endpoint, FrameStream, InboundFrame, OutboundFrame, TransportError,
    TransportHandle, WebSocketConnector,
};
use crate::types::{MeshEvent, MeshEventKind, MeshSnapshot};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Errors surfaced by the streaming client
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddressError,
    },

    #[error("Encoding failed: {0}")]
    Encoding(#[from] ProtocolError),

    #[error("Not connected")]
    NotConnected,

    #[error("Transport write failed: {0}")]
    TransportWrite(#[source] TransportError),

    #[error("Transport read failed: {0}")]
    TransportRead(#[source] TransportError),

    #[error("Liveness probe failed: {0}")]
    Probe(#[source] TransportError),

    #[error("Connection manager has stopped")]
    ManagerStopped,
}

/// Lifecycle of the client's single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Configuration for the streaming client
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Time between liveness probes on an open connection
    pub probe_interval: Duration,
    /// Upper bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Backoff between reconnect attempts
    pub reconnect: ReconnectPolicy,
    /// Largest encoded envelope accepted for sending
    pub max_message_size: usize,
    /// Frames that may wait for a slow transport before new ones are dropped
    pub send_queue_capacity: usize,
    /// Text sent as a `test` envelope after every successful connect
    pub greeting: Option<String>,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            greeting: None,
        }
    }
}

impl StreamerConfig {
    /// Set the time between liveness probes
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the upper bound on a single connection attempt
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the backoff between reconnect attempts
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the largest envelope that will be sent
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set how many frames may wait for the transport
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Send `greeting` as a `test` envelope after every connect
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }
}

/// Requests handled by the manager task
enum Control {
    Connect { endpoint: Endpoint, epoch: u64 },
    Disconnect,
    Send(OutboundFrame),
    Opened { ticket: u64, handle: TransportHandle },
    OpenFailed { ticket: u64, error: TransportError },
    Failed { ticket: u64, error: NetworkError },
    Retry { epoch: u64, ticket: u64 },
    Shutdown,
}

/// State visible to both the public handle and the manager task
struct Shared {
    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    counters: Arc<Counters>,
    /// Prober of the open session, stopped by whoever ends the epoch
    prober: Mutex<Option<AbortHandle>>,
}

impl Shared {
    /// Start a new epoch and publish `next`; returns the new epoch.
    ///
    /// The current session's prober is stopped before this returns.
    fn invalidate(&self, next: ConnectionState) -> u64 {
        let mut epoch = 0;
        self.state.send_modify(|state| {
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *state = next;
        });
        if let Some(prober) = self.prober.lock().ok().and_then(|mut slot| slot.take()) {
            prober.abort();
        }
        epoch
    }

    /// Register the prober for a session opened under `epoch`
    fn track_prober(&self, epoch: u64, prober: AbortHandle) {
        let Ok(mut slot) = self.prober.lock() else {
            return;
        };
        // Checked under the lock; `invalidate` bumps the epoch before taking it
        if self.is_current(epoch) {
            if let Some(previous) = slot.replace(prober) {
                previous.abort();
            }
        } else {
            prober.abort();
        }
    }

    /// Publish `next` unless `epoch` has been superseded
    fn publish(&self, epoch: u64, next: ConnectionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            applied = true;
            let changed = *state != next;
            *state = next;
            changed
        });
        applied
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn count_drop(&self) {
        self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner {
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<Shared>,
    protocol: Protocol,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.invalidate(ConnectionState::Disconnected);
        let _ = self.control.send(Control::Shutdown);
    }
}

/// Client that streams mesh events to a single remote consumer.
///
/// Sends are dropped, not buffered, while the client is not connected. After an
/// unexpected disconnect the client reconnects on its own, backing off per
/// [`ReconnectPolicy`], until [`disconnect`](Self::disconnect) is called.
///
/// Must be created inside a tokio runtime. Clones share the same connection.
#[derive(Clone)]
pub struct MeshStreamer {
    inner: Arc<Inner>,
}

impl fmt::Debug for MeshStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshStreamer")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MeshStreamer {
    /// Create a client that speaks WebSocket
    pub fn new(config: StreamerConfig) -> Self {
        Self::with_connector(config, WebSocketConnector::new())
    }

    /// Create a client on top of a custom transport
    pub fn with_connector<C: Connector>(config: StreamerConfig, connector: C) -> Self {
        let (control, mailbox) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state,
            epoch: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
            prober: Mutex::new(None),
        });
        let protocol = Protocol::new().with_max_message_size(config.max_message_size);

        let manager = Manager {
            connector: Arc::new(connector),
            shared: Arc::clone(&shared),
            control: control.clone(),
            protocol: protocol.clone(),
            context: ReconnectContext::default(),
            epoch: 0,
            ticket: 0,
            session: None,
            pending: None,
            config,
        };
        let task = tokio::spawn(manager.run(mailbox));

        Self {
            inner: Arc::new(Inner {
                control,
                shared,
                protocol,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Connect to `address`, replacing any current connection.
    ///
    /// An address that is not a valid `ws://` or `wss://` endpoint is logged and ignored.
    pub fn connect(&self, address: &str) {
        if let Err(e) = self.try_connect(address) {
            warn!("Ignoring connect request: {}", e);
        }
    }

    /// Like [`connect`](Self::connect), but reports why a request was ignored
    pub fn try_connect(&self, address: &str) -> Result<(), NetworkError> {
        let endpoint = Endpoint::parse(address).map_err(|source| NetworkError::InvalidAddress {
            address: address.to_string(),
            source,
        })?;
        if self.inner.control.is_closed() {
            return Err(NetworkError::ManagerStopped);
        }

        let epoch = self.inner.shared.invalidate(ConnectionState::Connecting);
        info!("Connecting to {}", endpoint);
        self.inner
            .control
            .send(Control::Connect { endpoint, epoch })
            .map_err(|_| NetworkError::ManagerStopped)
    }

    /// Close the connection and cancel any pending reconnect.
    ///
    /// The state reads `Disconnected` as soon as this returns.
    pub fn disconnect(&self) {
        self.inner.shared.invalidate(ConnectionState::Disconnected);
        let _ = self.inner.control.send(Control::Disconnect);
        info!("Disconnect requested");
    }

    /// Send a `mesh_create` for a newly discovered patch
    pub fn send_mesh_created(&self, snapshot: &MeshSnapshot) {
        report(self.try_send_mesh_created(snapshot));
    }

    /// Send a `mesh_update` for a revised patch
    pub fn send_mesh_updated(&self, snapshot: &MeshSnapshot) {
        report(self.try_send_mesh_updated(snapshot));
    }

    /// Send a `mesh_create` or `mesh_update` depending on the event kind
    pub fn send_event(&self, event: &MeshEvent) {
        report(self.try_send_mesh(event.kind, &event.snapshot));
    }

    /// Send a diagnostic `test` envelope carrying `message`
    pub fn send_text(&self, message: &str) {
        report(self.try_send_text(message));
    }

    /// Like [`send_mesh_created`](Self::send_mesh_created), but reports drops
    pub fn try_send_mesh_created(&self, snapshot: &MeshSnapshot) -> Result<(), NetworkError> {
        self.try_send_mesh(MeshEventKind::Created, snapshot)
    }

    /// Like [`send_mesh_updated`](Self::send_mesh_updated), but reports drops
    pub fn try_send_mesh_updated(&self, snapshot: &MeshSnapshot) -> Result<(), NetworkError> {
        self.try_send_mesh(MeshEventKind::Updated, snapshot)
    }

    /// Like [`send_text`](Self::send_text), but reports drops
    pub fn try_send_text(&self, message: &str) -> Result<(), NetworkError> {
        self.ensure_connected()?;
        let text = self
            .inner
            .protocol
            .encode_test(message)
            .map_err(|e| self.encoding_failed(e))?;
        self.post(text)
    }

    fn try_send_mesh(
        &self,
        kind: MeshEventKind,
        snapshot: &MeshSnapshot,
    ) -> Result<(), NetworkError> {
        self.ensure_connected()?;
        let text = self
            .inner
            .protocol
            .encode_mesh(kind, snapshot)
            .map_err(|e| self.encoding_failed(e))?;
        self.post(text)
    }

    fn ensure_connected(&self) -> Result<(), NetworkError> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.shared.count_drop();
        debug!("Dropping event while {}", self.state());
        Err(NetworkError::NotConnected)
    }

    fn encoding_failed(&self, error: ProtocolError) -> NetworkError {
        self.inner.shared.count_drop();
        NetworkError::Encoding(error)
    }

    fn post(&self, text: String) -> Result<(), NetworkError> {
        self.inner
            .control
            .send(Control::Send(OutboundFrame::Text(text)))
            .map_err(|_| NetworkError::ManagerStopped)
    }

    /// True iff the state is `Connected`
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.current()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Get statistics about sent data
    pub fn stats(&self) -> StreamerStats {
        self.inner.shared.counters.snapshot()
    }

    /// Disconnect and wait for the manager task to exit.
    ///
    /// Every handle stops working afterwards.
    pub async fn shutdown(&self) {
        self.inner.shared.invalidate(ConnectionState::Disconnected);
        let _ = self.inner.control.send(Control::Shutdown);

        let task = self.inner.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Connection manager task ended abnormally: {}", e);
            }
        }
    }
}

fn report(result: Result<(), NetworkError>) {
    match result {
        Ok(()) | Err(NetworkError::NotConnected) => {}
        Err(e) => warn!("Dropping event: {}", e),
    }
}

/// Tasks bound to one open transport
struct Session {
    queue: SendQueue,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    prober: LivenessProber,
}

impl Session {
    /// Send a close frame behind everything already queued.
    ///
    /// A queue that is full or gone means the link is not draining; it is cut instead.
    fn close(self) {
        self.prober.stop();
        self.reader.abort();
        if self.queue.submit(OutboundFrame::Close).is_err() {
            self.writer.abort();
        }
    }

    fn abort(self) {
        self.prober.stop();
        self.reader.abort();
        self.writer.abort();
    }
}

struct Manager {
    config: StreamerConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
    protocol: Protocol,
    context: ReconnectContext,
    /// Epoch of the connect request being served
    epoch: u64,
    /// Identifies the current attempt, session or timer; bumped whenever one is replaced
    ticket: u64,
    session: Option<Session>,
    /// Connection attempt or reconnect timer in flight
    pending: Option<JoinHandle<()>>,
}

impl Manager {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Control>) {
        debug!("Connection manager started");
        while let Some(message) = mailbox.recv().await {
            match message {
                Control::Connect { endpoint, epoch } => self.on_connect(endpoint, epoch),
                Control::Disconnect => self.on_disconnect(),
                Control::Send(frame) => self.on_send(frame),
                Control::Opened { ticket, handle } => self.on_opened(ticket, handle),
                Control::OpenFailed { ticket, error } => {
                    if ticket == self.ticket {
                        warn!("Connection attempt failed: {}", error);
                        self.on_failure();
                    }
                }
                Control::Failed { ticket, error } => {
                    if ticket == self.ticket {
                        warn!("Connection lost: {}", error);
                        self.on_failure();
                    }
                }
                Control::Retry { epoch, ticket } => self.on_retry(epoch, ticket),
                Control::Shutdown => break,
            }
        }
        self.teardown();
        debug!("Connection manager stopped");
    }

    fn on_connect(&mut self, endpoint: Endpoint, epoch: u64) {
        if !self.shared.is_current(epoch) {
            trace!("Skipping superseded connect to {}", endpoint);
            return;
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.cancel_pending();
        self.epoch = epoch;
        self.context.retarget(endpoint);
        self.start_attempt();
    }

    fn on_disconnect(&mut self) {
        self.ticket += 1;
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.cancel_pending();
        info!("Disconnected");
    }

    fn on_send(&mut self, frame: OutboundFrame) {
        // Frames posted before a disconnect still go out ahead of the close frame
        let Some(session) = &self.session else {
            self.shared.count_drop();
            debug!("Dropping frame, connection went away before dispatch");
            return;
        };
        match session.queue.submit(frame) {
            Ok(()) => {}
            Err(SubmitError::Full) => {
                self.shared.count_drop();
                debug!("Dropping frame, transport is not keeping up");
            }
            Err(SubmitError::Closed) => {
                self.shared.count_drop();
                debug!("Dropping frame, writer has stopped");
            }
        }
    }

    fn start_attempt(&mut self) {
        let Some(endpoint) = self.context.target().cloned() else {
            return;
        };
        self.ticket += 1;
        let ticket = self.ticket;
        let connector = Arc::clone(&self.connector);
        let control = self.control.clone();
        let timeout = self.config.connect_timeout;

        debug!(
            "Opening connection to {} (attempt {})",
            endpoint,
            self.context.attempt_count() + 1
        );
        self.pending = Some(tokio::spawn(async move {
            let message = match tokio::time::timeout(timeout, connector.connect(&endpoint)).await
            {
                Ok(Ok(handle)) => Control::Opened { ticket, handle },
                Ok(Err(error)) => Control::OpenFailed { ticket, error },
                Err(_) => Control::OpenFailed {
                    ticket,
                    error: TransportError::Timeout(timeout),
                },
            };
            let _ = control.send(message);
        }));
    }

    fn on_opened(&mut self, ticket: u64, handle: TransportHandle) {
        if ticket != self.ticket || !self.shared.publish(self.epoch, ConnectionState::Connected) {
            trace!("Discarding stale transport");
            return;
        }
        self.pending = None;
        self.context.reset();
        if let Some(endpoint) = self.context.target() {
            info!("Connected to {}", endpoint);
        }

        let TransportHandle { sink, stream } = handle;

        let control = self.control.clone();
        let (queue, writer) = SendQueue::spawn(
            sink,
            self.config.send_queue_capacity,
            Arc::clone(&self.shared.counters),
            move |failure: SendFailure| {
                let error = match failure.kind {
                    FrameKind::Data => NetworkError::TransportWrite(failure.error),
                    FrameKind::Probe => NetworkError::Probe(failure.error),
                };
                let _ = control.send(Control::Failed { ticket, error });
            },
        );

        let reader = tokio::spawn(read_loop(stream, self.control.clone(), ticket));

        let control = self.control.clone();
        let prober = LivenessProber::start(self.config.probe_interval, queue.clone(), move |e| {
            let _ = control.send(Control::Failed {
                ticket,
                error: NetworkError::Probe(e),
            });
        });

        self.shared.track_prober(self.epoch, prober.abort_handle());

        if let Some(greeting) = &self.config.greeting {
            match self.protocol.encode_test(greeting) {
                Ok(text) => {
                    if let Err(e) = queue.submit(OutboundFrame::Text(text)) {
                        warn!("Could not queue greeting: {}", e);
                    }
                }
                Err(e) => warn!("Could not encode greeting: {}", e),
            }
        }

        self.session = Some(Session {
            queue,
            writer,
            reader,
            prober,
        });
    }

    fn on_failure(&mut self) {
        if let Some(session) = self.session.take() {
            session.abort();
        }
        self.pending = None;
        self.ticket += 1;

        if !self.shared.publish(self.epoch, ConnectionState::Reconnecting) {
            return;
        }
        let delay = self.context.record_failure(&self.config.reconnect);
        self.shared
            .counters
            .reconnects
            .fetch_add(1, Ordering::Relaxed);
        info!(
            "Reconnecting in {:?} (attempt {})",
            delay,
            self.context.attempt_count()
        );

        let epoch = self.epoch;
        let ticket = self.ticket;
        let shared = Arc::clone(&self.shared);
        let control = self.control.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.is_current(epoch) {
                let _ = control.send(Control::Retry { epoch, ticket });
            }
        }));
    }

    fn on_retry(&mut self, epoch: u64, ticket: u64) {
        if ticket != self.ticket
            || epoch != self.epoch
            || self.shared.current() != ConnectionState::Reconnecting
        {
            return;
        }
        if self.shared.publish(epoch, ConnectionState::Connecting) {
            self.start_attempt();
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.cancel_pending();
    }
}

async fn read_loop(
    mut stream: Box<dyn FrameStream>,
    control: mpsc::UnboundedSender<Control>,
    ticket: u64,
) {
    let error = loop {
        match stream.next_frame().await {
            Some(Ok(InboundFrame::Text(text))) => {
                debug!("Consumer sent {} bytes of text", text.len())
            }
            Some(Ok(InboundFrame::Binary(data))) => {
                debug!("Consumer sent {} bytes of binary data", data.len())
            }
            Some(Ok(InboundFrame::Probe(_))) => trace!("Probe from consumer"),
            Some(Ok(InboundFrame::ProbeAck(_))) => trace!("Probe acknowledged"),
            Some(Ok(InboundFrame::Close(reason))) => {
                info!("Consumer closed the connection: {:?}", reason);
                break TransportError::ConnectionClosed;
            }
            Some(Err(e)) => break e,
            None => break TransportError::ConnectionClosed,
        }
    };
    let _ = control.send(Control::Failed {
        ticket,
        error: NetworkError::TransportRead(error),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use crate::testing::{MockConnector, Outcome};
    use tokio::time::{sleep, Instant};

    const ADDRESS: &str = "ws://scanner.local:3001";

    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    async fn wait_for(streamer: &MeshStreamer, state: ConnectionState) {
        let mut rx = streamer.subscribe();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn test_messages(texts: &[String]) -> Vec<String> {
        let protocol = Protocol::new();
        texts
            .iter()
            .filter_map(|text| match protocol.decode(text).unwrap() {
                Envelope::Test(payload) => Some(payload.message),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_backs_off() {
        let connector = MockConnector::refusing();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        assert_eq!(streamer.state(), ConnectionState::Disconnected);

        let start = Instant::now();
        streamer.try_connect(ADDRESS).unwrap();
        assert_eq!(streamer.state(), ConnectionState::Connecting);

        settle().await;
        assert_eq!(streamer.state(), ConnectionState::Reconnecting);
        assert!(!streamer.is_connected());

        sleep(Duration::from_secs(7)).await;
        let times = connector.attempt_times();
        assert_eq!(times.len(), 4);
        let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![1, 2, 4]);
        assert_eq!(times[0], start);

        connector.set_fallback(Outcome::Accept);
        sleep(Duration::from_secs(8)).await;
        assert_eq!(streamer.state(), ConnectionState::Connected);
        assert_eq!(connector.attempt_count(), 5);
        assert_eq!(streamer.stats().reconnects, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_restarts_after_success() {
        let connector = MockConnector::new();
        connector.script([Outcome::Refuse, Outcome::Refuse, Outcome::Refuse]);
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());

        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;
        assert_eq!(connector.attempt_count(), 4);

        sleep(Duration::from_secs(3)).await;
        let broke_at = Instant::now();
        connector.last_link().unwrap().break_read();
        settle().await;
        assert_eq!(streamer.state(), ConnectionState::Reconnecting);

        wait_for(&streamer, ConnectionState::Connected).await;
        let times = connector.attempt_times();
        assert_eq!(times[4] - broke_at, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let connector = MockConnector::refusing();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());

        streamer.connect(ADDRESS);
        settle().await;
        assert_eq!(streamer.state(), ConnectionState::Reconnecting);

        streamer.disconnect();
        assert_eq!(streamer.state(), ConnectionState::Disconnected);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(streamer.state(), ConnectionState::Disconnected);

        streamer.connect(ADDRESS);
        settle().await;
        assert_eq!(connector.attempt_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_during_backoff_discards_old_timer() {
        let connector = MockConnector::refusing();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());

        streamer.connect(ADDRESS);
        sleep(Duration::from_millis(500)).await;
        streamer.disconnect();
        streamer.connect(ADDRESS);
        settle().await;
        assert_eq!(connector.attempt_count(), 2);

        // The first timer would have fired at 1s
        sleep(Duration::from_millis(700)).await;
        assert_eq!(connector.attempt_count(), 2);

        sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.attempt_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_transport() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        streamer.send_text("last words");
        streamer.disconnect();
        settle().await;

        let link = connector.last_link().unwrap();
        assert_eq!(test_messages(&link.texts()), vec!["last words"]);
        assert!(link.closed());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(link.probes(), 0);
        assert_eq!(connector.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_prober_immediately() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;
        assert!(streamer.inner.shared.prober.lock().unwrap().is_some());

        // No yield between these: the manager has not seen the request yet
        streamer.disconnect();
        assert!(streamer.inner.shared.prober.lock().unwrap().is_none());

        sleep(Duration::from_secs(45)).await;
        assert_eq!(connector.last_link().unwrap().probes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_prober_is_not_tracked() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        let shared = &streamer.inner.shared;
        let stale = shared.invalidate(ConnectionState::Connecting);
        shared.invalidate(ConnectionState::Disconnected);

        let task = tokio::spawn(std::future::pending::<()>());
        shared.track_prober(stale, task.abort_handle());
        assert!(shared.prober.lock().unwrap().is_none());
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_dropped_when_not_connected() {
        let connector = MockConnector::refusing();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        let mesh = MeshSnapshot::new("patch-1");

        assert!(matches!(
            streamer.try_send_mesh_created(&mesh),
            Err(NetworkError::NotConnected)
        ));
        streamer.send_mesh_updated(&mesh);

        streamer.connect(ADDRESS);
        settle().await;
        assert_eq!(streamer.state(), ConnectionState::Reconnecting);
        assert!(matches!(
            streamer.try_send_text("hello"),
            Err(NetworkError::NotConnected)
        ));

        assert_eq!(streamer.stats().events_dropped, 3);
        assert_eq!(streamer.stats().frames_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_address_is_ignored() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());

        assert!(matches!(
            streamer.try_connect("not a url"),
            Err(NetworkError::InvalidAddress { .. })
        ));
        streamer.connect("http://scanner.local:3001");
        settle().await;

        assert_eq!(streamer.state(), ConnectionState::Disconnected);
        assert_eq!(connector.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_geometry_is_dropped() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        let broken = MeshSnapshot::new("patch-1").with_geometry(vec![[0.0; 3]], vec![[0, 1, 2]]);
        assert!(matches!(
            streamer.try_send_mesh_created(&broken),
            Err(NetworkError::Encoding(_))
        ));
        settle().await;

        assert!(connector.last_link().unwrap().texts().is_empty());
        assert_eq!(streamer.stats().events_dropped, 1);
        assert!(streamer.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_envelope_is_dropped() {
        let connector = MockConnector::new();
        let config = StreamerConfig::default().with_max_message_size(64);
        let streamer = MeshStreamer::with_connector(config, connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        let result = streamer.try_send_text(&"x".repeat(128));
        assert!(matches!(
            result,
            Err(NetworkError::Encoding(ProtocolError::MessageTooLarge { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_keep_producer_order() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let streamer = streamer.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        streamer.try_send_text(&format!("{p}:{i}")).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        settle().await;

        let messages = test_messages(&connector.last_link().unwrap().texts());
        assert_eq!(messages.len(), 200);
        for p in 0..4 {
            let sequence: Vec<u32> = messages
                .iter()
                .filter_map(|m| m.split_once(':'))
                .filter(|(producer, _)| *producer == p.to_string())
                .map(|(_, i)| i.parse().unwrap())
                .collect();
            assert_eq!(sequence, (0..50).collect::<Vec<_>>());
        }
        assert_eq!(streamer.stats().frames_sent, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_beyond_capacity_is_dropped() {
        let connector = MockConnector::new();
        let config = StreamerConfig::default().with_send_queue_capacity(4);
        let streamer = MeshStreamer::with_connector(config, connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        // The writer only drains once the manager yields, so the burst overfills the queue
        for i in 0..10 {
            streamer.try_send_text(&format!("frame-{i}")).unwrap();
        }
        settle().await;

        let messages = test_messages(&connector.last_link().unwrap().texts());
        assert_eq!(messages, vec!["frame-0", "frame-1", "frame-2", "frame-3"]);
        let stats = streamer.stats();
        assert_eq!(stats.frames_sent, 4);
        assert_eq!(stats.events_dropped, 6);
        assert_eq!(streamer.state(), ConnectionState::Connected);

        streamer.send_text("later");
        settle().await;
        assert_eq!(streamer.stats().frames_sent, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mesh_events_encoded_in_order() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        let mesh = MeshSnapshot::new("patch-7")
            .with_geometry(vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], vec![[0, 1, 2]])
            .with_timestamp(12.5);
        streamer.send_event(&MeshEvent::created(mesh.clone()));
        streamer.send_mesh_updated(&mesh.with_timestamp(13.0));
        settle().await;

        let protocol = Protocol::new();
        let envelopes: Vec<Envelope> = connector
            .last_link()
            .unwrap()
            .texts()
            .iter()
            .map(|t| protocol.decode(t).unwrap())
            .collect();
        assert_eq!(envelopes.len(), 2);
        assert!(matches!(&envelopes[0], Envelope::MeshCreate(p) if p.timestamp == 12.5));
        assert!(matches!(&envelopes[1], Envelope::MeshUpdate(p) if p.timestamp == 13.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_while_connected() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        sleep(Duration::from_secs(31)).await;
        assert_eq!(connector.last_link().unwrap().probes(), 2);
        assert_eq!(streamer.stats().probes_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reconnects() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        connector.last_link().unwrap().break_write();
        sleep(Duration::from_millis(15_500)).await;
        assert_eq!(streamer.state(), ConnectionState::Reconnecting);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(streamer.state(), ConnectionState::Connected);
        assert_eq!(connector.links().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_reconnects() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        connector.last_link().unwrap().break_write();
        streamer.try_send_text("into the void").unwrap();
        settle().await;

        assert_eq!(streamer.state(), ConnectionState::Reconnecting);
        assert_eq!(streamer.stats().frames_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_reconnects() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        let link = connector.last_link().unwrap();
        link.inject(InboundFrame::Text("ack".into()));
        settle().await;
        assert!(streamer.is_connected());

        link.inject(InboundFrame::Close(Some("going away".into())));
        settle().await;
        assert_eq!(streamer.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let connector = MockConnector::new();
        connector.script([Outcome::Hang]);
        let config = StreamerConfig::default().with_connect_timeout(Duration::from_secs(5));
        let streamer = MeshStreamer::with_connector(config, connector.clone());

        streamer.connect(ADDRESS);
        sleep(Duration::from_millis(5_500)).await;
        assert_eq!(streamer.state(), ConnectionState::Reconnecting);

        wait_for(&streamer, ConnectionState::Connected).await;
        let times = connector.attempt_times();
        assert_eq!(times[1] - times[0], Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_sent_on_every_connect() {
        let connector = MockConnector::new();
        let config = StreamerConfig::default().with_greeting("Hello from scanner");
        let streamer = MeshStreamer::with_connector(config, connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;
        settle().await;

        connector.last_link().unwrap().break_read();
        settle().await;
        wait_for(&streamer, ConnectionState::Connected).await;
        settle().await;

        for link in connector.links() {
            assert_eq!(test_messages(&link.texts()), vec!["Hello from scanner"]);
        }
        assert_eq!(connector.links().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replaces_target() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());

        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;
        streamer.connect("ws://10.0.0.9:3001");
        wait_for(&streamer, ConnectionState::Connected).await;
        settle().await;

        assert_eq!(
            connector.attempted_urls(),
            vec![ADDRESS.to_string(), "ws://10.0.0.9:3001".to_string()]
        );
        assert!(connector.links()[0].closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_transitions() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        let mut rx = streamer.subscribe();

        streamer.connect(ADDRESS);
        rx.changed().await.unwrap();
        assert_ne!(*rx.borrow(), ConnectionState::Disconnected);

        wait_for(&streamer, ConnectionState::Connected).await;
        streamer.disconnect();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_manager() {
        let connector = MockConnector::new();
        let streamer = MeshStreamer::with_connector(StreamerConfig::default(), connector.clone());
        streamer.connect(ADDRESS);
        wait_for(&streamer, ConnectionState::Connected).await;

        streamer.shutdown().await;
        settle().await;
        assert_eq!(streamer.state(), ConnectionState::Disconnected);
        assert!(connector.last_link().unwrap().closed());
        assert!(matches!(
            streamer.try_connect(ADDRESS),
            Err(NetworkError::ManagerStopped)
        ));
    }
}
