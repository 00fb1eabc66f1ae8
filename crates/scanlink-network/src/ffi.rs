//! FFI bindings for C/C++ integration
//!
//! A native scanning app embeds the streaming client through this API. Each client
//! handle owns a small tokio runtime that drives the connection manager, so callers
//! need no async machinery of their own. All functions may be called from any thread.

use crate::client::{ConnectionState, MeshStreamer, NetworkError, StreamerConfig};
use crate::reconnect::ReconnectPolicy;
use crate::types::MeshSnapshot;
use std::ffi::{c_char, CStr};
use std::os::raw::{c_float, c_int, c_uint};
use std::ptr;
use std::slice;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

/// Opaque handle to a streaming client
pub struct ScanlinkClient {
    runtime: Runtime,
    streamer: MeshStreamer,
}

/// C-compatible mesh snapshot
#[repr(C)]
pub struct CMeshSnapshot {
    /// Null-terminated patch identifier
    pub id: *const c_char,
    /// Pointer to vertex data (x,y,z triplets), may be NULL when `vertex_count` is 0
    pub vertices: *const c_float,
    /// Number of vertices (not floats)
    pub vertex_count: usize,
    /// Pointer to face data (three indices per face), may be NULL when `face_count` is 0
    pub faces: *const c_uint,
    /// Number of faces
    pub face_count: usize,
    /// Row-major 4x4 transform
    pub transform: [c_float; 16],
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

/// Which envelope a mesh is sent as
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CMeshEventKind {
    Created = 0,
    Updated = 1,
}

/// Connection state as seen from C
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl From<ConnectionState> for CConnectionState {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => Self::Disconnected,
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Connected => Self::Connected,
            ConnectionState::Reconnecting => Self::Reconnecting,
        }
    }
}

/// Client configuration
#[repr(C)]
pub struct CStreamerConfig {
    /// Liveness probe interval in milliseconds
    pub probe_interval_ms: c_uint,
    /// Connection attempt timeout in milliseconds
    pub connect_timeout_ms: c_uint,
    /// Exponential base of the reconnect backoff
    pub reconnect_base: c_uint,
    /// Upper bound on a single reconnect delay in milliseconds
    pub reconnect_cap_ms: c_uint,
    /// Largest encoded envelope in bytes
    pub max_message_size: usize,
}

/// Client statistics
#[repr(C)]
#[derive(Debug, Default)]
pub struct CStreamerStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub probes_sent: u64,
    pub events_dropped: u64,
    pub reconnects: u64,
}

/// Create a default client configuration
#[no_mangle]
pub extern "C" fn scanlink_default_config() -> CStreamerConfig {
    let defaults = StreamerConfig::default();
    CStreamerConfig {
        probe_interval_ms: defaults.probe_interval.as_millis() as c_uint,
        connect_timeout_ms: defaults.connect_timeout.as_millis() as c_uint,
        reconnect_base: defaults.reconnect.base(),
        reconnect_cap_ms: defaults.reconnect.cap().as_millis() as c_uint,
        max_message_size: defaults.max_message_size,
    }
}

/// Create a new client with the default configuration
///
/// # Returns
/// - Pointer to ScanlinkClient on success
/// - NULL on failure
#[no_mangle]
pub extern "C" fn scanlink_client_create() -> *mut ScanlinkClient {
    scanlink_client_create_with_config(scanlink_default_config())
}

/// Create a new client with custom configuration
///
/// Zero-valued fields fall back to their defaults.
///
/// # Returns
/// - Pointer to ScanlinkClient on success
/// - NULL on failure
#[no_mangle]
pub extern "C" fn scanlink_client_create_with_config(
    config: CStreamerConfig,
) -> *mut ScanlinkClient {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("scanlink-client")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start client runtime: {}", e);
            return ptr::null_mut();
        }
    };

    let streamer = {
        let _guard = runtime.enter();
        MeshStreamer::new(streamer_config(&config))
    };
    info!("Created streaming client");
    Box::into_raw(Box::new(ScanlinkClient { runtime, streamer }))
}

fn streamer_config(config: &CStreamerConfig) -> StreamerConfig {
    let defaults = StreamerConfig::default();
    let millis = |value: c_uint, fallback: Duration| {
        if value > 0 {
            Duration::from_millis(u64::from(value))
        } else {
            fallback
        }
    };

    let base = if config.reconnect_base > 0 {
        config.reconnect_base
    } else {
        defaults.reconnect.base()
    };
    let cap = millis(config.reconnect_cap_ms, defaults.reconnect.cap());

    StreamerConfig {
        probe_interval: millis(config.probe_interval_ms, defaults.probe_interval),
        connect_timeout: millis(config.connect_timeout_ms, defaults.connect_timeout),
        reconnect: ReconnectPolicy::new(base, cap),
        max_message_size: if config.max_message_size > 0 {
            config.max_message_size
        } else {
            defaults.max_message_size
        },
        greeting: None,
    }
}

/// Start connecting to a `ws://` or `wss://` URL
///
/// The client keeps reconnecting on its own until disconnected.
///
/// # Returns
/// - 0 if the connection attempt was started
/// - -1 on invalid parameters
/// - -2 if the URL is not a valid endpoint
#[no_mangle]
pub unsafe extern "C" fn scanlink_client_connect(
    client: *mut ScanlinkClient,
    url: *const c_char,
) -> c_int {
    if client.is_null() || url.is_null() {
        error!("Null pointer passed to connect");
        return -1;
    }
    let client = &*client;

    let url = match CStr::from_ptr(url).to_str() {
        Ok(s) => s,
        Err(e) => {
            error!("Invalid UTF-8 in url: {}", e);
            return -1;
        }
    };

    match client.streamer.try_connect(url) {
        Ok(()) => 0,
        Err(e) => {
            error!("Cannot connect: {}", e);
            -2
        }
    }
}

/// Close the connection and cancel reconnects
///
/// # Returns
/// - 0 on success
/// - -1 on invalid parameters
#[no_mangle]
pub unsafe extern "C" fn scanlink_client_disconnect(client: *mut ScanlinkClient) -> c_int {
    if client.is_null() {
        error!("Null client pointer");
        return -1;
    }
    (*client).streamer.disconnect();
    0
}

/// Queue a mesh for sending
///
/// # Returns
/// - 0 if the mesh was queued
/// - -1 on invalid parameters or geometry
/// - -2 if the client is not connected (the mesh is dropped)
#[no_mangle]
pub unsafe extern "C" fn scanlink_client_send_mesh(
    client: *mut ScanlinkClient,
    kind: CMeshEventKind,
    mesh: *const CMeshSnapshot,
) -> c_int {
    if client.is_null() || mesh.is_null() {
        error!("Null pointer passed to send_mesh");
        return -1;
    }
    let client = &*client;

    let snapshot = match snapshot_from_c(&*mesh) {
        Some(snapshot) => snapshot,
        None => return -1,
    };
    let result = match kind {
        CMeshEventKind::Created => client.streamer.try_send_mesh_created(&snapshot),
        CMeshEventKind::Updated => client.streamer.try_send_mesh_updated(&snapshot),
    };
    status(result)
}

unsafe fn snapshot_from_c(mesh: &CMeshSnapshot) -> Option<MeshSnapshot> {
    if mesh.id.is_null() {
        error!("Null mesh id");
        return None;
    }
    let id = match CStr::from_ptr(mesh.id).to_str() {
        Ok(s) => s.to_string(),
        Err(e) => {
            error!("Invalid UTF-8 in mesh id: {}", e);
            return None;
        }
    };

    if (mesh.vertex_count > 0 && mesh.vertices.is_null())
        || (mesh.face_count > 0 && mesh.faces.is_null())
    {
        error!("Null geometry pointer with non-zero count");
        return None;
    }

    let (Some(vertex_len), Some(face_len)) = (
        component_len::<f32>(mesh.vertex_count),
        component_len::<u32>(mesh.face_count),
    ) else {
        error!(
            "Geometry counts too large: {} vertices, {} faces",
            mesh.vertex_count, mesh.face_count
        );
        return None;
    };

    let vertices = if mesh.vertex_count > 0 {
        slice::from_raw_parts(mesh.vertices, vertex_len)
            .chunks_exact(3)
            .map(|v| [v[0], v[1], v[2]])
            .collect()
    } else {
        Vec::new()
    };
    let faces = if mesh.face_count > 0 {
        slice::from_raw_parts(mesh.faces, face_len)
            .chunks_exact(3)
            .map(|f| [f[0], f[1], f[2]])
            .collect()
    } else {
        Vec::new()
    };

    Some(
        MeshSnapshot::new(id)
            .with_geometry(vertices, faces)
            .with_transform(mesh.transform)
            .with_timestamp(mesh.timestamp),
    )
}

/// Number of `T`s in `count` triples, if the slice fits in an allocation
fn component_len<T>(count: usize) -> Option<usize> {
    let len = count.checked_mul(3)?;
    let bytes = len.checked_mul(std::mem::size_of::<T>())?;
    (bytes <= isize::MAX as usize).then_some(len)
}

/// Send a diagnostic text message
///
/// # Returns
/// - 0 if the message was queued
/// - -1 on invalid parameters
/// - -2 if the client is not connected
#[no_mangle]
pub unsafe extern "C" fn scanlink_client_send_text(
    client: *mut ScanlinkClient,
    text: *const c_char,
) -> c_int {
    if client.is_null() || text.is_null() {
        error!("Null pointer passed to send_text");
        return -1;
    }
    let text = match CStr::from_ptr(text).to_str() {
        Ok(s) => s,
        Err(e) => {
            error!("Invalid UTF-8 in text: {}", e);
            return -1;
        }
    };
    status((*client).streamer.try_send_text(text))
}

fn status(result: Result<(), NetworkError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(NetworkError::NotConnected) => {
            debug!("Dropped send while not connected");
            -2
        }
        Err(e) => {
            error!("Send rejected: {}", e);
            -1
        }
    }
}

/// Returns 1 if connected, 0 if not, -1 on invalid parameters
#[no_mangle]
pub unsafe extern "C" fn scanlink_client_is_connected(client: *const ScanlinkClient) -> c_int {
    if client.is_null() {
        return -1;
    }
    c_int::from((*client).streamer.is_connected())
}

/// Returns the connection state, or -1 on invalid parameters
#[no_mangle]
pub unsafe extern "C" fn scanlink_client_state(client: *const ScanlinkClient) -> c_int {
    if client.is_null() {
        return -1;
    }
    CConnectionState::from((*client).streamer.state()) as c_int
}

/// Get client statistics
///
/// # Returns
/// - 0 on success
/// - -1 on invalid parameters
#[no_mangle]
pub unsafe extern "C" fn scanlink_client_get_stats(
    client: *const ScanlinkClient,
    stats: *mut CStreamerStats,
) -> c_int {
    if client.is_null() || stats.is_null() {
        error!("Null pointer passed to get_stats");
        return -1;
    }
    let current = (*client).streamer.stats();
    *stats = CStreamerStats {
        frames_sent: current.frames_sent,
        bytes_sent: current.bytes_sent,
        probes_sent: current.probes_sent,
        events_dropped: current.events_dropped,
        reconnects: current.reconnects,
    };
    0
}

/// Disconnect and destroy a client
#[no_mangle]
pub unsafe extern "C" fn scanlink_client_destroy(client: *mut ScanlinkClient) {
    if client.is_null() {
        return;
    }

    info!("Destroying streaming client");
    let client = Box::from_raw(client);
    let ScanlinkClient { runtime, streamer } = *client;
    runtime.block_on(streamer.shutdown());
}

/// Get the library version string
#[no_mangle]
pub extern "C" fn scanlink_network_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
