//! Streaming client application for live scan meshes
//!
//! Wires settings, command-line overrides and a synthetic mesh source into a
//! [`scanlink_network::MeshStreamer`].

pub mod cli;
pub mod settings;
pub mod synthetic;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber; `RUST_LOG` wins over `verbose`
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}
