use crate::settings::{
    ClientSettings, ProbeSettings, ReconnectSettings, ServerSettings, Settings,
};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "scanlink")]
#[command(
    version,
    about = "Streams synthetic scan meshes to a WebSocket consumer",
    long_about = None
)]
pub struct Args {
    /// Consumer URL, e.g. ws://10.131.229.175:3001
    #[arg(short, long)]
    pub url: Option<String>,

    /// Settings file (defaults to ./scanlink.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of surface patches in the synthetic scan
    #[arg(short = 'p', long, default_value = "4")]
    pub patches: usize,

    /// Triangles per patch
    #[arg(short = 't', long, default_value = "12")]
    pub triangles: usize,

    /// Number of mesh events to send, 0 for no limit
    #[arg(short = 'n', long, default_value = "0")]
    pub events: u64,

    /// Delay between mesh events in milliseconds
    #[arg(short = 'd', long, default_value = "100")]
    pub delay_ms: u64,

    /// Diagnostic message sent after every connect
    #[arg(long)]
    pub greeting: Option<String>,

    /// Seconds between liveness probes
    #[arg(long)]
    pub probe_interval_secs: Option<u64>,

    /// Longest reconnect delay in seconds
    #[arg(long)]
    pub reconnect_cap_secs: Option<u64>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Apply command-line overrides on top of file settings
    pub fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(url) = &self.url {
            settings.server = Some(ServerSettings {
                url: Some(url.clone()),
            });
        }
        if let Some(greeting) = &self.greeting {
            settings
                .client
                .get_or_insert_with(ClientSettings::default)
                .greeting = Some(greeting.clone());
        }
        if let Some(secs) = self.probe_interval_secs {
            settings
                .probe
                .get_or_insert_with(ProbeSettings::default)
                .interval_secs = Some(secs);
        }
        if let Some(secs) = self.reconnect_cap_secs {
            settings
                .reconnect
                .get_or_insert_with(ReconnectSettings::default)
                .cap_secs = Some(secs);
        }
        settings
    }
}
