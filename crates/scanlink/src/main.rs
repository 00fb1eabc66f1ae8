use anyhow::Context;
use scanlink::cli::Args;
use scanlink::settings::Settings;
use scanlink::synthetic::SyntheticScan;
use scanlink::init_tracing;
use scanlink_network::MeshStreamer;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse_args();
    init_tracing(args.verbose);

    let file_settings = match &args.config {
        Some(path) => Settings::load_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::load_from_dir(Path::new("."))
            .context("Failed to load settings from the working directory")?
            .unwrap_or_default(),
    };
    let settings = args.apply(file_settings);
    let url = settings.url_or_default().to_string();

    let streamer = MeshStreamer::new(settings.streamer_config());
    streamer
        .try_connect(&url)
        .with_context(|| format!("Cannot stream to {url}"))?;
    info!("Streaming {} patches to {}", args.patches, url);

    let mut states = streamer.subscribe();
    let state_log = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!("Connection {}", state);
        }
    });

    let mut scan = SyntheticScan::new(args.patches, args.triangles);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.delay_ms.max(1)));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let mut produced = 0u64;
    while args.events == 0 || produced < args.events {
        tokio::select! {
            _ = &mut interrupted => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {
                let Some(event) = scan.next() else { break };
                debug!(
                    "{:?} {} ({} triangles)",
                    event.kind,
                    event.snapshot.id,
                    event.snapshot.face_count()
                );
                streamer.send_event(&event);
                produced += 1;
            }
        }
    }

    streamer.shutdown().await;
    state_log.abort();

    let stats = streamer.stats();
    info!(
        "Produced {} events: {} frames sent ({} bytes), {} dropped, {} probes, {} reconnects",
        produced,
        stats.frames_sent,
        stats.bytes_sent,
        stats.events_dropped,
        stats.probes_sent,
        stats.reconnects
    );
    Ok(())
}
