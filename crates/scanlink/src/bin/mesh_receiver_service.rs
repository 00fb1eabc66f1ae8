use anyhow::Context;
use clap::Parser;
use scanlink::init_tracing;
use scanlink_network::codec;
use scanlink_network::{Envelope, MeshReceiver, ReceivedEnvelope, ReceiverConfig};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Reference consumer that receives scan mesh envelopes over WebSocket"
)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3001")]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Maximum message size in MB
    #[arg(short, long, default_value = "64")]
    max_size_mb: usize,

    /// Drop every client connection this often, to exercise reconnects
    #[arg(long)]
    drop_every_secs: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn log_envelope(received: &ReceivedEnvelope) {
    let kind = received.envelope.message_type();
    match &received.envelope {
        Envelope::MeshCreate(payload) | Envelope::MeshUpdate(payload) => {
            match codec::decode(payload.clone()) {
                Ok(snapshot) => {
                    let bounds = snapshot
                        .bounds()
                        .map(|b| format!("center {:?}, size {:?}", b.center(), b.size()))
                        .unwrap_or_else(|| "empty".to_string());
                    info!(
                        "[conn {}] {:?} {}: {} vertices, {} triangles, {}",
                        received.connection_id,
                        kind,
                        snapshot.id,
                        snapshot.vertex_count(),
                        snapshot.face_count(),
                        bounds
                    );
                }
                Err(e) => warn!(
                    "[conn {}] {:?} {} has bad geometry: {}",
                    received.connection_id, kind, payload.id, e
                ),
            }
        }
        Envelope::Test(test) => info!(
            "[conn {}] Test message from {}: {:?}",
            received.connection_id, received.source_addr, test.message
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = ReceiverConfig {
        max_message_size: args.max_size_mb * 1024 * 1024,
    };
    let address = format!("{}:{}", args.bind, args.port);
    let receiver = MeshReceiver::bind_with_config(address.as_str(), config)
        .await
        .with_context(|| format!("Failed to listen on {address}"))?;
    let (handle, mut envelopes) = receiver.run().context("Failed to start receiver")?;
    info!("Mesh receiver service listening on {}", handle.url());

    let mut drop_timer = args.drop_every_secs.map(|secs| {
        let period = Duration::from_secs(secs.max(1));
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => {
                info!("Interrupted, shutting down");
                break;
            }
            received = envelopes.recv() => match received {
                Some(received) => log_envelope(&received),
                None => break,
            },
            _ = async {
                match drop_timer.as_mut() {
                    Some(timer) => timer.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                info!("Dropping all client connections");
                handle.drop_connections();
            }
        }
    }

    let stats = handle.stats();
    handle.shutdown().await;
    info!(
        "Accepted {} connections, received {} envelopes ({} bytes), {} probes, {} decode errors",
        stats.connections_accepted,
        stats.frames_received,
        stats.bytes_received,
        stats.probes_received,
        stats.decode_errors
    );
    Ok(())
}
