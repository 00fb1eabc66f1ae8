//! Streams one mesh to a receiver on loopback
//!
//! Run with `cargo run -p scanlink-network --example loopback_stream`.

use scanlink_network::{ConnectionState, MeshReceiver, MeshSnapshot, MeshStreamer, StreamerConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let (receiver, mut envelopes) = MeshReceiver::bind("127.0.0.1:0").await?.run()?;
    println!("Receiver listening on {}", receiver.url());

    let streamer = MeshStreamer::new(StreamerConfig::default().with_greeting("loopback example"));
    streamer.try_connect(&receiver.url())?;

    let mut states = streamer.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await??;
    println!("Connected to receiver");

    let mesh = MeshSnapshot::new("example-patch").with_geometry(
        vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        vec![[0, 1, 2]],
    );
    streamer.try_send_mesh_created(&mesh)?;

    for _ in 0..2 {
        match envelopes.recv().await {
            Some(received) => println!(
                "Received {:?} on connection {} from {}",
                received.envelope.message_type(),
                received.connection_id,
                received.source_addr
            ),
            None => break,
        }
    }

    streamer.shutdown().await;
    receiver.shutdown().await;
    println!("Done");
    Ok(())
}
