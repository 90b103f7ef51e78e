//! Echo node: sends every received message straight back to its sender.
//!
//! Run with an optional port argument, then point another node at it:
//!
//! ```text
//! cargo run --example echo -- 2998
//! ```

use chirp::{Chirp, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u16>()?,
        None => 2998,
    };
    let config = Config {
        port,
        disable_encryption: true,
        ..Config::default()
    };
    let (chirp, mut messages) = Chirp::with_config(config).await?;
    println!(
        "echo node {} listening on port {}",
        chirp.identity(),
        chirp.local_port()
    );
    while let Some(received) = messages.recv().await {
        let msg = received.into_message();
        let peer = msg.peer();
        match chirp.send(msg).await {
            Ok(msg) => chirp.release_slot(msg).await,
            Err(err) => {
                eprintln!("echo to {peer} failed: {}", err.code);
                if let Some(msg) = err.msg {
                    chirp.release_slot(msg).await;
                }
            }
        }
    }
    Ok(())
}
