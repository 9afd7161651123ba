//! Connect to an SSH server and report the session's lifecycle
//!
//! ```text
//! SKIFF_PASSWORD=secret cargo run --example connect -- user@host:22
//! SKIFF_KEY=~/.ssh/id_ed25519 cargo run --example connect -- user@host
//! ```
//!
//! Host keys are trusted on first use and recorded in `./known_hosts`.

use anyhow::{bail, Context as _};
use skiff::{ClientBuilder, HostKeyPolicy, KeyPair, SessionEvent};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some(target) = std::env::args().nth(1) else {
        bail!("usage: connect [user@]host[:port]");
    };

    let mut builder = ClientBuilder::new(&target)
        .with_retries(2)
        .with_timeout(Duration::from_secs(10))
        .with_host_key_policy(HostKeyPolicy::AcceptNew)
        .with_known_hosts("known_hosts");

    if let Ok(password) = std::env::var("SKIFF_PASSWORD") {
        builder = builder.with_password(password);
    }
    if let Ok(key_path) = std::env::var("SKIFF_KEY") {
        let private_key = std::fs::read_to_string(&key_path)
            .with_context(|| format!("Failed to read private key {}", key_path))?;
        let mut key_pair = KeyPair::new(private_key);
        if let Ok(passphrase) = std::env::var("SKIFF_KEY_PASSPHRASE") {
            key_pair = key_pair.with_passphrase(passphrase);
        }
        builder = builder.with_key_pair(key_pair);
    }

    println!("Connecting to {}", builder.target());
    let (client, mut events) = builder.connect().await?;

    let status = client.status().await?;
    println!("Connected from local port {:?}", status.local_port);
    if let Some(identity) = client.host_identity().await? {
        println!("Host key: {} {}", identity.key_type, identity.fingerprint());
    }

    // Watch the session for a few seconds
    let watch = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(watch);
    loop {
        tokio::select! {
            _ = &mut watch => break,
            event = events.recv() => match event {
                Some(SessionEvent::TrafficSample { sent, received }) => {
                    info!("Traffic: {} bytes sent, {} bytes received", sent, received);
                }
                Some(SessionEvent::Disconnected) | None => {
                    println!("Server closed the connection");
                    break;
                }
                Some(event) => println!("Event: {:?}", event),
            },
        }
    }

    client.shutdown().await?;
    println!("Disconnected");
    Ok(())
}
