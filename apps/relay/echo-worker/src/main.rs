//! Echo Worker Service - Entry Point
//!
//! Consumes the configured queue and replies with each message unchanged.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    relay_echo_worker::run().await
}
