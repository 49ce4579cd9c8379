//! Send one request to a worker queue and print the reply.
//!
//! ```text
//! relay-rpc-client '{"test": "hello"}' --queue queue_example --timeout-ms 5000
//! ```

use clap::Parser;
use relay_rpc_client::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    core_config::tracing::init_tracing(&core_config::Environment::from_env());

    relay_rpc_client::run(Args::parse()).await
}
