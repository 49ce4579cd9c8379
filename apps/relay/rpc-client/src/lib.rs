//! Command-line RPC client for AMQP workers.
//!
//! Publishes a single request with a fresh correlation id and an exclusive
//! reply queue, waits for the matching reply and prints it.

use amqp_worker::{Reply, RpcClient, RpcConfig};
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use core_config::amqp::{DEFAULT_QUEUE, DEFAULT_URL};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_PAYLOAD: &str = r#"{"test": "hello"}"#;

#[derive(Parser, Debug)]
#[command(author, version, about = "Send one request to an AMQP worker and print the reply")]
pub struct Args {
    /// Request body, sent verbatim
    #[arg(default_value = DEFAULT_PAYLOAD)]
    pub payload: String,

    /// Broker URL
    #[arg(long, env = "RABBITMQ_URL", default_value = DEFAULT_URL)]
    pub url: String,

    /// Queue the worker consumes from
    #[arg(long, env = "RABBITMQ_QUEUE", default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// How long to wait for the reply
    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,
}

impl Args {
    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig::new(&self.queue).with_timeout(Duration::from_millis(self.timeout_ms))
    }
}

/// Connect, send the payload, print the reply and close.
///
/// The connection is closed whether or not a reply arrived.
pub async fn run(args: Args) -> Result<()> {
    let correlation_id = Uuid::new_v4().to_string();
    println!("Correlation ID: {correlation_id}");

    let client = RpcClient::connect(&args.url, args.rpc_config())
        .await
        .wrap_err("Failed to connect to RabbitMQ")?;
    info!(queue = %args.queue, "Connected");

    let result = client
        .request(args.payload.into_bytes(), &correlation_id)
        .await;
    client.close().await;

    let reply = result.wrap_err("Request failed")?;
    println!("Reply:\n{}", render(&reply)?);
    Ok(())
}

/// Pretty-printed JSON of a reply.
pub fn render(reply: &Reply) -> Result<String> {
    serde_json::to_string_pretty(reply).wrap_err("Failed to render reply")
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_worker::{HandlerError, ReplyError};
    use serde_json::json;

    #[test]
    fn test_defaults() {
        temp_env::with_vars_unset(["RABBITMQ_URL", "RABBITMQ_QUEUE"], || {
            let args = Args::try_parse_from(["relay-rpc-client"]).unwrap();
            assert_eq!(args.payload, r#"{"test": "hello"}"#);
            assert_eq!(args.url, "amqp://localhost");
            assert_eq!(args.queue, "queue_example");
            assert_eq!(args.timeout_ms, 30_000);

            let config = args.rpc_config();
            assert_eq!(config.queue_name, "queue_example");
            assert_eq!(config.timeout, Duration::from_secs(30));
        });
    }

    #[test]
    fn test_env_and_flags() {
        temp_env::with_vars(
            [
                ("RABBITMQ_URL", Some("amqp://rabbit:5672")),
                ("RABBITMQ_QUEUE", Some("from_env")),
            ],
            || {
                let args = Args::try_parse_from([
                    "relay-rpc-client",
                    "{not json",
                    "--queue",
                    "resize_jobs",
                    "--timeout-ms",
                    "250",
                ])
                .unwrap();
                assert_eq!(args.payload, "{not json");
                assert_eq!(args.url, "amqp://rabbit:5672");
                assert_eq!(args.queue, "resize_jobs");
                assert_eq!(args.rpc_config().timeout, Duration::from_millis(250));
            },
        );
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        assert!(Args::try_parse_from(["relay-rpc-client", "--timeout-ms", "soon"]).is_err());
    }

    #[test]
    fn test_render_success() {
        let rendered = render(&Reply::success(json!({"test": "hello"}))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["data"], json!({"test": "hello"}));
        assert!(rendered.contains('\n'));
    }

    #[test]
    fn test_render_error() {
        let reply = Reply::failure(&HandlerError::with_kind("ValidationError", "bad input"));
        let rendered = render(&reply).unwrap();
        let back = Reply::from_slice(rendered.as_bytes()).unwrap();
        assert_eq!(
            back.error(),
            Some(&ReplyError {
                message: "bad input".to_string(),
                kind: "ValidationError".to_string(),
            })
        );
    }
}
