//! relayrpc command-line peer.
//!
//! ```bash
//! # Serve the built-in methods on a Unix socket
//! relayrpc serve --network unix --address /tmp/relayrpc.sock
//!
//! # Call one of them
//! relayrpc call --network unix --address /tmp/relayrpc.sock echo '{"msg":"hi"}'
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `relayrpc=info`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relayrpc::config::default_socket_path;
use relayrpc::transport::{Endpoint, Listener};
use relayrpc::{ClientConfig, MethodTable, RpcClient, RpcEvent};

#[derive(Parser, Debug)]
#[command(name = "relayrpc", version)]
#[command(about = "Request/response RPC over TCP or Unix domain sockets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen and serve the built-in `echo` and `ping` methods
    Serve {
        #[command(flatten)]
        endpoint: EndpointArgs,
    },
    /// Connect, issue one call, and print the JSON result
    Call {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Method name
        method: String,

        /// JSON params (defaults to null)
        params: Option<String>,

        /// Give up after this many seconds (overrides RELAYRPC_CALL_TIMEOUT_SECS)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct EndpointArgs {
    /// Network type (tcp or unix)
    #[arg(long, default_value = "unix")]
    network: String,

    /// Address to listen on or dial (defaults to the per-user socket path)
    #[arg(long)]
    address: Option<String>,
}

impl EndpointArgs {
    fn endpoint(&self) -> Result<Endpoint> {
        let address = match &self.address {
            Some(address) => address.clone(),
            None => default_socket_path().to_string_lossy().into_owned(),
        };
        Ok(Endpoint::parse(&self.network, &address)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relayrpc=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env();

    match cli.command {
        Command::Serve { endpoint } => serve(endpoint.endpoint()?, config).await,
        Command::Call {
            endpoint,
            method,
            params,
            timeout_secs,
        } => {
            let config = match timeout_secs {
                Some(secs) => config.with_call_timeout(Duration::from_secs(secs)),
                None => config,
            };
            let params: Value = match params {
                Some(text) => serde_json::from_str(&text).context("Params are not valid JSON")?,
                None => Value::Null,
            };
            let result = call(endpoint.endpoint()?, config, &method, params).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

fn builtin_methods() -> MethodTable {
    let methods = MethodTable::new();
    methods.register("echo", |params: Value| async move { Ok::<_, String>(params) });
    methods.register("ping", |_: Value| async move { Ok::<_, String>("pong") });
    methods
}

async fn serve(endpoint: Endpoint, config: ClientConfig) -> Result<()> {
    let listener = Listener::bind(&endpoint)
        .await
        .with_context(|| format!("Failed to listen on {endpoint}"))?;
    let local = listener.local_endpoint()?;
    let methods = Arc::new(builtin_methods());
    tracing::info!(
        endpoint = %local,
        methods = ?methods.names(),
        "Serving relayrpc v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Accepted connections never redial.
    let config = config.without_retry();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::warn!(error = %err, "Accept failed");
                        continue;
                    }
                };
                let peer = RpcClient::with_methods(config.clone(), Arc::clone(&methods));
                let done = CancellationToken::new();
                let closed = done.clone();
                peer.on_event(move |event| {
                    log_event(event);
                    if matches!(event, RpcEvent::Closed(_)) {
                        closed.cancel();
                    }
                });
                peer.attach_stream(stream);

                // The transport only holds the peer weakly; keep it alive until the connection ends.
                tokio::spawn(async move {
                    done.cancelled().await;
                    drop(peer);
                });
            }
        }
    }
}

async fn call(endpoint: Endpoint, config: ClientConfig, method: &str, params: Value) -> Result<Value> {
    let timeout = config.call_timeout;
    let client = RpcClient::new(config.without_retry());
    client.on_event(log_event);
    client.connect_endpoint(endpoint.clone());

    tokio::time::timeout(timeout, client.wait_connected())
        .await
        .with_context(|| format!("Could not connect to {endpoint}"))?;

    let result: Result<Value, _> = client.call(method, &params).await;
    client.close();
    Ok(result?)
}

fn log_event(event: &RpcEvent) {
    match event {
        RpcEvent::Opened(conn) => tracing::debug!(conn = %conn, "Peer connected"),
        RpcEvent::Closed(conn) => tracing::debug!(conn = %conn, "Peer disconnected"),
        RpcEvent::ErrorOccurred { error, .. } => tracing::warn!(error = %error, "Transport error"),
        RpcEvent::RawFrameUnrecognized { conn, frame } => {
            tracing::warn!(conn = %conn, bytes = frame.len(), "Ignoring unrecognized frame")
        }
        RpcEvent::ServeRequested { id, name } => {
            tracing::debug!(call_id = id, method = %name, "Request received")
        }
    }
}
