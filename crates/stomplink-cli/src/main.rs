//! Stomplink CLI
//!
//! `stomplink serve` runs a demo pedal host (relay + tool-call endpoint over
//! an in-memory model); `invoke`, `send` and `listen` are thin remote
//! clients for driving and observing a running host.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use stomplink::config::defaults;
use stomplink::proxy::{self, ControlPort};
use stomplink::{ProxyConfig, RelayConfig, RelayServer, RpcConfig, RpcServer};
use stomplink_core::capability::CapabilityTable;

mod demo;

/// Stomplink - remote control plane for the pedal host
#[derive(Parser, Debug)]
#[command(name = "stomplink")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Output format: text or json
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the demo pedal host: relay server plus tool-call endpoint
    Serve {
        /// Relay WebSocket bind address
        #[arg(long, default_value = defaults::RELAY_BIND)]
        bind: String,

        /// Tool-call endpoint bind address
        #[arg(long, default_value = defaults::RPC_BIND)]
        rpc_bind: String,
    },

    /// Invoke a query on a running host and print the result
    Invoke {
        /// Relay WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:9870/ws")]
        url: String,

        /// Query channel name
        channel: String,

        /// Arguments, each parsed as JSON (bare words become strings)
        args: Vec<String>,
    },

    /// Fire a command at a running host (no response)
    Send {
        /// Relay WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:9870/ws")]
        url: String,

        /// Action channel name
        channel: String,

        /// Payload, parsed as JSON
        data: Option<String>,
    },

    /// Subscribe to an event channel and print events until interrupted
    Listen {
        /// Relay WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:9870/ws")]
        url: String,

        /// Event channel name
        channel: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let json_output = matches!(cli.format, OutputFormat::Json);

    let result = match cli.command {
        Command::Serve { bind, rpc_bind } => serve(bind, rpc_bind).await,
        Command::Invoke { url, channel, args } => invoke(url, channel, args, json_output).await,
        Command::Send { url, channel, data } => send(url, channel, data).await,
        Command::Listen { url, channel } => listen(url, channel, json_output).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(bind: String, rpc_bind: String) -> Result<(), String> {
    let pedal = Arc::new(demo::DemoPedal::new());
    let caps: Arc<dyn CapabilityTable> = Arc::new(pedal.clone().capabilities());

    let relay = Arc::new(RelayServer::new(
        caps.clone(),
        RelayConfig {
            bind,
            initial_state: demo::DemoPedal::initial_state(),
        },
    ));
    let rpc = Arc::new(RpcServer::new(
        caps,
        demo::DemoPedal::tools(),
        RpcConfig {
            bind: rpc_bind,
            ..RpcConfig::default()
        },
    ));

    let relay_addr = relay.start().await.map_err(String::from)?;
    let rpc_addr = rpc.start().await.map_err(String::from)?;

    println!("Relay:             ws://{relay_addr}{}", defaults::WS_PATH);
    println!("Tool endpoint:     http://{rpc_addr}{}", defaults::RPC_PATH);
    println!("Press Ctrl-C to stop.");

    // Forward the demo model's state changes to every attached client.
    let mut events = pedal.subscribe();
    let forwarder = {
        let relay = relay.clone();
        tokio::spawn(async move {
            while let Ok((channel, data)) = events.recv().await {
                relay.broadcast_event(channel, data).await;
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for ctrl-c: {e}"))?;

    tracing::info!("shutting down");
    forwarder.abort();
    rpc.stop().await;
    relay.stop().await;
    Ok(())
}

/// Parse a CLI argument as JSON, falling back to a plain string so
/// `stomplink invoke get-params clean` works without shell quoting.
fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn connect(url: String) -> Arc<stomplink::RemoteProxy> {
    proxy::remote(
        url,
        ProxyConfig {
            // A CLI one-shot should fail fast rather than retry for minutes.
            connect_timeout_ms: 5_000,
            max_reconnect_attempts: 3,
            ..ProxyConfig::default()
        },
    )
}

async fn invoke(
    url: String,
    channel: String,
    args: Vec<String>,
    json_output: bool,
) -> Result<(), String> {
    let remote = connect(url);
    let args = args.iter().map(|a| parse_json_arg(a)).collect();

    let result = remote
        .invoke(&channel, args)
        .await
        .map_err(|e| e.to_string());
    remote.close().await;
    let value = result?;

    if json_output {
        println!("{}", serde_json::to_string(&value).map_err(|e| e.to_string())?);
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?
        );
    }
    Ok(())
}

async fn send(url: String, channel: String, data: Option<String>) -> Result<(), String> {
    let remote = connect(url);
    let data = data.as_deref().map(parse_json_arg).unwrap_or(Value::Null);

    remote.send(&channel, data).await;
    // A send carries no acknowledgement; a trailing invoke on the same
    // socket acts as a flush barrier so the process does not exit with the
    // command still queued. An unknown-channel error from the barrier is the
    // expected outcome.
    let outcome = remote.invoke("flush-barrier", vec![]).await;
    remote.close().await;

    match outcome {
        Ok(_) | Err(stomplink_core::ProxyError::Handler(_)) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

async fn listen(url: String, channel: String, json_output: bool) -> Result<(), String> {
    let remote = connect(url);
    let printed_channel = channel.clone();

    remote.on(
        &channel,
        Arc::new(move |data| {
            if json_output {
                println!(
                    "{}",
                    serde_json::json!({ "channel": printed_channel, "data": data })
                );
            } else {
                println!("[{printed_channel}] {data}");
            }
        }),
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for ctrl-c: {e}"))?;
    remote.close().await;
    Ok(())
}
