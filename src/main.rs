use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use muster_gateway::api::ApiServer;
use muster_gateway::db::{self, DeviceRepo, EventLogRepo};
use muster_gateway::events::{
    EventForwarder, EventLogForwarder, FanoutForwarder, WebhookForwarder,
};
use muster_gateway::{Broker, Config};

/// Muster - Connection broker for managed mobile devices
#[derive(Parser)]
#[command(name = "muster", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "MUSTER_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List devices known to a running gateway
    Devices {
        /// Gateway base URL
        #[arg(long, env = "MUSTER_SERVER", default_value = "http://127.0.0.1:8820")]
        server: String,
        /// API key for the control endpoints
        #[arg(long, env = "MUSTER_API_KEY")]
        api_key: Option<String>,
    },
    /// Approve a device for command dispatch
    Approve {
        /// Device ID
        device_id: String,
        /// Gateway base URL
        #[arg(long, env = "MUSTER_SERVER", default_value = "http://127.0.0.1:8820")]
        server: String,
        /// API key for the control endpoints
        #[arg(long, env = "MUSTER_API_KEY")]
        api_key: Option<String>,
    },
    /// Reject a device and close its connection
    Reject {
        /// Device ID
        device_id: String,
        /// Gateway base URL
        #[arg(long, env = "MUSTER_SERVER", default_value = "http://127.0.0.1:8820")]
        server: String,
        /// API key for the control endpoints
        #[arg(long, env = "MUSTER_API_KEY")]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,muster_gateway=info",
        1 => "info,muster_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Handle subcommands
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Devices { server, api_key } => {
                cmd_devices(&server, api_key.as_deref()).await
            }
            Command::Approve {
                device_id,
                server,
                api_key,
            } => cmd_decide(&server, api_key.as_deref(), &device_id, "approve").await,
            Command::Reject {
                device_id,
                server,
                api_key,
            } => cmd_decide(&server, api_key.as_deref(), &device_id, "reject").await,
        };
    }

    // Load configuration
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    tracing::debug!(?config, "loaded configuration");

    tracing::info!(port = config.port, "starting muster gateway");

    let pool = db::init(&config.db_path())?;

    let devices = DeviceRepo::new(pool.clone());
    let forwarder = build_forwarder(&config, &pool);
    let broker = Broker::new(devices, forwarder, config.broker);

    let server = ApiServer::new(&config, pool, broker);

    if config.api_key.is_none() {
        tracing::warn!("no API key configured, control endpoints are open");
    }
    tracing::info!("muster gateway ready");

    // Run until interrupted
    server.run().await?;

    Ok(())
}

/// Assemble the event forwarding chain from configuration
///
/// The event log sink is always present so the REST event endpoints have
/// data; a webhook sink is added when configured.
fn build_forwarder(config: &Config, pool: &db::DbPool) -> Arc<dyn EventForwarder> {
    let mut sinks: Vec<Arc<dyn EventForwarder>> = vec![Arc::new(EventLogForwarder::new(
        EventLogRepo::new(pool.clone()),
    ))];

    if let Some(url) = &config.event_webhook_url {
        tracing::info!(url = %url, "forwarding device events to webhook");
        sinks.push(Arc::new(WebhookForwarder::new(url.clone())));
    }

    Arc::new(FanoutForwarder::new(sinks))
}

/// List devices known to a running gateway
async fn cmd_devices(server: &str, api_key: Option<&str>) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let mut req = client.get(format!("{server}/api/devices"));
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }

    let devices: Vec<serde_json::Value> = req.send().await?.error_for_status()?.json().await?;

    if devices.is_empty() {
        println!("No devices known to the gateway");
        return Ok(());
    }

    println!(
        "{:<28} {:<10} {:<8} {:<20} {}",
        "DEVICE", "STATUS", "ONLINE", "NAME", "MODEL"
    );
    for d in devices {
        println!(
            "{:<28} {:<10} {:<8} {:<20} {}",
            d["id"].as_str().unwrap_or("?"),
            d["status"].as_str().unwrap_or("?"),
            if d["online"].as_bool().unwrap_or(false) {
                "yes"
            } else {
                "no"
            },
            d["name"].as_str().unwrap_or(""),
            d["model"].as_str().unwrap_or(""),
        );
    }

    Ok(())
}

/// Approve or reject a device via a running gateway
async fn cmd_decide(
    server: &str,
    api_key: Option<&str>,
    device_id: &str,
    decision: &str,
) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let mut req = client.post(format!("{server}/api/devices/{device_id}/{decision}"));
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }

    let resp = req.send().await?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        anyhow::bail!("device not found: {device_id}");
    }
    let body: serde_json::Value = resp.error_for_status()?.json().await?;

    println!(
        "Device {device_id} is now {} ({})",
        body["status"].as_str().unwrap_or("?"),
        if body["online"].as_bool().unwrap_or(false) {
            "online"
        } else {
            "offline"
        }
    );

    Ok(())
}
