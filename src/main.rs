use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lghvac2mqtt::config::Config;
use lghvac2mqtt::engine::{EngineTuning, ProtocolEngine};
use lghvac2mqtt::mqtt::MqttBridge;
use lghvac2mqtt::registry::DeviceRegistry;
use lghvac2mqtt::transport::TransportLink;

/// Bridge between an LG multi-split RS-485 bus (via a TCP serial
/// server) and an MQTT broker.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON options file
    #[arg(long, default_value = "/data/options.json")]
    config: PathBuf,

    /// Override the bus adapter host from the options file
    #[arg(long)]
    host: Option<String>,

    /// Override the bus adapter port from the options file
    #[arg(long)]
    port: Option<u16>,

    /// Probe the whole 0x00-0x0f id range at startup
    #[arg(long)]
    full_scan: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.lg_server_ip = host;
    }
    if let Some(port) = args.port {
        config.lg_server_port = port;
    }
    let full_scan = config.full_scan_on_boot || args.full_scan;
    info!(
        "managing {} room(s) behind {}:{}",
        config.rooms.len(),
        config.lg_server_ip,
        config.lg_server_port
    );

    let link = TransportLink::new(config.lg_server_ip.clone(), config.lg_server_port);
    let registry = DeviceRegistry::from_rooms(&config.rooms);

    let (bridge, eventloop) = MqttBridge::connect(&config.mqtt);
    let engine = Arc::new(ProtocolEngine::new(
        link,
        registry,
        bridge.clone(),
        config.scan_interval(),
        config.temperature_adjust,
        EngineTuning::default(),
    ));

    {
        let bridge = bridge.clone();
        let engine = engine.clone();
        tokio::spawn(async move { bridge.run_event_loop(eventloop, engine).await });
    }

    // Find out who is actually on the bus before the first scheduled scan.
    engine.discovery_scan(full_scan).await;

    {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_command_loop().await });
    }

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            // Twice the inter-device pacing; scan_devices itself skips
            // units whose interval has not elapsed.
            let mut tick = tokio::time::interval(Duration::from_millis(1600));
            loop {
                tick.tick().await;
                engine.scan_devices().await;
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
