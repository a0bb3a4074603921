use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use trainerlink::bluez::BluezCentral;
use trainerlink::{CommandInput, DeviceManager, SessionConfig, SessionEvent};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "trainerlink")]
#[command(about = "Connect to a smart trainer or sensor and stream its telemetry")]
struct Args {
    /// Bluetooth MAC address of the device (format: AA:BB:CC:DD:EE:FF).
    /// Without it the first device advertising a supported service is used.
    #[arg(long, value_name = "MAC_ADDRESS")]
    device: Option<String>,

    /// How long to scan for a device, in seconds
    #[arg(long, default_value = "30")]
    scan_timeout: u64,

    /// How long to wait for a command response, in milliseconds
    #[arg(long, default_value = "3000")]
    command_timeout: u64,

    /// Do not take control of a fitness machine after connecting
    #[arg(long)]
    no_request_control: bool,

    /// Target power in watts to set once connected
    #[arg(long)]
    resistance: Option<f64>,

    /// Command to send once connected (e.g. startOrResume)
    #[arg(long)]
    command: Option<String>,

    /// JSON object with the command's inputs, e.g. '{"operation":"pause"}'
    #[arg(long, default_value = "{}")]
    input: String,

    /// Characteristic the command is written to (16-bit id in hex)
    #[arg(long, default_value = "2ad9")]
    characteristic: String,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration: Option<u64>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

fn print_event(event: &SessionEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to serialise event: {}", e),
        }
        return;
    }

    match event {
        SessionEvent::Discovered {
            device_id,
            name,
            equipment_type,
            ..
        } => println!("Found {} ({}) type '{}'", name, device_id, equipment_type),
        SessionEvent::Telemetry {
            device_id,
            feature,
            value,
            unit,
        } => println!("{} {}: {} {}", device_id, feature, value, unit),
        SessionEvent::CapabilitiesChanged {
            device_id,
            capabilities,
        } => {
            let supported: Vec<_> = capabilities
                .iter()
                .filter(|(_, on)| **on)
                .map(|(feature, _)| feature.as_str())
                .collect();
            println!("{} supports: {}", device_id, supported.join(", "));
        }
        SessionEvent::SearchFailed { reason } => println!("Search failed: {}", reason),
        SessionEvent::CommandSucceeded { device_id, command } => {
            println!("{} {}: ok", device_id, command)
        }
        SessionEvent::CommandFailed {
            device_id,
            command,
            reason,
        } => println!("{} {}: failed ({})", device_id, command, reason),
        SessionEvent::Disconnected { device_id } => println!("{} disconnected", device_id),
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("bluer", log::LevelFilter::Warn)
        .init();

    let args = Args::parse();

    let characteristic = u16::from_str_radix(args.characteristic.trim_start_matches("0x"), 16)
        .map_err(|_| format!("Invalid characteristic id: {}", args.characteristic))?;
    let input: CommandInput = serde_json::from_str(&args.input)?;

    let config = SessionConfig::default()
        .with_scan_timeout(Duration::from_secs(args.scan_timeout))
        .with_command_timeout(Duration::from_millis(args.command_timeout))
        .with_request_control(!args.no_request_control);

    let central = BluezCentral::new(config.scan_timeout, args.device.as_deref()).await?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let manager = DeviceManager::new(Arc::new(central), config, Arc::new(tx));

    let json = args.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event, json);
        }
    });

    let device_id = manager.search().await?;
    info!("Connected to {}", device_id);

    if let Some(watts) = args.resistance {
        if let Err(e) = manager.update_resistance(watts).await {
            warn!("Could not set resistance: {}", e);
        }
    }

    if let Some(command) = &args.command {
        if let Err(e) = manager
            .issue_command(&device_id, characteristic, command, &input)
            .await
        {
            warn!("{} failed: {}", command, e);
        }
    }

    match args.duration {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => {
            info!("Streaming telemetry, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    manager.shutdown().await;
    drop(manager);
    match tokio::time::timeout(Duration::from_secs(1), printer).await {
        Ok(Err(e)) => error!("Event printer failed: {}", e),
        Err(_) => warn!("Some events were not printed"),
        Ok(Ok(())) => {}
    }

    Ok(())
}
