//! AcSync - Aircraft synchronization over UDP multicast
//!
//! Command line front end running the sender or receiver role.

use std::f64::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use acsync::config::{self, Config};
use acsync::delta::AircraftState;
use acsync::fleet::{Fleet, FleetEvent};
use acsync::model::{ModelKey, ModelRegistry};
use acsync::network::{
    FleetHandler, MulticastConfig, MulticastTransport, Receiver, ReceiverConfig,
    ReceiverEvent, Sender, SenderConfig, SenderEvent,
};
use acsync::protocol::{
    self, package_hash, AircraftDetail, AircraftId, AnimChannel, PositionUpdate, SettingsRecord,
    WireRecord, ANIM_CHANNEL_COUNT, HEADER_SIZE,
};

/// AcSync - Aircraft synchronization over UDP multicast
#[derive(Parser)]
#[command(name = "acsync")]
#[command(author = "AcSync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Share simulated aircraft between networked instances", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a demo fleet to interested receivers
    Send {
        /// Number of demo aircraft
        #[arg(short, long, default_value_t = 5)]
        aircraft: u32,

        /// Display name sent to receivers
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Receive aircraft from senders on the group
    Receive,

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the package hash of each argument
    Hash {
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Send { aircraft, name } => {
            run_sender(config, aircraft, name).await?;
        }
        Commands::Receive => {
            run_receiver(config).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Hash { text } => {
            for t in &text {
                println!("{:#06x}  {}", package_hash(t), t);
            }
        }
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    Ok(())
}

/// Run the sender role with a demo fleet
async fn run_sender(
    mut config: Config,
    aircraft: u32,
    name: Option<String>,
) -> anyhow::Result<()> {
    if let Some(name) = name {
        config.general.name = name;
    }
    config.validate()?;

    let sender_id = config.sender_id();
    let transport = Arc::new(MulticastTransport::bind(&MulticastConfig::from(&config))?);
    let mut sender = Sender::new(SenderConfig::from_config(&config, sender_id), transport);
    let mut event_rx = sender
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("sender events already taken"))?;

    sender.start().await?;
    let handle = sender
        .handle()
        .ok_or_else(|| anyhow::anyhow!("sender not running"))?;

    println!("\n========================================");
    println!("  AcSync Sender Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Sender id: {:#06x}", sender_id);
    println!("  Group: {}:{}", config.network.multicast_group, config.network.port);
    println!("  Aircraft: {}", aircraft);
    println!("========================================");
    println!("\nWaiting for receivers...");
    println!("Press Ctrl+C to stop.\n");

    let demo = DemoFleet::new(aircraft);
    let started = Instant::now();
    let mut frame = tokio::time::interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            _ = frame.tick() => {
                let states = demo.states(started.elapsed().as_secs_f64());
                if handle.update(states).await.is_err() {
                    break;
                }
            }
            Some(event) = event_rx.recv() => {
                match event {
                    SenderEvent::StatusChanged(t) => {
                        println!("Status: {} -> {}", t.from, t.to);
                    }
                    SenderEvent::Sent(stats) => {
                        tracing::debug!(
                            "Sent {} details, {} positions, {} removals in {} datagrams",
                            stats.details,
                            stats.positions,
                            stats.removals,
                            stats.datagrams
                        );
                    }
                    SenderEvent::Stopped { reason } => {
                        tracing::error!("Sender stopped: {}", reason);
                        return Ok(());
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    let _ = handle.clear().await;
    sender.stop().await?;
    tracing::info!("Sender stopped");

    Ok(())
}

/// Run the receiver role and report fleet changes
async fn run_receiver(mut config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let mut registry = ModelRegistry::new();
    for (package, short_id) in DEMO_MODELS {
        registry.register(package, short_id, format!("{}/{}", package, short_id));
    }

    let (fleet_tx, mut fleet_rx) = tokio::sync::mpsc::channel(1024);
    let fleet = Fleet::new(registry, config.timing.sender_timeout());
    let handler = FleetHandler::new(fleet, fleet_tx);

    let sender_id = config.sender_id();
    let transport = Arc::new(MulticastTransport::bind(&MulticastConfig::from(&config))?);
    let mut receiver = Receiver::new(
        ReceiverConfig::from_config(&config, sender_id),
        transport,
        handler,
    );
    let mut event_rx = receiver
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("receiver events already taken"))?;

    receiver.start().await?;

    println!("\n========================================");
    println!("  AcSync Receiver Running");
    println!("========================================");
    println!("  Group: {}:{}", config.network.multicast_group, config.network.port);
    println!("========================================");
    println!("\nWaiting for senders...");
    println!("Press Ctrl+C to stop.\n");

    let mut summary = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            Some(event) = fleet_rx.recv() => {
                match event {
                    FleetEvent::SenderAdded { sender, name } => {
                        println!("+ Sender {} '{}'", sender, name);
                    }
                    FleetEvent::SenderExpired { sender, aircraft } => {
                        println!("- Sender {} lost with {} aircraft", sender, aircraft.len());
                    }
                    FleetEvent::AircraftAdded { sender, id, model } => {
                        tracing::info!("Aircraft {:#x} from {} (model match: {:?})", id, sender, model);
                    }
                    FleetEvent::AircraftRemoved { sender, id } => {
                        tracing::info!("Aircraft {:#x} from {} removed", id, sender);
                    }
                    other => tracing::debug!("{:?}", other),
                }
            }
            Some(event) = event_rx.recv() => {
                match event {
                    ReceiverEvent::StatusChanged(t) => {
                        println!("Status: {} -> {}", t.from, t.to);
                    }
                    ReceiverEvent::Stopped { reason } => {
                        tracing::error!("Receiver stopped: {}", reason);
                        return Ok(());
                    }
                    _ => {}
                }
            }
            _ = summary.tick() => {
                let handler = receiver.handler();
                let handler = handler.lock().await;
                let fleet = handler.fleet();
                for sender in fleet.senders() {
                    println!("  {} '{}': {} aircraft", sender.key, sender.name(), sender.aircraft_count());
                    for ac in sender.iter_aircraft() {
                        println!(
                            "    {:#08x} {:<8} {:>10.5} {:>10.5} {:>8.0} ft hdg {:>5.1}",
                            ac.id(),
                            ac.detail.short_id.as_str(),
                            ac.lat,
                            ac.lon,
                            ac.alt_ft,
                            ac.heading()
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    receiver.stop().await?;
    tracing::info!("Receiver stopped");

    Ok(())
}

/// Models known to the demo sender and receiver
const DEMO_MODELS: [(&str, &str); 3] = [
    ("AcSync Demo", "C172"),
    ("AcSync Demo", "A320"),
    ("AcSync Demo", "B738"),
];

/// Aircraft flying circles around a fixed point
struct DemoFleet {
    count: u32,
    center: (f64, f64),
}

impl DemoFleet {
    /// Circle radius [°]
    const RADIUS: f64 = 0.01;
    /// Seconds per circle
    const PERIOD: f64 = 180.0;

    fn new(count: u32) -> Self {
        Self {
            count,
            center: (47.4647, 8.5492),
        }
    }

    fn states(&self, t: f64) -> Vec<AircraftState> {
        (0..self.count)
            .map(|i| {
                let id: AircraftId = 0x00A0_0000 + i;
                let (package, short_id) = DEMO_MODELS[i as usize % DEMO_MODELS.len()];
                let phase = TAU * (t / Self::PERIOD + f64::from(i) / f64::from(self.count.max(1)));
                let radius = Self::RADIUS * (1.0 + 0.1 * f64::from(i % 10));

                let mut anim = [0.0f32; ANIM_CHANNEL_COUNT];
                anim[AnimChannel::FlapRatio.index()] = 0.2;
                anim[AnimChannel::NavLights.index()] = 1.0;
                anim[AnimChannel::BeaconLights.index()] = 1.0;
                anim[AnimChannel::StrobeLights.index()] = if (t as u64) % 2 == 0 { 1.0 } else { 0.0 };
                anim[AnimChannel::EngineRotationRpm.index()] = 2400.0;

                AircraftState {
                    icao_type: short_id.to_string(),
                    icao_op: "DMO".to_string(),
                    model: ModelKey::new(package, short_id),
                    label: format!("DEMO{}", i + 1),
                    lat: self.center.0 + radius * phase.sin(),
                    lon: self.center.1 + radius * phase.cos(),
                    alt_ft: 3000.0 + 500.0 * f64::from(i),
                    heading: (-phase.to_degrees()).rem_euclid(360.0) as f32,
                    roll: -15.0,
                    anim,
                    ..AircraftState::new(id)
                }
            })
            .collect()
    }
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    println!("AcSync Protocol Information");
    println!("===========================\n");

    println!("Header: {} bytes", HEADER_SIZE);
    println!("Settings record: {} bytes", SettingsRecord::SIZE);
    println!("Aircraft detail record: {} bytes", AircraftDetail::SIZE);
    println!("Position update record: {} bytes", PositionUpdate::SIZE);
    println!("Removal record: {} bytes", AircraftId::SIZE);

    let buffer = config.network.buffer_size;
    let per_datagram = |record: usize| buffer.saturating_sub(HEADER_SIZE) / record;
    println!("\nRecords per {} byte datagram:", buffer);
    println!("  details:   {}", per_datagram(AircraftDetail::SIZE));
    println!("  positions: {}", per_datagram(PositionUpdate::SIZE));
    println!("  removals:  {}", per_datagram(AircraftId::SIZE));

    println!("\nDefault Group: {}", protocol::DEFAULT_MULTICAST_GROUP);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Default TTL: {}", protocol::DEFAULT_TTL);
    println!("Animation channels: {}", ANIM_CHANNEL_COUNT);
}
