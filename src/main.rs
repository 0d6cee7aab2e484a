use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use midi_dmx_core::console::Console;
use midi_dmx_core::{Engine, EngineConfig, ShowDocument};

/// Headless lighting engine driven by a MIDI controller, audio input and typed commands.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Show document to load and save
    #[arg(long, default_value = "studio_data.json")]
    show: PathBuf,
    /// Engine settings (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Serial port of a DMX interface
    #[arg(long, conflicts_with = "artnet")]
    serial: Option<String>,
    /// Art-Net node address
    #[arg(long)]
    artnet: Option<String>,
    /// Art-Net universe
    #[arg(long, default_value_t = 0)]
    universe: u16,
    /// Controller input port, exact or partial name
    #[arg(long)]
    midi: Option<String>,
    /// Start audio capture
    #[arg(long)]
    audio: bool,
    /// Input device index, host default when omitted
    #[arg(long)]
    audio_device: Option<usize>,
}

#[tokio::main]
async fn main() -> midi_dmx_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if args.audio_device.is_some() {
        config.audio.device_index = args.audio_device;
    }
    let doc = ShowDocument::load(&args.show)?;
    let engine = Engine::start(config, doc)?;

    if let Some(port) = &args.serial {
        if let Err(e) = engine.connect_serial(port) {
            warn!(%port, %e, "serial output unavailable");
        }
    } else if let Some(host) = &args.artnet {
        if let Err(e) = engine.connect_network(host, args.universe) {
            warn!(%host, %e, "Art-Net output unavailable");
        }
    }
    if let Some(port) = &args.midi {
        match engine.open_controller(port) {
            Ok(name) => info!(port = %name, "controller open"),
            Err(e) => warn!(%port, %e, "controller unavailable"),
        }
    }
    if args.audio {
        if let Err(e) = engine.start_audio() {
            warn!(%e, "audio capture unavailable");
        }
    }

    let mut console = Console::new(&args.show);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match console.run(&engine, &line) {
                    Ok(reply) => info!("{reply}"),
                    Err(e) => warn!("{e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    error!(%e, "stdin closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    if let Err(e) = engine.save(&args.show) {
        error!(path = %args.show.display(), %e, "show document not saved");
    }
    engine.shutdown();
    Ok(())
}
