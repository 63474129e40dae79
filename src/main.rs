use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hri_runtime::config::{ControlStyle, InputDevice, RemoteSource, RuntimeConfig};
use hri_runtime::mapper::ControlMapper;
use hri_runtime::recorder;
use hri_runtime::remote;
use hri_runtime::session::{channels_for, Session, SessionMode};
use hri_runtime::transport::UdpTransport;

/// Human motion to simulator command runtime
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// What the session does with incoming frames
    #[arg(short, long, value_enum, default_value_t = SessionMode::Control)]
    mode: SessionMode,

    /// Calibration mapping artifact (overrides the config)
    #[arg(long)]
    mapping: Option<PathBuf>,

    /// Delete this subject's stored data before starting
    #[arg(long)]
    delete_existing: bool,

    /// Subject name (overrides the config)
    #[arg(short, long)]
    subject: Option<String>,

    /// Input device (overrides the config)
    #[arg(short, long, value_enum)]
    device: Option<InputDevice>,

    /// Control style (overrides the config)
    #[arg(long, value_enum)]
    style: Option<ControlStyle>,

    /// Acquisition instance number (overrides the config)
    #[arg(short, long)]
    instance: Option<u32>,

    /// Stop after this many accepted frames
    #[arg(short, long)]
    n_readings: Option<u64>,

    /// Synthesize input frames instead of reading the device
    #[arg(long)]
    dummy_read: bool,

    /// Pretend the simulator always answers ready
    #[arg(long)]
    simulate_flag: bool,

    /// Use zeroed simulator calibration samples
    #[arg(long)]
    dummy_simulator: bool,
}

impl Args {
    fn load_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(subject) = &self.subject {
            config.subject_name = subject.clone();
        }
        if let Some(device) = self.device {
            config.input_device = device;
        }
        if let Some(style) = self.style {
            config.control_style = style;
        }
        if let Some(instance) = self.instance {
            config.instance = instance;
        }
        if let Some(n) = self.n_readings {
            config.n_readings = Some(n);
        }
        if let Some(mapping) = &self.mapping {
            config.mapping_path = Some(mapping.clone());
        }
        config.dummy_read |= self.dummy_read;
        config.simulate_flag |= self.simulate_flag;
        config.dummy_simulator |= self.dummy_simulator;
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args, config: RuntimeConfig) -> Result<i32> {
    if args.delete_existing {
        recorder::delete_subject_data(&config.subject_folder())?;
    }

    // mapping problems are fatal before any socket is opened
    let mapper = match args.mode {
        SessionMode::Control => {
            let path = config.resolved_mapping_path();
            if config.control_style != ControlStyle::Simple {
                info!("Loading {} mapping from {}", config.control_style.as_str(), path.display());
            }
            let mapper = ControlMapper::from_config(&config, &path)
                .context(format!("Failed to load calibration mapping {}", path.display()))?;
            info!("✓ Control mapper ready ({})", mapper.style().as_str());
            Some(mapper)
        }
        _ => None,
    };

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let channels = channels_for(&config, args.mode);
    let transport = UdpTransport::bind(&config.channels, &channels, config.read_timeout())
        .await
        .context("Failed to open UDP channels")?;

    let gamepad =
        config.input_device == InputDevice::Remote && config.remote_source == RemoteSource::Gamepad;
    let mut session = Session::new(config, args.mode, transport, mapper, shutdown_flag.clone())?;

    let mut reader = None;
    if gamepad {
        let (writer, slot) = remote::remote_slot();
        reader = Some(spawn_remote_reader(writer, shutdown_flag.clone())?);
        session = session.with_remote(slot);
    }

    let outcome = session.run().await;

    shutdown_flag.store(true, Ordering::SeqCst);
    if let Some(handle) = reader {
        if handle.join().is_err() {
            warn!("Remote reader thread panicked");
        }
    }

    let outcome = outcome?;
    for path in &outcome.written {
        info!("✓ Wrote {}", path.display());
    }
    Ok(outcome.status)
}

#[cfg(feature = "gamepad")]
fn spawn_remote_reader(
    writer: remote::RemoteWriter,
    shutdown: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>> {
    remote::spawn_gamepad_reader(writer, shutdown)
}

#[cfg(not(feature = "gamepad"))]
fn spawn_remote_reader(
    _writer: remote::RemoteWriter,
    _shutdown: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>> {
    anyhow::bail!("remote_source is `gamepad` but this build has no `gamepad` feature")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    init_logging(&config.log_level);

    info!(
        "=== HRI Runtime === subject {} | device {} | mode {:?}",
        config.subject_name,
        config.input_device.as_str(),
        args.mode
    );

    match run(args, config).await {
        Ok(0) => Ok(()),
        Ok(status) => std::process::exit(status),
        Err(e) => {
            error!("{:#}", e);
            Err(e)
        }
    }
}
