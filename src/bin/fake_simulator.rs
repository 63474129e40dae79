use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hri_runtime::codec::{self, Decoded, HandshakeFlag, COMMAND_SIZE};
use hri_runtime::config::RuntimeConfig;
use hri_runtime::recorder::{
    maneuver_label, AMPLITUDE_FROM_END, CALIBRATION_TAIL_COLUMNS, INSTANCE_FROM_END,
    MANEUVER_FROM_END, PERIOD_FROM_END,
};

/// Stand-in simulator: sends handshake flags (and calibration samples) to the
/// runtime and prints the commands it gets back
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime configuration, for channel addresses
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Flag sent each tick: a (acquire), c (control) or r (render)
    #[arg(short, long, default_value_t = 'c')]
    flag: char,

    /// Ticks before sending the quit flag
    #[arg(short, long, default_value_t = 100)]
    ticks: u64,

    /// Tick rate in Hz
    #[arg(long, default_value_t = 20)]
    freq: u32,

    /// Maneuver code written into calibration samples
    #[arg(long, default_value_t = 0)]
    maneuver: u32,

    #[arg(long, default_value_t = 10.0)]
    period: f32,

    #[arg(long, default_value_t = 0.5)]
    amplitude: f32,

    #[arg(long, default_value_t = 0)]
    instance: u32,
}

fn calibration_sample(args: &Args, n_columns: usize, tick: u64, t: f32) -> Vec<f32> {
    let mut sample = vec![0.0f32; n_columns];
    let phase = 2.0 * std::f32::consts::PI * t / args.period.max(f32::EPSILON);
    // leading columns carry the reference attitude
    for (i, v) in sample
        .iter_mut()
        .take(n_columns - CALIBRATION_TAIL_COLUMNS)
        .enumerate()
    {
        *v = args.amplitude * (phase + i as f32).sin();
    }
    sample[n_columns - MANEUVER_FROM_END] = args.maneuver as f32;
    sample[n_columns - PERIOD_FROM_END] = args.period;
    sample[n_columns - AMPLITUDE_FROM_END] = args.amplitude;
    sample[n_columns - INSTANCE_FROM_END] = args.instance as f32;
    // time
    sample[n_columns - 1] = tick as f32;
    sample
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    config.validate()?;
    let flag = HandshakeFlag::from_byte(args.flag as u8)
        .context(format!("Unsupported flag '{}'", args.flag))?;

    let flag_addr = config.channels.read_simulator_flag.socket_addr()?;
    let calibration_addr = config.channels.read_simulator_calibration.socket_addr()?;
    let command_addr = config.channels.write_command.socket_addr()?;

    let commands = UdpSocket::bind(command_addr)
        .await
        .context(format!("Failed to bind command socket on {}", command_addr))?;
    let sender = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Failed to bind sending socket")?;
    info!("✓ Listening for commands on {}", command_addr);
    info!(
        "✓ Sending {:?} to {} for {} ticks at {} Hz (maneuver {})",
        flag,
        flag_addr,
        args.ticks,
        args.freq,
        maneuver_label(args.maneuver as f64)
    );

    let n_columns = config.calibration_columns.len();
    let dt = Duration::from_secs_f64(1.0 / args.freq.max(1) as f64);
    let mut interval = tokio::time::interval(dt);
    let mut buf = vec![0u8; 2048];

    for tick in 0..args.ticks {
        interval.tick().await;

        if flag == HandshakeFlag::Acquire {
            let sample = calibration_sample(&args, n_columns, tick, tick as f32 * dt.as_secs_f32());
            sender
                .send_to(&codec::encode_f32_vec(&sample), calibration_addr)
                .await?;
        }
        sender.send_to(&[flag.as_byte()], flag_addr).await?;

        // drain whatever the runtime answered since the last tick
        while let Ok((len, _)) = commands.try_recv_from(&mut buf) {
            if len == COMMAND_SIZE {
                if let Decoded::Ok(command) = codec::decode_command(&buf[..len]) {
                    println!("{:5} command {:?}", tick, &command.as_slice()[..4]);
                }
            } else {
                println!("{:5} {} byte payload", tick, len);
            }
        }
    }

    sender.send_to(&[HandshakeFlag::Quit.as_byte()], flag_addr).await?;
    info!("✓ Sent quit flag");
    if args.ticks == 0 {
        warn!("No ticks sent");
    }
    Ok(())
}
