use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hri_runtime::codec::Decoded;
use hri_runtime::config::{InputDevice, RuntimeConfig};
use hri_runtime::modality::{select_modality, Reading};
use hri_runtime::transport::{Transport, UdpTransport};

/// Listen on one input device channel and print decoded frames
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime configuration, for channel addresses and layouts
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device to probe (overrides the config)
    #[arg(short, long, value_enum)]
    device: Option<InputDevice>,

    /// Stop after this many frames
    #[arg(short, long, default_value_t = 50)]
    frames: u64,

    /// Read timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

fn describe(reading: &Reading) -> String {
    match reading {
        Reading::Joints(joints) => joints
            .iter()
            .map(|j| {
                format!(
                    "#{} pos [{:6.3} {:6.3} {:6.3}] quat [{:5.2} {:5.2} {:5.2} {:5.2}]",
                    j.id,
                    j.position[0],
                    j.position[1],
                    j.position[2],
                    j.orientation[0],
                    j.orientation[1],
                    j.orientation[2],
                    j.orientation[3]
                )
            })
            .collect::<Vec<_>>()
            .join("\n      "),
        Reading::Imus(imus) => imus
            .iter()
            .map(|s| {
                format!(
                    "#{} t={} euler [{:7.2} {:7.2} {:7.2}]",
                    s.id, s.timestamp, s.euler[0], s.euler[1], s.euler[2]
                )
            })
            .collect::<Vec<_>>()
            .join("\n      "),
        Reading::Values(values) => format!("{:?}", values),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(device) = args.device {
        config.input_device = device;
    }
    config.validate()?;

    let input = select_modality(&config);
    let channel = input.channel();
    let mut transport = UdpTransport::bind(
        &config.channels,
        &[channel],
        Duration::from_millis(args.timeout_ms),
    )
    .await
    .context("Failed to open probe channel")?;
    info!(
        "✓ Probing {} frames of {} bytes ({} features)",
        config.input_device.as_str(),
        input.expected_size(),
        input.feature_count()
    );

    let mut received = 0u64;
    while received < args.frames {
        let frame = transport.recv(channel).await?;
        match input.decode(&frame) {
            Decoded::Timeout => warn!("No frame for {} ms", args.timeout_ms),
            Decoded::SizeMismatch { expected, got } => {
                received += 1;
                warn!("Frame of {} bytes, expected {}", got, expected);
            }
            Decoded::Malformed(reason) => {
                received += 1;
                warn!("Malformed frame: {}", reason);
            }
            Decoded::Ok(reading) => {
                received += 1;
                println!("{:5} {}", received, describe(&reading));
            }
        }
    }

    transport.close().await;
    Ok(())
}
