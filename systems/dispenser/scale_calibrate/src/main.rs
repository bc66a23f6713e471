//! Scale calibration CLI. Connects to the same load-cell TCP transport
//! `feederd` uses, runs a blocking tare or reference-weight calibration,
//! and prints the resulting settings fields so an installer can paste
//! them into the YAML settings file.

use clap::{Parser, Subcommand};
use kibble::components::dispenser::scale::{RawScaleSource, ScaleSampler};
use kibble::error::Error;
use kibble::settings::Settings;
use log::warn;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the settings YAML file. Defaults are used if omitted.
    #[arg(short, long)]
    settings: Option<std::path::PathBuf>,
    /// host:port of the scale bridge transport.
    #[arg(short, long, default_value = "127.0.0.1:9001")]
    bridge_addr: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Zeroes the scale with an empty, settled hopper.
    Tare {
        #[arg(short, long, default_value_t = 10)]
        samples: usize,
    },
    /// Derives a counts-per-gram factor from a known reference weight
    /// placed on the scale.
    Calibrate {
        /// Reference weight currently on the scale, in grams.
        #[arg(short, long)]
        reference_weight_g: f32,
        #[arg(short, long, default_value_t = 20)]
        samples: usize,
    },
}

struct TcpRawScaleSource {
    stream: TcpStream,
    powered: bool,
}

#[async_trait::async_trait]
impl RawScaleSource for TcpRawScaleSource {
    async fn try_read(&mut self) -> Result<Option<i32>, Error> {
        if !self.powered {
            return Ok(None);
        }
        let mut buf = [0u8; 4];
        match self.stream.read_exact(&mut buf).await {
            Ok(()) => Ok(Some(i32::from_le_bytes(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn power_up(&mut self) -> Result<(), Error> {
        self.powered = true;
        Ok(())
    }

    async fn power_down(&mut self) -> Result<(), Error> {
        self.powered = false;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => Settings::from_file(path).unwrap_or_else(|e| {
            warn!("failed to load settings from {}: {e}, using defaults", path.display());
            Settings::default()
        }),
        None => Settings::default(),
    };

    let stream = TcpStream::connect(&args.bridge_addr)
        .await
        .expect("failed to connect to scale bridge transport");
    let source = TcpRawScaleSource { stream, powered: false };
    let mut sampler = ScaleSampler::new(source, &settings);

    match args.command {
        Command::Tare { samples } => {
            let offset = sampler.tare(samples).await.expect("tare failed");
            println!("scale_zero_offset: {offset}");
        }
        Command::Calibrate { reference_weight_g, samples } => {
            let factor = sampler
                .calibrate(reference_weight_g, samples)
                .await
                .expect("calibration failed");
            println!("scale_factor: {factor}");
            println!("scale_zero_offset: {}", sampler.zero_offset());
        }
    }
}
