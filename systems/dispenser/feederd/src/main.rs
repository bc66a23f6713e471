//! Kibble dispenser daemon binary.
//!
//! Wires together the bus bridge, PWM driver, tank registry, scale
//! sampler, device-state hub, safety supervisor and feed dispatcher, then
//! serves a minimal newline-delimited JSON control socket so the daemon is
//! runnable and demonstrable end to end without the HTTP/SSE layer this
//! crate does not implement.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use kibble::components::dispenser::engine::DispensingEngine;
use kibble::components::dispenser::recipes::RecipeStore;
use kibble::components::dispenser::scale::{RawScaleSource, ScaleSampler};
use kibble::components::dispenser::{dispatch, registry::TankRegistry, safety};
use kibble::devices::hardware::bus_bridge::BusBridge;
use kibble::devices::hardware::pwm::SoftPwmDriver;
use kibble::error::Error;
use kibble::messages::control::command::FeedCommand;
use kibble::settings::Settings;
use kibble::state::DeviceStateHub;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the settings YAML file. Defaults are used if omitted.
    #[arg(short, long)]
    settings: Option<PathBuf>,
    /// Directory the triple-redundant recipe store lives in.
    #[arg(short, long, default_value = "recipes")]
    recipes_dir: PathBuf,
    /// host:port of the bus-bridge transport. The real UART bridge is
    /// wired up by the surrounding platform; this binary speaks the same
    /// framing over a TCP socket so it can run against a bridge simulator.
    #[arg(short, long, default_value = "127.0.0.1:9001")]
    bridge_addr: String,
    /// Port the control socket listens on.
    #[arg(short, long, default_value_t = 9000)]
    port: u16,
}

/// Reads raw load-cell counts as a little-endian `i32` over a TCP
/// connection to a scale bridge simulator, the scale-side analog of
/// `bridge_addr` above. `try_read` only attempts a read while the source
/// believes itself powered, matching the real amplifier's behaviour of
/// going quiet while off.
struct TcpRawScaleSource {
    stream: TcpStream,
    powered: bool,
}

#[async_trait]
impl RawScaleSource for TcpRawScaleSource {
    async fn try_read(&mut self) -> Result<Option<i32>, Error> {
        use tokio::io::AsyncReadExt;
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

    let bridge_conn = TcpStream::connect(&args.bridge_addr)
        .await
        .expect("failed to connect to bus bridge transport");
    let bridge = Arc::new(BusBridge::new(bridge_conn));
    let pwm = Arc::new(Mutex::new(SoftPwmDriver::new()));
    let safety_pwm = pwm.clone();
    let registry = Arc::new(Mutex::new(TankRegistry::new(bridge, pwm, host_mac())));

    let scale_conn = TcpStream::connect(&args.bridge_addr)
        .await
        .expect("failed to connect to scale transport");
    let scale_source = TcpRawScaleSource { stream: scale_conn, powered: false };
    let scale = Arc::new(Mutex::new(ScaleSampler::new(scale_source, &settings)));

    let hub = Arc::new(DeviceStateHub::new(settings.lock_acquire_timeout));
    let recipe_store = Arc::new(RecipeStore::new(args.recipes_dir));
    let engine = Arc::new(DispensingEngine::new(settings.clone()));

    let refresh_registry = registry.clone();
    let refresh_hub = hub.clone();
    tokio::spawn(async move {
        use kibble::devices::hardware::bus_bridge::BUS_COUNT;

        const QUIET_INTERVAL: Duration = Duration::from_millis(1000);
        const ACTIVE_INTERVAL: Duration = Duration::from_millis(3000);

        let mut last_known = [0u64; BUS_COUNT];
        let mut interval = QUIET_INTERVAL;

        loop {
            tokio::time::sleep(interval).await;

            // A feed cycle holds the registry lock for its whole duration
            // and needs servo mode throughout; the scanner yields rather
            // than block for it, matching the "must yield if mode is
            // servo" rule instead of stalling a feed to force bus-power
            // mode.
            let mut guard = match refresh_registry.try_lock() {
                Ok(guard) => guard,
                Err(_) => continue,
            };

            let outcome: Result<bool, Error> = async {
                let presence = {
                    guard.set_servo_power(false).await?;
                    let presence = guard.poll_presence().await?;
                    guard.set_servo_power(true).await?;
                    presence
                };

                let mut changed_mask = 0u8;
                for i in 0..BUS_COUNT {
                    if presence[i] != last_known[i] {
                        changed_mask |= 1 << i;
                    }
                }
                last_known = presence;
                if changed_mask == 0 {
                    return Ok(false);
                }

                guard.set_servo_power(false).await?;
                let changed = guard.refresh(changed_mask).await?;
                guard.set_servo_power(true).await?;
                Ok(changed)
            }
            .await;

            match outcome {
                Ok(true) => {
                    let tanks = guard.known_tanks().to_vec();
                    drop(guard);
                    if let Err(e) = refresh_hub.set_tanks(tanks).await {
                        error!("failed to publish tank registry update: {e}");
                    }
                    interval = ACTIVE_INTERVAL;
                }
                Ok(false) => {
                    interval = QUIET_INTERVAL;
                }
                Err(e) => {
                    warn!("tank registry refresh failed: {e}");
                    interval = QUIET_INTERVAL;
                }
            }
        }
    });

    let scale_hub = hub.clone();
    let scale_task = scale.clone();
    tokio::spawn(async move {
        loop {
            let reading = {
                let mut guard = scale_task.lock().await;
                guard.sample_and_publish().await
            };
            match reading {
                Ok(reading) => {
                    if let Err(e) = scale_hub
                        .set_weight(reading.weight_g, reading.raw, reading.stable, reading.responding)
                        .await
                    {
                        error!("failed to publish scale reading: {e}");
                    }
                }
                Err(e) => {
                    error!("scale sampler task ended with an error: {e}");
                    return;
                }
            }
        }
    });

    let safety_hub = hub.clone();
    tokio::spawn(async move {
        if let Err(e) = safety::run(&safety_hub, safety_pwm).await {
            error!("safety supervisor task ended with an error: {e}");
        }
    });

    let dispatch_hub = hub.clone();
    let dispatch_registry = registry.clone();
    let dispatch_scale = scale.clone();
    let dispatch_engine = engine.clone();
    let dispatch_recipes = recipe_store.clone();
    tokio::spawn(async move {
        let result = dispatch::run(&dispatch_hub, &dispatch_registry, &dispatch_scale, &dispatch_engine, &dispatch_recipes).await;
        if let Err(e) = result {
            error!("feed dispatcher task ended with an error: {e}");
        }
    });

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .expect("failed to bind control socket");
    info!("feederd control socket listening on port {}", args.port);
    loop {
        let (socket, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("control socket accept failed: {e}");
                continue;
            }
        };
        let conn_hub = hub.clone();
        tokio::spawn(handle_connection(socket, conn_hub));
    }
}

/// Placeholder host MAC stamped into `last_base_mac` on tank EEPROM
/// writes. Reading the real network interface's MAC is an external
/// collaborator this crate does not implement.
fn host_mac() -> [u8; 6] {
    [0, 0, 0, 0, 0, 1]
}

async fn handle_connection(socket: TcpStream, hub: Arc<DeviceStateHub>) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(n) => n,
            Err(e) => {
                warn!("control socket read error: {e}");
                return;
            }
        };
        if n == 0 {
            return;
        }
        let command: FeedCommand = match serde_json::from_slice(&line) {
            Ok(c) => c,
            Err(e) => {
                let _ = write_half
                    .write_all(format!("{{\"error\":\"{e}\"}}\n").as_bytes())
                    .await;
                continue;
            }
        };
        let response = match hub.submit_command(command).await {
            Ok(()) => "{\"accepted\":true}\n".to_string(),
            Err(e) => format!("{{\"accepted\":false,\"error\":\"{e}\"}}\n"),
        };
        if write_half.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}
