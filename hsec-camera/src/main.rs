// HSEC camera daemon: discovery, pairing, repair and encrypted frame streaming.

mod capture;
mod config;
mod net;
mod storage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hsec_core::{Device, DeviceIdentity, Peripherals, ResetTrigger};
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Manual reset raised by SIGUSR1; consumed by the next tick.
struct SignalReset(Arc<AtomicBool>);

impl ResetTrigger for SignalReset {
    fn is_pressed(&mut self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

fn main() -> Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("hsec-camera {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hsec=info".parse()?),
        )
        .init();

    let cfg = config::load();
    let identity = net::resolve_identity(cfg.mac.as_deref())?;
    info!(device = %identity, version = VERSION, "hsec-camera starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, identity))
}

async fn run(cfg: config::Config, identity: DeviceIdentity) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let reset = Arc::new(AtomicBool::new(false));
    spawn_reset_listener(reset.clone())?;

    let stop_loop = stop.clone();
    let mut control =
        tokio::task::spawn_blocking(move || control_loop(cfg, identity, stop_loop, reset));

    tokio::select! {
        res = shutdown_signal() => res?,
        res = &mut control => return res.context("control loop panicked")?,
    }
    info!("shutting down");
    stop.store(true, Ordering::SeqCst);
    control.await.context("control loop panicked")?
}

/// Single-threaded device loop. Everything the device owns lives on this thread.
fn control_loop(
    cfg: config::Config,
    identity: DeviceIdentity,
    stop: Arc<AtomicBool>,
    reset: Arc<AtomicBool>,
) -> Result<()> {
    let datagram = match net::UdpDatagramIo::bind(cfg.device.discovery_port) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, port = cfg.device.discovery_port, "failed to bind discovery socket");
            restart_device();
        }
    };
    let stream = net::TcpStreamIo::new(cfg.device.transport.connect_timeout(), stop.clone());
    let slot = storage::FileSlot::open(&cfg.session_path)
        .with_context(|| format!("opening session slot {}", cfg.session_path.display()))?;
    info!(path = %slot.path().display(), "session slot");

    let peripherals = Peripherals {
        camera: capture::from_config(&cfg),
        network: Box::new(net::HostNetwork::new(cfg.broadcast)),
        reset: Box::new(SignalReset(reset)),
    };
    let tick = Duration::from_millis(cfg.tick_ms);

    let mut device = match Device::boot(identity, cfg.device, stream, datagram, slot, peripherals) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "boot failed");
            restart_device();
        }
    };

    while !stop.load(Ordering::SeqCst) {
        device.tick(Instant::now());
        std::thread::sleep(tick);
    }
    info!(state = ?device.state(), frames = device.frames_sent(), "control loop stopped");
    Ok(())
}

/// Re-exec the current binary (Unix); elsewhere exit and leave the restart to the supervisor.
fn restart_device() -> ! {
    error!("restarting");
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        match std::env::current_exe() {
            Ok(exe) => {
                std::thread::sleep(Duration::from_secs(1));
                let err = std::process::Command::new(exe)
                    .args(std::env::args_os().skip(1))
                    .exec();
                error!(error = %err, "re-exec failed");
            }
            Err(e) => error!(error = %e, "cannot locate executable"),
        }
    }
    std::process::exit(1)
}

/// SIGUSR1 acts as the manual reset button.
fn spawn_reset_listener(flag: Arc<AtomicBool>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut usr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                info!("manual reset requested");
                flag.store(true, Ordering::SeqCst);
            }
        });
    }
    #[cfg(not(unix))]
    drop(flag);
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
