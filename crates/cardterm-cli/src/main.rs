//! Card-reader terminal demo driver.
//!
//! # Usage
//!
//! ```bash
//! # Drive a real terminal, configuration from a JSON file
//! cardterm --config reader.json
//!
//! # Self-contained demo against the built-in terminal simulator
//! cardterm --simulate-terminal --demo
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cardterm_hardware::CardType;
use cardterm_reader::simulator::{DEFAULT_PIN, TerminalSimulator};
use cardterm_reader::{ReaderConfig, ReaderService, SessionId, SessionSnapshot, SessionStatus};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_UID: [u8; 7] = [0x04, 0x5A, 0x11, 0x22, 0x33, 0x44, 0x80];

/// Card-reader terminal driver
#[derive(Parser, Debug)]
#[command(name = "cardterm")]
#[command(version)]
struct Args {
    /// Reader configuration (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start the built-in terminal simulator and point both links at it
    #[arg(long)]
    simulate_terminal: bool,

    /// Once operational, run a PIN unlock and a card read with simulated taps
    #[arg(long)]
    demo: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: Option<&PathBuf>) -> Result<ReaderConfig> {
    let Some(path) = path else {
        return Ok(ReaderConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = load_config(args.config.as_ref())?;
    let simulator = if args.simulate_terminal {
        let sam = config.resolve().context("invalid configuration")?.sam;
        let simulator = TerminalSimulator::start(&sam).await?;
        config.transit.addr = simulator.transit_addr();
        config.ifsf.addr = simulator.ifsf_addr();
        Some(simulator)
    } else {
        None
    };

    let service = ReaderService::start(&config, None)?;
    let mut status = service.subscribe_status();
    let watcher = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            info!(
                init = %snapshot.init_state,
                auth = %snapshot.auth_state,
                operational = snapshot.operational,
                unlocked = snapshot.sam_unlocked,
                error = ?snapshot.error_message,
                "Reader status"
            );
        }
    });

    if args.demo {
        if let Err(e) = run_demo(&service).await {
            warn!(error = %e, "Demo failed");
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    service.shutdown().await;
    watcher.abort();
    if let Some(simulator) = simulator {
        simulator.shutdown();
    }
    Ok(())
}

async fn run_demo(service: &ReaderService) -> Result<()> {
    let Some(taps) = service.simulator() else {
        bail!("the demo needs the simulated tap listener");
    };
    service
        .runtime()
        .wait_for_status(Duration::from_secs(60), |s| s.operational)
        .await?;

    let id = service.start_unlock(DEFAULT_PIN)?;
    wait_armed(|| service.get_unlock_status(id)).await?;
    taps.tap(DEMO_UID.to_vec(), CardType::MifareDESFire);
    let unlock = wait_done(|| service.get_unlock_status(id)).await?;
    info!(session = %id, status = %unlock.status, error = ?unlock.error_message, "Unlock finished");

    let id: SessionId = service.start_card_read(None, None)?;
    wait_armed(|| service.get_card_read_status(id)).await?;
    taps.tap(DEMO_UID.to_vec(), CardType::MifareDESFire);
    let read = wait_done(|| service.get_card_read_status(id)).await?;
    match read.result {
        Some(result) => info!(session = %id, fields = ?result.fields, "Card read"),
        None => warn!(session = %id, error = ?read.error_message, "Card read failed"),
    }
    Ok(())
}

async fn wait_armed<R>(poll: impl Fn() -> cardterm_reader::Result<SessionSnapshot<R>>) -> Result<()> {
    wait_until(poll, |s| s.status != SessionStatus::Pending).await.map(|_| ())
}

async fn wait_done<R>(
    poll: impl Fn() -> cardterm_reader::Result<SessionSnapshot<R>>,
) -> Result<SessionSnapshot<R>> {
    wait_until(poll, |s| s.status.is_terminal()).await
}

async fn wait_until<R>(
    poll: impl Fn() -> cardterm_reader::Result<SessionSnapshot<R>>,
    done: impl Fn(&SessionSnapshot<R>) -> bool,
) -> Result<SessionSnapshot<R>> {
    for _ in 0..600 {
        let snapshot = poll()?;
        if done(&snapshot) {
            return Ok(snapshot);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("session did not progress within a minute")
}
