pub mod config;
pub mod input;
pub mod net;
pub mod protocol;
pub mod sender;
pub mod sink;
pub mod status;

use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::sender::{SenderHandle, SenderOptions};
use crate::sink::{SinkHandle, SinkOptions};
use crate::status::StatusEvent;

#[derive(Parser)]
#[command(name = "padlink", about = "Bridges game controller state over UDP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll local controllers and bridge their combined state to a sink.
    Send {
        /// Target host name or IP. Falls back to the saved configuration.
        target: Option<String>,

        /// Destination UDP port.
        #[arg(long, default_value_t = protocol::PORT)]
        port: u16,
    },
    /// Receive bridged state and serve it to local readers.
    Serve {
        /// UDP port to listen on, both address families.
        #[arg(long, default_value_t = protocol::PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let cli = Cli::parse();

    match cli.command {
        Command::Send { target, port } => run_send(target, port).await,
        Command::Serve { port } => run_serve(port).await,
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

async fn run_send(target: Option<String>, port: u16) -> Result<()> {
    let mut config = config::Config::load();
    let target = target.or_else(|| config.target.clone());

    // Remember the last target so a bare `padlink send` reconnects.
    if let Some(host) = &target {
        if config.target.as_deref() != Some(host.as_str()) {
            config.target = Some(host.clone());
            if let Err(e) = config.save() {
                warn!("Could not save config: {}", e);
            }
        }
    }

    let (events_tx, events_rx) = mpsc::channel(256);
    let presenter = spawn_presenter(events_rx);

    let sender = SenderHandle::spawn(
        SenderOptions {
            port,
            initial_target: target,
            source: None,
        },
        events_tx,
    )
    .await;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    sender.shutdown().await;
    presenter.abort();

    Ok(())
}

async fn run_serve(port: u16) -> Result<()> {
    let (events_tx, events_rx) = mpsc::channel(256);
    let presenter = spawn_presenter(events_rx);

    let sink = SinkHandle::spawn(SinkOptions { port }, events_tx).await;
    let state = sink.state();

    // Local readers would normally query the shared state through the
    // controller shim; here we just trace movement of the packet counter.
    let mut last_number = 0u32;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if let Some(current) = state.get(0) {
                    if current.packet_number != last_number {
                        debug!(
                            "Serving packet {} buttons {:#06x}",
                            current.packet_number, current.buttons
                        );
                        last_number = current.packet_number;
                    }
                }
            }
        }
    }

    info!("Shutting down");

    sink.shutdown().await;
    presenter.abort();

    Ok(())
}

/// Text presenter for the status boundary: renders the three status channels
/// and the icon updates as log lines.
fn spawn_presenter(mut events: mpsc::Receiver<StatusEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StatusEvent::Resolve { severity, message } => {
                    info!("resolve [{:?}] {}", severity, message);
                }
                StatusEvent::Input { severity, message } => {
                    info!("input [{:?}] {}", severity, message);
                }
                StatusEvent::Connection { severity, message } => {
                    info!("connection [{:?}] {}", severity, message);
                }
                StatusEvent::Icon(severity) => {
                    debug!("icon -> {:?}", severity);
                }
            }
        }
    })
}
