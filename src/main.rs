//! Capmon - console client for a remote traffic-capture service.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use capmon::manager::CaptureManager;
use capmon::monitor::{CmdLock, MonitorConfig};
use capmon::service::RpcCaptureService;
use capmon::writer::SinkKind;

#[derive(Parser)]
#[command(name = "capmon")]
#[command(about = "Live capture monitor for a remote traffic generator")]
struct Cli {
    /// Address of the capture service RPC endpoint
    #[arg(short, long, default_value = "127.0.0.1:4507")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream live traffic from the server until interrupted
    Monitor {
        /// Capture packets transmitted on these ports
        #[arg(long = "tx", value_delimiter = ',')]
        tx_ports: Vec<u16>,
        /// Capture packets received on these ports
        #[arg(long = "rx", value_delimiter = ',')]
        rx_ports: Vec<u16>,
        /// Print a full structural dump per packet
        #[arg(short, long, conflicts_with = "pipe")]
        verbose: bool,
        /// Stream packets into a named pipe for an external analyzer
        #[arg(short, long)]
        pipe: bool,
    },
    /// Buffered capture recording
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Show all active captures
    Show,
    /// Remove all active captures
    Clear,
}

#[derive(Subcommand)]
enum RecordCommands {
    /// Start a new buffered capture
    Start {
        /// Capture packets transmitted on these ports
        #[arg(long = "tx", value_delimiter = ',')]
        tx_ports: Vec<u16>,
        /// Capture packets received on these ports
        #[arg(long = "rx", value_delimiter = ',')]
        rx_ports: Vec<u16>,
        /// Packet limit of the capture buffer
        #[arg(short, long, default_value_t = 1000)]
        limit: u64,
    },
    /// Stop an active buffered capture
    Stop {
        /// Capture id to stop
        #[arg(long)]
        id: u64,
        /// Where the server should store the captured packets
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let service = Arc::new(
        RpcCaptureService::connect(&cli.server)
            .with_context(|| format!("capture service unreachable at {}", cli.server))?,
    );
    let cmd_lock: CmdLock = Arc::new(Mutex::new(()));
    let mut manager = CaptureManager::new(service, cmd_lock);

    match cli.command {
        Commands::Monitor {
            tx_ports,
            rx_ports,
            verbose,
            pipe,
        } => {
            let sink = if pipe {
                SinkKind::Pipe
            } else if verbose {
                SinkKind::Verbose
            } else {
                SinkKind::Compact
            };

            manager.start_monitor(MonitorConfig::new(tx_ports, rx_ports, sink))?;

            let interrupted = Arc::new(AtomicBool::new(false));
            let flag = interrupted.clone();
            ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
                .context("failed to install the interrupt handler")?;

            // foreground wait; the worker streams in the background
            while !interrupted.load(Ordering::Relaxed) && manager.monitor_active() {
                thread::sleep(Duration::from_millis(200));
            }

            manager.stop_monitor()?;
        }
        Commands::Record { command } => match command {
            RecordCommands::Start {
                tx_ports,
                rx_ports,
                limit,
            } => {
                let id = manager.start_record(&tx_ports, &rx_ports, limit)?;
                println!("*** Capturing ID is set to '{id}' ***");
                println!("*** Please call 'capmon record stop --id {id} -o <out.pcap>' when done ***");
            }
            RecordCommands::Stop { id, output } => {
                manager.stop_record(id, output.as_deref())?;
            }
        },
        Commands::Show => print!("{}", manager.show()?.render()),
        Commands::Clear => manager.clear()?,
    }

    Ok(())
}
