//! CLI entry point for daq-runcontrol.
//!
//! Provides:
//! - `run-control`: the orchestrator, driven by operator commands on stdin
//! - `data-collector`: a peer writing producer events into run files
//! - `producer`: a test producer emitting BORE, N data events and EORE per run
//! - `reader`: dump the events of a run file
//!
//! # Usage
//!
//! ```bash
//! daq-runcontrol run-control --listen 0.0.0.0:44000
//! daq-runcontrol data-collector tcp://127.0.0.1:44000 --output-dir data
//! daq-runcontrol producer tcp://127.0.0.1:44000 --name tlu --events 1000
//! daq-runcontrol reader data/run000001.raw --skip 10
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use daq_runcontrol::codec::file::{FileReader, FileVersion};
use daq_runcontrol::config::Configuration;
use daq_runcontrol::data_collector::DataCollector;
use daq_runcontrol::error::AppResult;
use daq_runcontrol::event::Event;
use daq_runcontrol::logging;
use daq_runcontrol::receiver::{CommandHandler, CommandReceiver, PeerContext};
use daq_runcontrol::run_control::{RunControl, TransitionOutcome, DATA_COLLECTOR};
use daq_runcontrol::settings::DaqSettings;
use daq_runcontrol::transport::DataSender;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-runcontrol")]
#[command(about = "Distributed DAQ run control", long_about = None)]
struct Cli {
    /// Settings file (TOML); DAQ_* environment variables override it
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator; reads operator commands from stdin
    RunControl {
        /// Control listen address (overrides settings)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run a data collector peer
    DataCollector {
        /// Run control address
        address: String,

        /// Collector name; producers whose name it contains send data here
        #[arg(long, default_value = "")]
        name: String,

        /// Directory for run files (overrides settings)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Run a test producer peer
    Producer {
        /// Run control address
        address: String,

        /// Producer name
        #[arg(long, default_value = "test")]
        name: String,

        /// Data events per run
        #[arg(long, default_value = "100")]
        events: u32,

        /// Payload bytes per event
        #[arg(long, default_value = "64")]
        payload: usize,
    },

    /// Print the events of a run file
    Reader {
        /// Event file
        file: PathBuf,

        /// Records to skip before the first printed one
        #[arg(long, default_value = "0")]
        skip: usize,

        /// File framing version
        #[arg(long, value_enum, default_value = "v2")]
        version: VersionArg,

        /// Stop after this many events
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum VersionArg {
    V1,
    V2,
}

impl From<VersionArg> for FileVersion {
    fn from(value: VersionArg) -> Self {
        match value {
            VersionArg::V1 => FileVersion::V1,
            VersionArg::V2 => FileVersion::V2,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => DaqSettings::load_from(path),
        None => DaqSettings::load(),
    }
    .context("loading settings")?;
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::RunControl { listen } => run_control(settings, listen).await,
        Commands::DataCollector {
            address,
            name,
            output_dir,
        } => data_collector(settings, address, name, output_dir).await,
        Commands::Producer {
            address,
            name,
            events,
            payload,
        } => producer(settings, address, name, events, payload).await,
        Commands::Reader {
            file,
            skip,
            version,
            limit,
        } => read_file(file, skip, version.into(), limit),
    }
}

async fn run_control(mut settings: DaqSettings, listen: Option<String>) -> Result<()> {
    if let Some(listen) = listen {
        settings.run_control.listen_address = listen;
    }
    let rc = RunControl::bind(settings.run_control.clone(), settings.peer.handshake_timeout()).await?;
    println!("run control listening on {}", rc.local_addr());
    println!("commands: init <file> | config <file> | start | stop | reset | terminate | status [json] | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            continue;
        };
        let arg = words.next();
        let result = match (cmd, arg) {
            ("init", Some(file)) => match Configuration::from_file(file) {
                Ok(conf) => rc.initialise(&conf, None).await.map(report),
                Err(err) => Err(err),
            },
            ("config", Some(file)) => match Configuration::from_file(file) {
                Ok(conf) => rc.configure(&conf, None).await.map(report),
                Err(err) => Err(err),
            },
            ("start", _) => rc.start_run(None).await.map(report),
            ("stop", _) => rc.stop_run(None).await.map(report),
            ("reset", _) => rc.reset(None).await.map(report),
            ("status", Some("json")) => {
                match serde_json::to_string_pretty(&rc.connections()) {
                    Ok(json) => println!("{json}"),
                    Err(err) => println!("error: {err}"),
                }
                Ok(())
            }
            ("status", _) => {
                print_status(&rc);
                Ok(())
            }
            ("terminate", _) | ("quit", _) => break,
            _ => {
                println!("unknown command: {line}");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(error = %err, command = cmd, "operator command failed");
            println!("error: {err}");
        }
    }

    if !rc.connections().is_empty() {
        rc.terminate(None).await?;
    }
    rc.shutdown().await;
    Ok(())
}

fn report(outcome: TransitionOutcome) {
    match outcome {
        TransitionOutcome::Reached(state) => println!("reached {state}"),
        TransitionOutcome::Failed => println!("a peer reported ERROR"),
        TransitionOutcome::TimedOut { target, actual } => {
            println!("timed out waiting for {target}, aggregate is {actual}")
        }
    }
}

fn print_status(rc: &RunControl) {
    println!(
        "aggregate {} | run {} ({})",
        rc.aggregate(),
        rc.run_number(),
        if rc.is_running() { "running" } else { "stopped" }
    );
    for record in rc.connections() {
        println!(
            "  {:<6} {:<28} {:<8} {}{}",
            record.id.to_string(),
            record.info.to_string(),
            record.state.to_string(),
            if record.busy { "[busy] " } else { "" },
            record.message
        );
    }
}

async fn data_collector(
    settings: DaqSettings,
    address: String,
    name: String,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let dir = output_dir.unwrap_or_else(|| settings.files.output_dir.clone());
    let handler = DataCollector::new(settings.peer.data_listen_address.clone(), dir)
        .with_handshake_timeout(settings.peer.handshake_timeout());
    let mut receiver = CommandReceiver::new(DATA_COLLECTOR, &name, handler, settings.peer.clone());
    receiver.connect(&address).await?;
    receiver.exec().await?;
    Ok(())
}

/// Sends BORE, `events` RawEvents and EORE to its data collector each run.
struct TestProducer {
    events: u32,
    payload: usize,
    handshake_timeout: Duration,
    sender: tokio::sync::Mutex<Option<DataSender>>,
    data_address: Mutex<Option<String>>,
}

#[async_trait]
impl CommandHandler for TestProducer {
    async fn on_data(&self, _ctx: &PeerContext, address: &str) -> AppResult<()> {
        *self.data_address.lock() = Some(address.to_string());
        Ok(())
    }

    async fn on_start_run(&self, ctx: &PeerContext, _run: u32) -> AppResult<()> {
        let address = self.data_address.lock().clone();
        let Some(address) = address else {
            warn!("no data collector announced, events will not be sent");
            return Ok(());
        };
        let sender = DataSender::connect(&address, ctx.info(), self.handshake_timeout).await?;
        *self.sender.lock().await = Some(sender);
        Ok(())
    }

    async fn on_stop_run(&self, _ctx: &PeerContext) -> AppResult<()> {
        if let Some(sender) = self.sender.lock().await.take() {
            info!(events = sender.events_sent(), "closing data connection");
            sender.close().await?;
        }
        Ok(())
    }

    async fn run_loop(&self, ctx: PeerContext) -> AppResult<()> {
        let mut guard = self.sender.lock().await;
        let Some(sender) = guard.as_mut() else {
            return Ok(());
        };
        let run = ctx.run_number();
        sender.send_event(&Event::bore("RawEvent", run, 0)).await?;
        let mut n = 0;
        while n < self.events && ctx.run_active() {
            let mut ev = Event::new("RawEvent", run, 0);
            ev.set_event_n(n + 1);
            ev.add_block(0, vec![(n % 256) as u8; self.payload]);
            sender.send_event(&ev).await?;
            n += 1;
            tokio::task::yield_now().await;
        }
        sender.send_event(&Event::eore("RawEvent", run, 0, n + 1)).await?;
        ctx.set_tag("EVENT", n);
        info!(run, events = n, "run data sent");
        Ok(())
    }
}

async fn producer(settings: DaqSettings, address: String, name: String, events: u32, payload: usize) -> Result<()> {
    let handler = TestProducer {
        events,
        payload,
        handshake_timeout: settings.peer.handshake_timeout(),
        sender: tokio::sync::Mutex::new(None),
        data_address: Mutex::new(None),
    };
    let mut receiver = CommandReceiver::new("Producer", &name, handler, settings.peer.clone());
    receiver.connect(&address).await?;
    receiver.exec().await?;
    Ok(())
}

fn read_file(file: PathBuf, skip: usize, version: FileVersion, limit: Option<usize>) -> Result<()> {
    let mut reader = FileReader::open(&file, version).with_context(|| format!("opening {}", file.display()))?;
    let mut printed = 0;
    let mut next_skip = skip;
    while limit.map_or(true, |limit| printed < limit) {
        match reader.read_event(next_skip)? {
            Some(event) => {
                println!("{event}");
                printed += 1;
                next_skip = 0;
            }
            None => break,
        }
    }
    println!("{printed} events");
    Ok(())
}
