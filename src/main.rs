// src/main.rs
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::LevelFilter;

use petrel::{DispatchMode, PetrelResult, Server, ServerConfig, TriggerMode, logger};

#[derive(Parser)]
#[command(name = "petrel")]
#[command(about = "Multi-threaded epoll HTTP/1.1 server with idle eviction")]
#[command(version)]
struct Cli {
    /// JSON configuration file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    /// Document root for static resources
    #[arg(short = 'r', long)]
    doc_root: Option<PathBuf>,

    /// Worker threads; 0 means one per CPU core
    #[arg(short = 't', long)]
    workers: Option<usize>,

    /// Credential store handles
    #[arg(short = 's', long)]
    store_capacity: Option<usize>,

    /// Alarm interval in seconds; idle eviction fires after three timeslots
    #[arg(long)]
    timeslot: Option<u64>,

    #[arg(long, value_enum)]
    listen_trigger: Option<TriggerArg>,

    #[arg(long, value_enum)]
    conn_trigger: Option<TriggerArg>,

    /// Who runs the socket reads
    #[arg(short = 'a', long, value_enum)]
    dispatch: Option<DispatchArg>,

    /// Enable SO_LINGER on the listening socket
    #[arg(short = 'o', long)]
    linger: bool,

    /// Log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// JSON object of preloaded user/password pairs
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Disable logging entirely
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerArg {
    Level,
    Edge,
}

impl From<TriggerArg> for TriggerMode {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::Level => TriggerMode::Level,
            TriggerArg::Edge => TriggerMode::Edge,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DispatchArg {
    SplitPhase,
    Unified,
}

impl From<DispatchArg> for DispatchMode {
    fn from(arg: DispatchArg) -> Self {
        match arg {
            DispatchArg::SplitPhase => DispatchMode::SplitPhase,
            DispatchArg::Unified => DispatchMode::Unified,
        }
    }
}

fn build_config(cli: &Cli) -> PetrelResult<ServerConfig> {
    let mut cfg = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(host) = &cli.host {
        cfg.host = host.clone();
    }
    if let Some(root) = &cli.doc_root {
        cfg.doc_root = root.clone();
    }
    if let Some(workers) = cli.workers {
        cfg.workers = if workers == 0 { num_cpus::get() } else { workers };
    }
    if let Some(capacity) = cli.store_capacity {
        cfg.store_capacity = capacity;
    }
    if let Some(timeslot) = cli.timeslot {
        cfg.timeslot_secs = timeslot;
    }
    if let Some(trigger) = cli.listen_trigger {
        cfg.listen_trigger = trigger.into();
    }
    if let Some(trigger) = cli.conn_trigger {
        cfg.conn_trigger = trigger.into();
    }
    if let Some(dispatch) = cli.dispatch {
        cfg.dispatch = dispatch.into();
    }
    if cli.linger {
        cfg.linger = true;
    }
    if let Some(path) = &cli.log_file {
        cfg.log_path = Some(path.clone());
    }
    if let Some(path) = &cli.credentials {
        cfg.credentials_file = Some(path.clone());
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run() -> PetrelResult<()> {
    let cli = Cli::parse();
    let cfg = build_config(&cli)?;

    let level = if cli.quiet {
        LevelFilter::Off
    } else {
        match cli.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    let _logger = logger::init(cfg.log_path.clone(), cfg.log_queue_capacity, level)?;

    let server = Server::new(cfg)?;
    server.run()
}

fn main() {
    if let Err(e) = run() {
        eprintln!("petrel: {}", e);
        std::process::exit(1);
    }
}
