//! Conducto CLI - run the pipeline engine process.
//!
//! Exit codes drive the external supervisor: 0 clean, 1 unhandled error,
//! 2 restart-clean requested, 3 restart-dirty requested.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use conducto_engine::{BackendKind, Engine, EngineConfig, ObserverRecord, SessionFlags};

#[derive(Parser)]
#[command(name = "conducto")]
#[command(author, version, about = "Conducto audio pipeline engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine headless until the supervisor stops it
    Run(RunArgs),

    /// Play a WAV file and exit at end of stream
    Play(PlayArgs),

    /// List available output devices
    Devices,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Engine configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend driver: null, system, or ipc
    #[arg(long)]
    backend: Option<String>,

    /// Frames per block (power of two)
    #[arg(long)]
    block_size: Option<usize>,

    /// Shared-memory region name for the ipc backend
    #[arg(long)]
    shm: Option<String>,

    /// Enable per-node timing in Perf records
    #[arg(long)]
    perf: bool,
}

#[derive(clap::Args)]
struct PlayArgs {
    /// WAV file to play
    file: PathBuf,

    /// Backend driver: null, system, or ipc
    #[arg(long, default_value = "system")]
    backend: String,
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => run(args)?,
        Commands::Play(args) => play(args)?,
        Commands::Devices => {
            for name in conducto_io::list_output_devices() {
                println!("{name}");
            }
            0
        }
    };
    std::process::exit(code);
}

fn build_config(args: &RunArgs) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(name) = &args.backend {
        config.backend = parse_backend(name)?;
    }
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(shm) = &args.shm {
        config.shm_region = Some(shm.clone());
    }
    if args.perf {
        config.perf_trace = true;
    }
    config.validate()?;
    Ok(config)
}

fn parse_backend(name: &str) -> anyhow::Result<BackendKind> {
    BackendKind::parse(name).ok_or_else(|| anyhow::anyhow!("unknown backend {name:?}"))
}

fn run(args: RunArgs) -> anyhow::Result<i32> {
    let config = build_config(&args)?;
    let backend = config.backend;

    let engine = Engine::new(config)?;
    if let Some(region) = engine.set_backend(Some(backend))? {
        tracing::info!(region, "shared-memory region created");
    }
    engine.start()?;

    tracing::info!(backend = backend.name(), "engine running");
    engine.join_audio();

    engine.shutdown(conducto_engine::ShutdownReason::Clean);
    Ok(engine.exit_code())
}

fn play(args: PlayArgs) -> anyhow::Result<i32> {
    let config = EngineConfig {
        backend: parse_backend(&args.backend)?,
        ..Default::default()
    };

    let engine = Engine::new(config)?;
    let session = engine.start_session(SessionFlags::default());
    engine.attach_session(session)?;

    engine.set_backend_named(&args.backend)?;
    let player = engine.play_file(
        args.file
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("non-UTF8 path"))?,
    )?;
    engine.start()?;

    // The player auto-removes itself at end of stream.
    'wait: loop {
        for record in engine.poll_session(session)? {
            if matches!(record, ObserverRecord::RemoveNode { id } if id == player.raw()) {
                break 'wait;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    engine.shutdown(conducto_engine::ShutdownReason::Clean);
    Ok(engine.exit_code())
}
