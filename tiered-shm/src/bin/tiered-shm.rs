use std::error::Error;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, ExitCode};

use clap::{Parser, Subcommand, ValueEnum};
use tiered_shm::{
    Level, LocalSegmentOptions, PoolOptions, PooledMemory, StoreConfig, TieredStore, Watermark,
};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = TieredCommand::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");

            let mut source = err.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }

            ExitCode::FAILURE
        }
    }
}

#[derive(Parser)]
struct TieredCommand {
    /// Mount point of the RAM-resident filesystem holding the local segment.
    #[arg(long, default_value = "/dev/shm")]
    mount: PathBuf,

    /// Secret shared by all openers of the local segment.
    #[arg(long, env = "TIERED_SHM_SECRET", hide_env_values = true)]
    secret: String,

    /// File name of the local segment.
    #[arg(long, default_value = LocalSegmentOptions::DEFAULT_SEGMENT)]
    segment: String,

    /// Bytes available to objects in the local segment.
    #[arg(long, default_value_t = 64 << 20)]
    local_capacity: usize,

    /// Bytes available to objects in the memory pool.
    #[arg(long, default_value_t = 1 << 30)]
    pool_capacity: usize,

    /// Processes using the same id share one pool.
    #[arg(long, default_value_t = 12345)]
    pool_id: u32,

    /// The pressure level to route with.
    #[arg(value_enum, long, default_value_t = Pressure::Low)]
    watermark: Pressure,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Store a text, read it back, and release it again.
    Demo {
        #[arg(default_value_t = 123)]
        id: u64,
        #[arg(default_value = "Hello, World!")]
        text: String,
    },
    /// Execute a command with the memory pool passed to it.
    Run {
        #[arg(help = "The command to execute with the pool descriptor in its environment")]
        command: OsString,
        args: Vec<OsString>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Pressure {
    Low,
    High,
}

fn run(cli: TieredCommand) -> Result<(), Box<dyn Error>> {
    let mut local = LocalSegmentOptions::new(cli.mount, cli.secret);
    local.segment = cli.segment;
    local.capacity = cli.local_capacity;

    let pool = PoolOptions {
        capacity: cli.pool_capacity,
        pool_id: cli.pool_id,
        ..PoolOptions::default()
    };

    let level = match cli.watermark {
        Pressure::Low => Level::Low,
        Pressure::High => Level::High,
    };

    match cli.action {
        Action::Demo { id, text } => {
            let config = StoreConfig { local, pool };
            let store = TieredStore::open(&config, Watermark::new(level))?;

            let mut data = text.into_bytes();
            data.push(0);
            store.put(id, &data)?;

            let view = store.get(id)?;
            // Safety: nobody else releases our id while we hold the view.
            let bytes = unsafe { view.as_slice() };
            let text = String::from_utf8_lossy(&bytes[..bytes.len() - 1]);
            println!(
                "Retrieved data: {text} of size: {} from the {} tier",
                view.len(),
                view.tier()
            );

            store.release(view.as_ptr())?;
            Ok(())
        }
        Action::Run { command, args } => {
            let pool = PooledMemory::open(&pool)?;

            let mut proc = Command::new(&command);
            proc.args(&args);
            // Safety: `exec` replaces this process, the pool is alive until then.
            unsafe { pool.share_with(&mut proc) };

            tracing::info!(pool_id = pool.pool_id(), "passing pool to child");
            let error = proc.exec();
            Err(format!("failed to exec {}: {error}", command.to_string_lossy()).into())
        }
    }
}
