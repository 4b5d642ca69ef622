use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_cargo::style::CLAP_STYLING;
use comfy_table::presets::ASCII_MARKDOWN;
use comfy_table::{Cell, Color, Table};
use mimalloc::MiMalloc;
use tally::{Backend, Builder, Counter, CounterService};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(about, version, styles = CLAP_STYLING)]
struct Cli {
    /// Directory of the counter log [env: TALLY_DATA_DIR]
    #[arg(long, value_name = "PATH", global = true)]
    data_dir: Option<PathBuf>,

    /// Table identifier, names the log file [env: TABLE_NAME]
    #[arg(long, value_name = "NAME", global = true)]
    table: Option<String>,

    /// Key of the counter record [env: COUNTER_ITEM_ID]
    #[arg(long, value_name = "KEY", global = true)]
    key: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the counter over HTTP
    Serve {
        /// Address to listen on
        #[arg(long, env = "TALLY_LISTEN", default_value = "127.0.0.1:3000", value_name = "ADDR")]
        listen: SocketAddr,

        /// Backing store [env: TALLY_BACKEND]
        #[arg(long, value_name = "BACKEND")]
        backend: Option<Backend>,

        /// Value to provision the record with if it does not exist yet
        #[arg(long, value_name = "N", allow_negative_numbers = true)]
        initial: Option<i64>,
    },
    /// Create the counter record unless it already exists
    Provision {
        /// Starting value
        #[arg(long, default_value = "0", value_name = "N", allow_negative_numbers = true)]
        value: i64,
    },
    /// Show the counter record
    Get,
    /// Add one to the counter
    Incr,
    /// Subtract one from the counter
    Decr,
    /// Add an arbitrary signed delta to the counter
    Add {
        #[arg(value_name = "DELTA", allow_negative_numbers = true)]
        delta: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut builder = Builder::from_env().context("Invalid environment configuration")?;
    if let Some(dir) = &cli.data_dir {
        builder = builder.data_dir(dir);
    }
    if let Some(table) = &cli.table {
        builder = builder.table(table);
    }
    if let Some(key) = &cli.key {
        builder = builder.key(key);
    }

    match cli.command {
        Commands::Serve { listen, backend, initial } => {
            if let Some(backend) = backend {
                builder = builder.backend(backend);
            }
            handle_serve(builder, listen, initial).await
        }
        command => {
            // One-shot commands only make sense against durable state
            let counter = open(builder.backend(Backend::Log)).await?;
            handle_command(&counter, command).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open(builder: Builder) -> Result<CounterService> {
    let config = builder.config();
    let location = match config.backend {
        Backend::Memory => "memory".to_owned(),
        Backend::Log => config.data_dir.join(format!("{}.log", config.table)).display().to_string(),
    };

    builder.build().await.with_context(|| format!("Failed to open counter store at `{location}`"))
}

async fn handle_serve(builder: Builder, listen: SocketAddr, initial: Option<i64>) -> Result<()> {
    let backend = builder.config().backend;
    let counter = open(builder).await?;

    // A memory store starts empty and nothing else can provision it
    let initial = initial.or((backend == Backend::Memory).then_some(0));
    if let Some(value) = initial {
        counter.provision(value).await.context("Failed to provision counter")?;
    }

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind `{listen}`"))?;

    tally::serve(listener, Arc::new(counter), shutdown_signal()).await.context("Server failed")?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

async fn handle_command(counter: &CounterService, command: Commands) -> Result<()> {
    let record = match command {
        Commands::Provision { value } => {
            let created = counter.provision(value).await.context("Failed to provision counter")?;
            if !created {
                println!("Counter `{}` already exists.", counter.key());
            }
            counter.get().await
        }
        Commands::Get => counter.get().await,
        Commands::Incr => counter.increment().await,
        Commands::Decr => counter.decrement().await,
        Commands::Add { delta } => counter.update(delta).await,
        Commands::Serve { .. } => anyhow::bail!("`serve` is not a one-shot command"),
    }
    .context("Counter operation failed")?;

    display_record(&record, counter.bounds());
    Ok(())
}

fn display_record(record: &Counter, (min, max): (i64, i64)) {
    let mut table = Table::new();
    table.load_preset(ASCII_MARKDOWN);
    table.set_header(vec![
        Cell::new("Key").fg(Color::Green),
        Cell::new("Value").fg(Color::Cyan),
        Cell::new("Version").fg(Color::Yellow),
        Cell::new("Range"),
    ]);
    table.add_row(vec![
        record.id.clone(),
        record.value.to_string(),
        record.version.to_string(),
        format!("[{min}, {max}]"),
    ]);

    println!("{table}");
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
}
