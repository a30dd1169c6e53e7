//! `rmbg`: background-removal job service (API, workers, or both).

use clap::{Args, Parser, Subcommand};
use rmbg_api::app::{self, Backends, BoxError};
use rmbg_api::config::Settings;
use rmbg_api::shutdown::install_shutdown_handler;
use rmbg_worker::WorkerBinding;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rmbg", version, about = "Asynchronous image background-removal service")]
struct Cli {
    /// Skip broker and storage checks before starting.
    #[arg(long, global = true)]
    skip_checks: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start one worker per detected device, then the API (default).
    All(ServeArgs),
    /// Run only the HTTP API.
    Api(ServeArgs),
    /// Run a single worker process.
    Worker {
        #[arg(long, env = "RMBG_WORKER_ORDINAL", default_value_t = 0)]
        ordinal: usize,
        /// Device index; omitted means CPU.
        #[arg(long, env = "RMBG_DEVICE_INDEX")]
        device: Option<u32>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Check broker, upload directory and result storage, then exit.
    Check,
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Dispatch slots per worker process.
    #[arg(long)]
    concurrency: Option<usize>,
}

impl ServeArgs {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.host = host;
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(n) = self.concurrency.filter(|n| *n > 0) {
            settings.dispatcher.concurrency = n;
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to load .env: {}", e);
        }
    }
    init_tracing();

    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    let command = cli
        .command
        .unwrap_or_else(|| Command::All(ServeArgs::default()));
    settings.ensure_dirs()?;
    let backends = Backends::open(&settings)?;
    let cancel = install_shutdown_handler();

    match command {
        Command::All(args) => {
            args.apply(&mut settings);
            app::run_all(&settings, &backends, cli.skip_checks, cancel).await
        }
        Command::Api(args) => {
            args.apply(&mut settings);
            app::serve_api(&settings, &backends, cancel).await
        }
        Command::Worker {
            ordinal,
            device,
            concurrency,
        } => {
            if let Some(n) = concurrency.filter(|n| *n > 0) {
                settings.dispatcher.concurrency = n;
            }
            let binding = WorkerBinding::with_device_index(ordinal, device);
            app::run_worker(&settings, &backends, binding, cancel).await
        }
        Command::Check => {
            app::run_checks(&settings, &backends).await?;
            tracing::info!("all checks passed");
            Ok(())
        }
    }
}
