use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use hotel_stats::config::OutputMode;
use hotel_stats::outputs::MemorySink;
use hotel_stats::outputs::SqliteTableSink;
use hotel_stats::webserver;
use hotel_stats::PipelineConfig;
use hotel_stats::Scheduler;
use hotel_stats::ShutdownHandle;

#[derive(Debug, Parser)]
#[command(name = "hotel-stats", version, about = "Windowed hotel weather statistics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a query until interrupted.
    Run(RunArgs),
    /// Print rows of the durable statistics table as JSON lines.
    Show {
        #[arg(long)]
        output_path: PathBuf,
        #[arg(long, default_value = "hotel_statistics")]
        query_name: String,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the cities with the most distinct hotels in any window.
    TopCities {
        #[arg(long)]
        output_path: PathBuf,
        #[arg(long, default_value = "hotel_statistics")]
        query_name: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    input_path: Option<PathBuf>,
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,
    #[arg(long)]
    output_path: Option<PathBuf>,
    #[arg(long)]
    output_mode: Option<OutputMode>,
    /// Process what is currently in the input directory, then exit.
    #[arg(long)]
    once: bool,
    #[arg(long)]
    log_level: Option<String>,
}

impl RunArgs {
    fn into_config(self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => {
                let input_path = self
                    .input_path
                    .clone()
                    .context("--input-path is required without --config")?;
                let checkpoint_path = self
                    .checkpoint_path
                    .clone()
                    .context("--checkpoint-path is required without --config")?;
                PipelineConfig::new(input_path, checkpoint_path)
            }
        };
        if let Some(input_path) = self.input_path {
            config.input_path = input_path;
        }
        if let Some(checkpoint_path) = self.checkpoint_path {
            config.checkpoint_path = checkpoint_path;
        }
        if let Some(output_path) = self.output_path {
            config.output_path = Some(output_path);
        }
        if let Some(output_mode) = self.output_mode {
            config.output_mode = output_mode;
        }
        config.validate()?;
        Ok(config)
    }
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    hotel_stats::tracing::setup(args.log_level.as_deref())?;
    let once = args.once;
    let config = args.into_config()?;
    hotel_stats::metrics::initialize_metrics().context("error initializing metrics")?;

    let shutdown = ShutdownHandle::new();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("signal-thread")
        .enable_all()
        .build()
        .context("error starting signal runtime")?;
    let on_interrupt = shutdown.clone();
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received; shutting down after the current batch");
            on_interrupt.request();
        }
    });

    let serve_api =
        config.api_port.is_some() || std::env::var_os(webserver::PORT_ENV_VAR).is_some();
    let diagnostic = serve_api.then(MemorySink::new);
    // Kept alive for as long as the scheduler runs.
    let _server = match &diagnostic {
        Some(sink) => {
            let port = webserver::resolve_port(config.api_port)?;
            Some(webserver::start_server_runtime(sink.clone(), port)?)
        }
        None => None,
    };

    let mut scheduler = Scheduler::from_config(config, diagnostic)?;
    if once {
        while !shutdown.is_requested() {
            match scheduler.run_once()? {
                Some(report) => tracing::debug!("{report:?}"),
                None => break,
            }
        }
    } else {
        scheduler.run(&shutdown)?;
    }
    rt.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
        Command::Show {
            output_path,
            query_name,
            city,
            limit,
        } => {
            let table = SqliteTableSink::open(&output_path, &query_name, Duration::from_secs(5))?;
            let mut stdout = std::io::stdout().lock();
            for row in table.rows(city.as_deref(), limit)? {
                writeln!(stdout, "{}", serde_json::to_string(&row)?)?;
            }
            Ok(())
        }
        Command::TopCities {
            output_path,
            query_name,
            limit,
        } => {
            let table = SqliteTableSink::open(&output_path, &query_name, Duration::from_secs(5))?;
            let mut stdout = std::io::stdout().lock();
            for (city, distinct_hotels) in table.top_cities(limit)? {
                writeln!(stdout, "{city}\t{distinct_hotels}")?;
            }
            Ok(())
        }
    }
}
