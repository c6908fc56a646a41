mod checkpoint;
mod config;
mod driver;
mod errors;
mod locator;
mod normalizer;
mod orchestrator;
mod partition;
mod processor;
mod protocol;
mod report;
mod retry;
mod session;
mod source;
mod status;
mod telemetry;
mod wait;
mod worker;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use config::RunnerConfig;
use driver::webdriver::WebDriverFactory;
use driver::DriverFactory;
use partition::Partition;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use worker::Worker;

#[derive(Parser)]
#[command(name = "sync-runner")]
#[command(about = "Bulk, resumable sync of supplier/customer records into the ERP", long_about = None)]
struct Cli {
    /// JSON config file (defaults + SYNC_* env vars when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Processed export (CSV or JSON), overrides `data_file`
    #[arg(short, long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs one partition [START, END) in this process
    Run {
        /// First index (0-based)
        #[arg(default_value_t = 0)]
        start: usize,

        /// End index, exclusive; omitted runs to the end of the data
        end: Option<usize>,

        /// Partition id, names the checkpoint and report files
        #[arg(long)]
        id: Option<String>,
    },

    /// Runs several partitions in parallel
    Orchestrate {
        /// Partition as id=start:end (repeatable)
        #[arg(long = "range")]
        ranges: Vec<String>,

        /// Splits the whole data set into N even partitions
        #[arg(long, conflicts_with = "ranges")]
        split: Option<usize>,

        #[arg(long, value_enum, default_value_t = Mode::Processes)]
        mode: Mode,
    },

    /// Shows checkpoint progress per partition
    Status {
        /// Partition as id=start:end (repeatable); default discovers checkpoints
        #[arg(long = "range")]
        ranges: Vec<String>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// One tokio task per partition
    Tasks,
    /// One child process per partition
    Processes,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match RunnerConfig::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            return ExitCode::from(2);
        }
    };
    if let Some(data) = &cli.data {
        config.data_file = data.clone();
    }

    let mut telemetry = TelemetryConfig::from_env().with_level(&config.log_level);
    telemetry.log_file = match &cli.command {
        Commands::Run { start, end, id } if config.log_to_file => {
            let label = id.clone().unwrap_or_else(|| Partition::default_id(*start, *end));
            Some(TelemetryConfig::log_file_for(&config.output_dir, &label))
        }
        Commands::Orchestrate { .. } if config.log_to_file => {
            Some(TelemetryConfig::log_file_for(&config.output_dir, "orquestrador"))
        }
        _ => None,
    };
    if let Err(e) = init_telemetry(telemetry) {
        eprintln!("⚠️  Telemetria indisponível: {:#}", e);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupção recebida, finalizando partições");
            let _ = cancel_tx.send(true);
        }
    });

    let forwarded = forwarded_args(&cli);
    let result = match cli.command {
        Commands::Run { start, end, id } => run_partition(config, start, end, id, cancel_rx).await,
        Commands::Orchestrate { ranges, split, mode } => {
            orchestrate(config, ranges, split, mode, forwarded, cancel_rx).await
        }
        Commands::Status { ranges } => show_status(&config, &ranges),
    };

    shutdown_telemetry();
    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Execução abortada");
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Options every child process must receive.
fn forwarded_args(cli: &Cli) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(config) = &cli.config {
        args.push("--config".to_string());
        args.push(config.display().to_string());
    }
    if let Some(data) = &cli.data {
        args.push("--data".to_string());
        args.push(data.display().to_string());
    }
    args
}

fn browser_factory(config: &RunnerConfig) -> Arc<dyn DriverFactory> {
    Arc::new(WebDriverFactory {
        webdriver_url: config.browser.webdriver_url.clone(),
        headless: config.browser.headless,
        frame_selector: config.browser.frame_selector.clone(),
    })
}

fn parse_ranges(ranges: &[String]) -> Result<Vec<Partition>> {
    ranges.iter().map(|r| r.parse()).collect()
}

async fn run_partition(
    config: RunnerConfig,
    start: usize,
    end: Option<usize>,
    id: Option<String>,
    cancel: watch::Receiver<bool>,
) -> Result<ExitCode> {
    let records = source::load_records(&config.data_file)?;
    let partition = match id {
        Some(id) => Partition::new(id, start, end),
        None if start == 0 && end.is_none() => Partition::whole(),
        None => Partition::new(Partition::default_id(start, end), start, end),
    };
    Partition::validate(std::slice::from_ref(&partition), records.len())?;

    let factory = browser_factory(&config);
    let stats = Worker::new(partition, Arc::new(config), factory)
        .run(&records, cancel)
        .await?;

    println!("🏁 {}", stats);
    Ok(if stats.interrupted {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    })
}

async fn orchestrate(
    config: RunnerConfig,
    ranges: Vec<String>,
    split: Option<usize>,
    mode: Mode,
    forwarded: Vec<String>,
    cancel: watch::Receiver<bool>,
) -> Result<ExitCode> {
    let records = source::load_records(&config.data_file)?;
    let partitions = if !ranges.is_empty() {
        parse_ranges(&ranges)?
    } else if let Some(n) = split {
        Partition::split_even(records.len(), n)
    } else if !config.partitions.is_empty() {
        parse_ranges(&config.partitions)?
    } else {
        bail!("informe --range, --split ou `partitions` na configuração");
    };
    Partition::validate(&partitions, records.len())?;
    info!(partitions = partitions.len(), records = records.len(), "Orquestrando");

    let all_ok = match mode {
        Mode::Tasks => {
            let factory = browser_factory(&config);
            let results = orchestrator::run_in_tasks(
                partitions,
                Arc::new(records),
                Arc::new(config),
                factory,
                cancel,
            )
            .await?;
            for result in &results {
                match &result.stats {
                    Ok(stats) => println!("✅ {}", stats),
                    Err(e) => println!("❌ {}: {:#}", result.id, e),
                }
            }
            results.iter().all(|r| r.stats.is_ok())
        }
        Mode::Processes => {
            let exe = std::env::current_exe().context("Failed to locate own executable")?;
            let results = orchestrator::run_in_processes(
                &partitions,
                &exe,
                &forwarded,
                config.stagger(),
                config.child_grace(),
                cancel,
            )
            .await?;
            for result in &results {
                let mark = if result.succeeded() { "✅" } else { "❌" };
                println!("{} {}", mark, result.id);
            }
            results.iter().all(|r| r.succeeded())
        }
    };

    Ok(if all_ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn show_status(config: &RunnerConfig, ranges: &[String]) -> Result<ExitCode> {
    let mut partitions = parse_ranges(ranges)?;
    if partitions.is_empty() {
        partitions = parse_ranges(&config.partitions)?;
    }
    let total = match source::load_records(&config.data_file) {
        Ok(records) => Some(records.len()),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "Planilha indisponível, percentuais omitidos");
            None
        }
    };

    let statuses = status::collect(&config.output_dir, &partitions, total)?;
    if statuses.is_empty() {
        println!("Nenhum checkpoint em {:?}", config.output_dir);
    }
    for status in &statuses {
        println!("{}", status);
    }
    Ok(ExitCode::SUCCESS)
}
