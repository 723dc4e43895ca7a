use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nvsos_core::{ScrapeRequest, ScrapeResult};
use nvsos_scrape::ScrapeConfig;
use tracing::error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const JSON_START_MARKER: &str = "=== SCRAPED_DATA_JSON_START ===";
const JSON_END_MARKER: &str = "=== SCRAPED_DATA_JSON_END ===";

#[derive(Debug, Parser)]
#[command(name = "nvsos")]
#[command(about = "Nevada Secretary of State entity scraper")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Look up one file number and write its result JSON and HTML snapshot.
    Scrape(ScrapeArgs),
    /// Parse a saved entity detail page and print the record as JSON.
    Parse {
        html: PathBuf,
    },
}

#[derive(Debug, Args)]
struct ScrapeArgs {
    #[arg(long, env = "FILE_NUMBER")]
    file_number: String,

    /// Correlation id used in artifact names; synthesized when absent.
    #[arg(long, env = "REQUEST_ID")]
    request_id: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// YAML file overriding environment configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Echo the result JSON between CI markers on stdout.
    #[arg(long)]
    print_json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Scrape(args) => scrape(args).await,
        Commands::Parse { html } => {
            let text = std::fs::read_to_string(&html)
                .with_context(|| format!("reading {}", html.display()))?;
            let record = nvsos_portal::parse_entity_page(&text)
                .with_context(|| format!("parsing {}", html.display()))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("serializing entity record")?
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn scrape(args: ScrapeArgs) -> Result<ExitCode> {
    let (config, rejected) = load_config(&args);
    let request = ScrapeRequest::new(args.file_number, args.request_id);

    let persisted = if let Some(reason) = rejected {
        nvsos_scrape::persist_config_failure(&config, &request, reason).await?
    } else {
        let cutoff = config.hard_cutoff();
        match tokio::time::timeout(cutoff, nvsos_scrape::run_scrape(&config, &request)).await {
            Ok(persisted) => persisted?,
            Err(_) => {
                error!(
                    request_id = %request.request_id,
                    file_number = %request.file_number,
                    ?cutoff,
                    "hard wall-clock cutoff reached, abandoning run"
                );
                return Ok(ExitCode::FAILURE);
            }
        }
    };

    if args.print_json {
        println!("{JSON_START_MARKER}");
        println!(
            "{}",
            serde_json::to_string_pretty(&persisted.result).context("serializing scrape result")?
        );
        println!("{JSON_END_MARKER}");
    }
    println!("{}", summary_line(&persisted.result));
    println!("output: {}", persisted.result_path.display());

    Ok(if persisted.result.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Environment plus the optional YAML overlay. An unreadable overlay is returned as the
/// rejection reason so the run can still record it.
fn load_config(args: &ScrapeArgs) -> (ScrapeConfig, Option<String>) {
    let mut config = ScrapeConfig::from_env();
    let mut rejected = None;
    if let Some(path) = &args.config {
        match ScrapeConfig::load_overlay(path) {
            Ok(overlay) => config = config.with_overlay(overlay),
            Err(err) => rejected = Some(format!("{err:#}")),
        }
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    (config, rejected)
}

fn summary_line(result: &ScrapeResult) -> String {
    let meta = &result.metadata;
    match (&result.entity_information, meta.success) {
        (Some(record), true) => format!(
            "scraped {}: name={} status={} officers={}",
            meta.file_number,
            record.entity_name.as_deref().unwrap_or("-"),
            record.entity_status.as_deref().unwrap_or("-"),
            record.officers.len()
        ),
        _ => format!(
            "scrape of {} failed at {} ({}): {}",
            meta.file_number,
            meta.stage,
            meta.error_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            meta.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

/// Logs go to stderr; stdout is reserved for the result echo.
fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))
}
