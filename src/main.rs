use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use endpoint_mapper::session::classify_with;
use endpoint_mapper::{
    logging, metrics, CaptureConfig, CaptureSession, Classifier, ReplaySource, SessionBudget,
    UrlTemplater,
};

#[derive(Parser)]
#[command(name = "endpoint_mapper")]
#[command(about = "Builds an API endpoint catalog from captured browser network events")]
#[command(version)]
struct Cli {
    /// Capture configuration (TOML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded JSON Lines capture and print the catalog as JSON
    Replay {
        /// File with one lifecycle event or CDP message per line
        #[arg(long)]
        events: PathBuf,
        /// Stop after this many events
        #[arg(long)]
        max_events: Option<u64>,
        /// Stop after this many seconds
        #[arg(long)]
        max_duration_secs: Option<u64>,
        /// Directory for JSON log files
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,
    },
    /// Print the canonical key for a URL
    Template {
        method: String,
        url: String,
    },
    /// Print the category the taxonomy assigns to a URL
    Classify {
        url: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CaptureConfig> {
    match path {
        Some(path) => CaptureConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(CaptureConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Replay {
            events,
            max_events,
            max_duration_secs,
            log_dir,
        } => {
            let _guard = logging::init_logging(&log_dir);
            if let Some(port) = std::env::var("ENDPOINT_MAPPER_METRICS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
            {
                metrics::init_metrics(port);
            }

            let mut budget = SessionBudget::from_config(&config);
            if max_events.is_some() {
                budget.max_events = max_events;
            }
            if let Some(secs) = max_duration_secs {
                budget.max_duration = Some(Duration::from_secs(secs));
            }

            let session = CaptureSession::from_config(&config)?;
            let mut source = ReplaySource::open(&events)
                .await
                .with_context(|| format!("opening capture {}", events.display()))?;

            info!(events = %events.display(), "replaying capture");
            let (catalog, summary) = session.run(&mut source, budget).await;

            println!("{}", catalog.to_json()?);

            eprintln!("\nCapture summary:");
            eprintln!("   Events ingested: {}", summary.events_ingested);
            eprintln!("   Exchanges recorded: {}", summary.exchanges_recorded);
            eprintln!("   Partial exchanges: {}", summary.partial_exchanges);
            eprintln!("   Endpoints: {}", summary.endpoints);
            eprintln!("   Skipped lines: {}", source.skipped());
            for (category, count) in catalog.category_counts() {
                eprintln!("   {:<12} {}", category, count);
            }
        }
        Commands::Template { method, url } => {
            let key = UrlTemplater::new().template(&method, &url)?;
            println!("{}", key);
        }
        Commands::Classify { url } => {
            let classifier = Classifier::from_config(&config.taxonomy)?;
            println!("{}", classify_with(&classifier, &UrlTemplater::new(), &url)?);
        }
    }
    Ok(())
}
