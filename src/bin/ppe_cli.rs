//! ppe_cli - operator tool for the PPE compliance store

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use ppe_monitor::{
    orchestrator::ensure_output_dir,
    query::{OllamaClient, QueryGateway},
    DetectionOrchestrator, PpeConfig, SqliteViolationStore, ViolationReport, ViolationStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "PPE_CONFIG")]
    config: Option<PathBuf>,
    /// Override the violation store path.
    #[arg(long)]
    db_path: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run detection on an image and record the event.
    Detect {
        image: PathBuf,
    },
    /// Export the violations report.
    Report {
        /// Write CSV here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Emit the HTML mail body instead of CSV.
        #[arg(long)]
        html: bool,
    },
    /// Ask a question about recorded violations.
    Ask {
        question: String,
    },
    /// Print event counts per compliance status.
    Stats,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let mut config = PpeConfig::load_from(args.config.as_deref())?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    let store = Arc::new(SqliteViolationStore::open(&config.db_path)?);

    match args.command {
        Command::Detect { image } => {
            ensure_output_dir(&config.output_dir)?;
            let registry = config.detector.build_registry()?;
            registry.warm_up_default()?;
            let orchestrator = DetectionOrchestrator::new(
                registry,
                config.labels.clone(),
                store,
                config.output_dir.clone(),
            );
            let bytes = std::fs::read(&image)
                .with_context(|| format!("read image {}", image.display()))?;
            let filename = image
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let outcome = orchestrator.process(&bytes, &filename)?;
            let summary = serde_json::json!({
                "event_id": outcome.event_id,
                "overall_status": outcome.overall_status,
                "detections": outcome.detections,
                "annotated_path": outcome.annotated_path,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Report { output, html } => {
            let report = ViolationReport::build(store.as_ref())?;
            let rendered = if html { report.to_html() } else { report.to_csv() };
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("write report {}", path.display()))?;
                    eprintln!("{} violation rows written to {}", report.rows.len(), path.display());
                }
                None => print!("{}", rendered),
            }
        }
        Command::Ask { question } => {
            let llm = OllamaClient::new(config.llm.ollama_config())?;
            let outcome = QueryGateway::new(&llm, store.as_ref()).ask(&question);
            if let Some(sql) = &outcome.sql {
                log::info!("generated sql: {}", sql);
            }
            println!("{}", outcome.answer);
        }
        Command::Stats => {
            let counts = store.status_counts()?;
            let total: u64 = counts.values().sum();
            for (status, count) in &counts {
                println!("{:<14} {}", status.as_str(), count);
            }
            println!("{:<14} {}", "total", total);
        }
    }
    Ok(())
}
