//! ppe_server - HTTP service for PPE compliance monitoring
//!
//! This daemon:
//! 1. Opens (and migrates) the violation store
//! 2. Loads and warms up the configured detector backend
//! 3. Serves detection, reporting, question and mail endpoints

use anyhow::Result;
use std::sync::mpsc;
use std::sync::Arc;

use ppe_monitor::{
    api::{ApiConfig, ApiServer, ApiState},
    mail::SpoolMailTransport,
    orchestrator::ensure_output_dir,
    query::OllamaClient,
    DetectionOrchestrator, PpeConfig, SqliteViolationStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = PpeConfig::load()?;
    let store = SqliteViolationStore::open(&config.db_path)?;
    ensure_output_dir(&config.output_dir)?;

    let registry = config.detector.build_registry()?;
    registry.warm_up_default()?;
    log::info!(
        "detector backend '{}' ready",
        registry.default_name().unwrap_or("none")
    );

    let orchestrator = DetectionOrchestrator::new(
        registry,
        config.labels.clone(),
        Arc::new(store),
        config.output_dir.clone(),
    );
    let llm = OllamaClient::new(config.llm.ollama_config())?;
    let mail = SpoolMailTransport::new(config.mail.spool_dir.clone(), config.mail.sender.clone());

    let state = ApiState {
        orchestrator,
        llm: Arc::new(llm),
        mail: Arc::new(mail),
        mail_recipient: config.mail.recipient.clone(),
    };
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        max_body_bytes: config.max_body_bytes,
    };
    let api_handle = ApiServer::new(api_config, state).spawn()?;
    log::info!("ppe api listening on {}", api_handle.addr);
    log::info!("ppe_server running. store {}", config.db_path);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("ppe_server waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
