//! PPE compliance monitoring.
//!
//! Uploaded site images run through an object detector, the detections are
//! reduced to a single compliance verdict, and each image becomes one
//! atomically persisted detection event. Reports and natural-language
//! questions are served from the same SQLite store.
//!
//! # Module Structure
//!
//! - `detect`: detector backends, the backend registry, frame annotation
//! - `classify`: label rules and the per-image compliance verdict
//! - `storage`: the violation store (events plus their detections)
//! - `orchestrator`: detect, classify, persist for one image
//! - `report`: violation report as CSV and HTML
//! - `query`: natural-language to SQL gateway with its safety filter
//! - `mail`: report delivery
//! - `api`: HTTP surface
//! - `config`: file and environment configuration

use anyhow::Result;
use rusqlite::{Connection, OpenFlags};

pub mod api;
pub mod classify;
pub mod config;
pub mod detect;
pub mod error;
pub mod mail;
pub mod orchestrator;
pub mod query;
pub mod report;
pub mod storage;

pub use classify::{classify, ComplianceStatus, LabelRules};
pub use config::PpeConfig;
pub use detect::{BackendRegistry, BoundingBox, DetectedObject, DetectorBackend};
pub use error::PipelineError;
pub use orchestrator::{DetectionOrchestrator, DetectionOutcome};
pub use report::ViolationReport;
pub use storage::{SqliteViolationStore, ViolationStore};

/// Open the database, honouring SQLite `file:` URIs.
pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
