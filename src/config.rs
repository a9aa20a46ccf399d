use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classify::LabelRules;
use crate::detect::{BackendRegistry, HttpBackend, StubBackend};
use crate::query::OllamaConfig;

const DEFAULT_DB_PATH: &str = "ppe_compliance.db";
const DEFAULT_OUTPUT_DIR: &str = "outputs";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.25;
const DEFAULT_IOU_THRESHOLD: f64 = 0.45;
const DEFAULT_LLM_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_LLM_MODEL: &str = "llama3.2:1b";
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAIL_SENDER: &str = "ppe-monitor@localhost";
const DEFAULT_MAIL_RECIPIENT: &str = "safety-manager@localhost";
const DEFAULT_SPOOL_DIR: &str = "outbox";

#[derive(Debug, Deserialize, Default)]
struct PpeConfigFile {
    db_path: Option<String>,
    output_dir: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    llm: Option<LlmConfigFile>,
    labels: Option<LabelsConfigFile>,
    mail: Option<MailConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    url: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_threshold: Option<f64>,
    iou_threshold: Option<f64>,
    class_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct LlmConfigFile {
    url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct LabelsConfigFile {
    violation: Option<Vec<String>>,
    safe: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct MailConfigFile {
    recipient: Option<String>,
    sender: Option<String>,
    spool_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    Stub,
    Http,
    Tract,
}

impl DetectorKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "stub" => Ok(DetectorKind::Stub),
            "http" => Ok(DetectorKind::Http),
            "tract" => Ok(DetectorKind::Tract),
            other => Err(anyhow!(
                "unknown detector backend '{}'; expected stub, http or tract",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PpeConfig {
    pub db_path: String,
    pub output_dir: PathBuf,
    pub api_addr: String,
    pub max_body_bytes: usize,
    pub detector: DetectorSettings,
    pub llm: LlmSettings,
    pub labels: LabelRules,
    pub mail: MailSettings,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub url: Option<String>,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence_threshold: f64,
    pub iou_threshold: f64,
    pub class_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MailSettings {
    pub recipient: String,
    pub sender: String,
    pub spool_dir: PathBuf,
}

impl PpeConfig {
    /// Load from `PPE_CONFIG` (TOML or JSON) when set, then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PPE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PpeConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let output_dir = file
            .output_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let api = file.api.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let llm = file.llm.unwrap_or_default();
        let mail = file.mail.unwrap_or_default();

        let defaults = LabelRules::default();
        let labels = match file.labels {
            Some(labels) => LabelRules {
                violation: labels
                    .violation
                    .map(|v| v.into_iter().collect())
                    .unwrap_or(defaults.violation),
                safe: labels
                    .safe
                    .map(|v| v.into_iter().collect())
                    .unwrap_or(defaults.safe),
            },
            None => defaults,
        };

        let kind = match detector.backend.as_deref() {
            Some(value) => DetectorKind::parse(value)?,
            None => DetectorKind::Stub,
        };
        let class_names = match detector.class_names {
            Some(names) => names,
            None => labels
                .violation
                .iter()
                .chain(labels.safe.iter())
                .cloned()
                .collect(),
        };

        Ok(Self {
            db_path,
            output_dir,
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_body_bytes: api.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            detector: DetectorSettings {
                kind,
                url: detector.url,
                model_path: detector.model_path,
                input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                iou_threshold: detector.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
                class_names,
            },
            llm: LlmSettings {
                url: llm.url.unwrap_or_else(|| DEFAULT_LLM_URL.to_string()),
                model: llm.model.unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
                temperature: llm.temperature.unwrap_or(0.0),
                timeout: Duration::from_secs(llm.timeout_secs.unwrap_or(DEFAULT_LLM_TIMEOUT_SECS)),
            },
            labels,
            mail: MailSettings {
                recipient: mail
                    .recipient
                    .unwrap_or_else(|| DEFAULT_MAIL_RECIPIENT.to_string()),
                sender: mail.sender.unwrap_or_else(|| DEFAULT_MAIL_SENDER.to_string()),
                spool_dir: mail
                    .spool_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SPOOL_DIR)),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("PPE_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = non_empty_env("PPE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(addr) = non_empty_env("PPE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(backend) = non_empty_env("PPE_DETECTOR_BACKEND") {
            self.detector.kind = DetectorKind::parse(&backend)?;
        }
        if let Some(url) = non_empty_env("PPE_DETECTOR_URL") {
            self.detector.url = Some(url);
        }
        if let Some(path) = non_empty_env("PPE_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(url) = non_empty_env("PPE_LLM_URL") {
            self.llm.url = url;
        }
        if let Some(model) = non_empty_env("PPE_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(labels) = non_empty_env("PPE_VIOLATION_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.labels.violation = parsed.into_iter().collect();
            }
        }
        if let Some(labels) = non_empty_env("PPE_SAFE_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.labels.safe = parsed.into_iter().collect();
            }
        }
        if let Some(recipient) = non_empty_env("PPE_MAIL_RECIPIENT") {
            self.mail.recipient = recipient;
        }
        if let Some(dir) = non_empty_env("PPE_MAIL_SPOOL_DIR") {
            self.mail.spool_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.labels = LabelRules::new(&self.labels.violation, &self.labels.safe)?;

        match self.detector.kind {
            DetectorKind::Stub => {}
            DetectorKind::Http => {
                let url = self
                    .detector
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow!("http detector backend requires detector.url"))?;
                url::Url::parse(url)
                    .map_err(|e| anyhow!("invalid detector url '{}': {}", url, e))?;
            }
            DetectorKind::Tract => {
                if self.detector.model_path.is_none() {
                    return Err(anyhow!("tract detector backend requires detector.model_path"));
                }
                if self.detector.class_names.is_empty() {
                    return Err(anyhow!("tract detector backend requires class_names"));
                }
            }
        }
        for (name, value) in [
            ("confidence_threshold", self.detector.confidence_threshold),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("detector.{} must be within 0..=1", name));
            }
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector.input_size must be greater than zero"));
        }
        url::Url::parse(&self.llm.url)
            .map_err(|e| anyhow!("invalid llm url '{}': {}", self.llm.url, e))?;
        if self.max_body_bytes == 0 {
            return Err(anyhow!("api.max_body_bytes must be greater than zero"));
        }
        Ok(())
    }
}

impl DetectorSettings {
    /// Build the backend registry this configuration selects.
    pub fn build_registry(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        match self.kind {
            DetectorKind::Stub => registry.register(StubBackend::default()),
            DetectorKind::Http => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow!("http detector backend requires detector.url"))?;
                registry.register(HttpBackend::new(url)?);
            }
            #[cfg(feature = "backend-tract")]
            DetectorKind::Tract => {
                let path = self
                    .model_path
                    .as_ref()
                    .ok_or_else(|| anyhow!("tract detector backend requires detector.model_path"))?;
                let backend = crate::detect::backends::TractBackend::new(
                    path,
                    self.input_size,
                    self.class_names.clone(),
                )?
                .with_thresholds(self.confidence_threshold, self.iou_threshold);
                registry.register(backend);
            }
            #[cfg(not(feature = "backend-tract"))]
            DetectorKind::Tract => {
                return Err(anyhow!(
                    "tract detector backend requires building with --features backend-tract"
                ));
            }
        }
        Ok(registry)
    }
}

impl LlmSettings {
    pub fn ollama_config(&self) -> OllamaConfig {
        OllamaConfig {
            base_url: self.url.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            timeout: self.timeout,
        }
    }
}

fn read_config_file(path: &Path) -> Result<PpeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut cfg = PpeConfig::from_file(PpeConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.db_path, DEFAULT_DB_PATH);
        assert_eq!(cfg.detector.kind, DetectorKind::Stub);
        assert_eq!(cfg.labels, LabelRules::default());
        assert_eq!(
            cfg.detector.class_names,
            vec!["no_glove", "no_goggles", "glove", "goggles"]
        );
    }

    #[test]
    fn split_csv_drops_blanks() {
        assert_eq!(split_csv(" a, ,b,,c "), vec!["a", "b", "c"]);
    }

    #[test]
    fn stub_settings_build_a_registry() {
        let cfg = PpeConfig::from_file(PpeConfigFile::default()).unwrap();
        let registry = cfg.detector.build_registry().unwrap();
        assert_eq!(registry.default_name(), Some("stub"));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(DetectorKind::parse("gpu").is_err());
        assert_eq!(DetectorKind::parse(" HTTP ").unwrap(), DetectorKind::Http);
    }
}
