/// Request-level failures of the detection and reporting paths.
///
/// Only these two kinds escape to the transport layer. Query gateway outcomes
/// never do; see [`crate::query::QueryOutcome`].
#[derive(Debug)]
pub enum PipelineError {
    /// Image decoding or the detection model failed. Nothing was persisted.
    ModelInference(anyhow::Error),
    /// The violation store failed. The in-flight unit was rolled back.
    Persistence(anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ModelInference(_) => "model_inference",
            PipelineError::Persistence(_) => "persistence",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            PipelineError::ModelInference(err) | PipelineError::Persistence(err) => {
                format!("{:#}", err)
            }
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::ModelInference(err) => write!(f, "model inference failed: {:#}", err),
            PipelineError::Persistence(err) => write!(f, "persistence failed: {:#}", err),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::ModelInference(err) | PipelineError::Persistence(err) => {
                Some(err.as_ref())
            }
        }
    }
}
