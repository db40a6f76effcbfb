use thiserror::Error;

/// Failure taxonomy at the inference boundary. Every kind currently maps to
/// the same status; the tag exists so a stricter boundary can split them.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("could not decode input image: {0}")]
    InputDecode(String),
    #[error("device resources exhausted: {0}")]
    ResourceExhaustion(String),
    #[error("{0}")]
    Upstream(String),
}

impl EditError {
    pub fn kind(&self) -> &'static str {
        match self {
            EditError::InputDecode(_) => "input_decode",
            EditError::ResourceExhaustion(_) => "resource_exhaustion",
            EditError::Upstream(_) => "upstream",
        }
    }

    pub fn status(&self) -> u16 {
        500
    }

    /// Folds a load or inference failure into the taxonomy.
    pub fn classify(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let lower = message.to_ascii_lowercase();
        if lower.contains("out of memory") || lower.contains("oom") {
            EditError::ResourceExhaustion(message)
        } else {
            EditError::Upstream(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_spots_memory_exhaustion() {
        let err = EditError::classify(anyhow::anyhow!("CUDA error: out of memory"));
        assert_eq!(err.kind(), "resource_exhaustion");
    }

    #[test]
    fn classify_defaults_to_upstream() {
        let err = EditError::classify(anyhow::anyhow!("shape mismatch"));
        assert_eq!(err.kind(), "upstream");
        assert_eq!(err.to_string(), "shape mismatch");
    }

    #[test]
    fn every_kind_reports_server_error() {
        assert_eq!(EditError::InputDecode("x".into()).status(), 500);
        assert_eq!(EditError::ResourceExhaustion("x".into()).status(), 500);
        assert_eq!(EditError::Upstream("x".into()).status(), 500);
    }
}
