use serde::{Deserialize, Serialize};

pub const BASE_MODEL_ID: &str = "black-forest-labs/FLUX.1-Kontext-dev";
pub const REDUCED_WEIGHTS_REPO: &str = "Comfy-Org/flux1-kontext-dev_ComfyUI";
pub const REDUCED_WEIGHTS_FILE: &str =
    "split_files/diffusion_models/flux1-dev-kontext_fp8_scaled.safetensors";

/// Weight-precision variant. Selects the pipeline construction path; any
/// string other than the two canonical labels is rejected at parse time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    #[default]
    Full,
    Fp8,
}

serde_plain::derive_fromstr_from_deserialize!(ModelVariant);
serde_plain::derive_display_from_serialize!(ModelVariant);

impl ModelVariant {
    /// Identifying label installed alongside the loaded pipeline.
    pub fn model_id(&self) -> String {
        match self {
            ModelVariant::Full => BASE_MODEL_ID.to_string(),
            ModelVariant::Fp8 => format!("{BASE_MODEL_ID} + FP8"),
        }
    }
}

/// Process-start-time model configuration; never mutated after construction.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub variant: ModelVariant,
    pub preload: bool,
    pub hf_token: Option<String>,
}

impl ModelConfig {
    pub fn new(variant: ModelVariant, preload: bool, hf_token: Option<String>) -> Self {
        // An empty token env var means "no token".
        let hf_token = hf_token.filter(|t| !t.is_empty());
        Self {
            variant,
            preload,
            hf_token,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            variant: ModelVariant::default(),
            preload: true,
            hf_token: None,
        }
    }
}

/// Only a case-insensitive "true" counts as true; everything else is false.
pub fn truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_parses_canonical_labels() {
        assert_eq!("full".parse::<ModelVariant>().unwrap(), ModelVariant::Full);
        assert_eq!("fp8".parse::<ModelVariant>().unwrap(), ModelVariant::Fp8);
    }

    #[test]
    fn variant_rejects_unknown_labels() {
        assert!("int8".parse::<ModelVariant>().is_err());
        assert!("".parse::<ModelVariant>().is_err());
        assert!("fp16".parse::<ModelVariant>().is_err());
    }

    #[test]
    fn variant_display_round_trips() {
        assert_eq!(ModelVariant::Full.to_string(), "full");
        assert_eq!(ModelVariant::Fp8.to_string(), "fp8");
    }

    #[test]
    fn model_id_carries_variant_marker() {
        assert_eq!(ModelVariant::Full.model_id(), BASE_MODEL_ID);
        assert_eq!(
            ModelVariant::Fp8.model_id(),
            format!("{BASE_MODEL_ID} + FP8")
        );
    }

    #[test]
    fn empty_token_is_treated_as_absent() {
        let config = ModelConfig::new(ModelVariant::Full, true, Some(String::new()));
        assert_eq!(config.hf_token, None);
        let config = ModelConfig::new(ModelVariant::Full, true, Some("hf_abc".into()));
        assert_eq!(config.hf_token.as_deref(), Some("hf_abc"));
    }

    #[test]
    fn truthy_matches_original_semantics() {
        assert!(truthy("true"));
        assert!(truthy("True"));
        assert!(truthy("TRUE"));
        assert!(!truthy("false"));
        assert!(!truthy("1"));
        assert!(!truthy("yes"));
        assert!(!truthy(""));
    }
}
