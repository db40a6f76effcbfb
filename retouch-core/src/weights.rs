use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};

use crate::config::{BASE_MODEL_ID, REDUCED_WEIGHTS_FILE, REDUCED_WEIGHTS_REPO};

// Anything larger is a corrupt length prefix, not a real header.
const MAX_HEADER_LEN: u64 = 100_000_000;

/// Resolves and fetches weight artifacts through the shared hub cache.
/// Repeated fetches of the same (repository, filename) pair are cache hits.
pub struct WeightSource {
    api: Api,
}

impl WeightSource {
    pub fn new(token: Option<String>) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_token(token)
            .build()
            .context("failed to create hub api")?;
        Ok(Self { api })
    }

    /// Base model repository; files resolve lazily through the cache.
    pub fn base_repo(&self) -> ApiRepo {
        self.model_repo(BASE_MODEL_ID)
    }

    pub fn model_repo(&self, id: &str) -> ApiRepo {
        self.api.repo(Repo::model(id.to_string()))
    }

    pub fn model_repo_at(&self, id: &str, revision: &str) -> ApiRepo {
        self.api.repo(Repo::with_revision(
            id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ))
    }

    /// Fetches the reduced-precision single-file core artifact. One attempt;
    /// network and auth failures surface to the caller.
    pub async fn fetch_reduced_core(&self) -> Result<PathBuf> {
        let path = self
            .model_repo(REDUCED_WEIGHTS_REPO)
            .get(REDUCED_WEIGHTS_FILE)
            .await
            .with_context(|| {
                format!("failed to fetch {REDUCED_WEIGHTS_REPO}/{REDUCED_WEIGHTS_FILE}")
            })?;
        validate_safetensors_header(&path)
            .with_context(|| format!("bad weight artifact at {}", path.display()))?;
        Ok(path)
    }
}

/// Rejects truncated or non-safetensors artifacts before the loader mmaps
/// them: checks the length-prefixed JSON header and that every tensor's data
/// range fits the file.
pub fn validate_safetensors_header(path: &Path) -> Result<()> {
    let file_len = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .context("artifact shorter than a safetensors length prefix")?;
    let header_len = u64::from_le_bytes(len_bytes);
    anyhow::ensure!(
        header_len > 0 && header_len <= MAX_HEADER_LEN,
        "implausible safetensors header length {header_len}"
    );
    anyhow::ensure!(8 + header_len <= file_len, "truncated safetensors header");

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .context("truncated safetensors header")?;
    let header: serde_json::Value =
        serde_json::from_slice(&header).context("safetensors header is not valid JSON")?;
    let entries = header
        .as_object()
        .context("safetensors header is not a JSON object")?;

    let mut data_end = 0u64;
    for (name, entry) in entries {
        if name == "__metadata__" {
            continue;
        }
        let end = entry
            .get("data_offsets")
            .and_then(|offsets| offsets.get(1))
            .and_then(|end| end.as_u64())
            .with_context(|| format!("tensor {name} missing data_offsets"))?;
        data_end = data_end.max(end);
    }
    anyhow::ensure!(
        8 + header_len + data_end == file_len,
        "artifact length mismatch: header declares {} data bytes, file holds {}",
        data_end,
        file_len.saturating_sub(8 + header_len)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_artifact(dir: &tempfile::TempDir, header: &[u8], data: &[u8]) -> PathBuf {
        let path = dir.path().join("model.safetensors");
        let mut file = File::create(&path).unwrap();
        file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
        file.write_all(header).unwrap();
        file.write_all(data).unwrap();
        path
    }

    const HEADER: &[u8] = br#"{"t":{"dtype":"F32","shape":[1],"data_offsets":[0,4]}}"#;

    #[test]
    fn accepts_well_formed_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir, HEADER, &[0u8; 4]);
        validate_safetensors_header(&path).unwrap();
    }

    #[test]
    fn rejects_truncated_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir, HEADER, &[0u8; 2]);
        let err = validate_safetensors_header(&path).unwrap_err();
        assert!(err.to_string().contains("length mismatch"), "{err:#}");
    }

    #[test]
    fn rejects_garbage_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir, b"not json at all {{", &[]);
        let err = validate_safetensors_header(&path).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"), "{err:#}");
    }

    #[test]
    fn rejects_stub_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, b"oops").unwrap();
        let err = validate_safetensors_header(&path).unwrap_err();
        assert!(err.to_string().contains("length prefix"), "{err:#}");
    }
}
