use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tracing::{debug, info};

use crate::config::defaults::{
    HF_RESOLVE_BASE_URL, MODEL_DOWNLOAD_TIMEOUT_SECS, MODEL_FILENAME, ONNX_SUBDIR,
    TOKENIZER_FILENAME,
};

/// Resolves a model identifier to a local directory holding the ONNX export and
/// its tokenizer, downloading from the Hugging Face hub when needed.
#[derive(Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
    base_url: String,
    client: reqwest::Client,
}

impl ModelManager {
    pub fn new(models_dir: PathBuf) -> Result<Self> {
        Self::with_base_url(models_dir, HF_RESOLVE_BASE_URL)
    }

    pub fn with_base_url(models_dir: PathBuf, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(MODEL_DOWNLOAD_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            models_dir,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Local directory used to cache a hub repository.
    pub fn cache_dir(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(model_id.replace('/', "--"))
    }

    /// Resolve `model` to a directory usable by [`super::TransformerDetector::load`].
    ///
    /// An existing local directory is returned unchanged. Anything else is treated as
    /// a hub repository id.
    pub async fn resolve(&self, model: &str) -> Result<PathBuf> {
        let local = Path::new(model);
        if local.is_dir() {
            debug!("Using local model directory {}", local.display());
            return Ok(local.to_path_buf());
        }

        let model_dir = self.cache_dir(model);
        if model_files_present(&model_dir) {
            debug!("Model {} already cached at {}", model, model_dir.display());
            return Ok(model_dir);
        }

        self.download_model(model, &model_dir).await?;
        Ok(model_dir)
    }

    async fn download_model(&self, model_id: &str, model_dir: &Path) -> Result<()> {
        info!("Downloading model {} into {}", model_id, model_dir.display());

        let onnx_dir = model_dir.join(ONNX_SUBDIR);
        async_fs::create_dir_all(&onnx_dir)
            .await
            .with_context(|| format!("Failed to create model directory: {}", onnx_dir.display()))?;

        let model_file = onnx_dir.join(MODEL_FILENAME);
        self.download_file(
            &format!("{}/{}/resolve/main/{}/{}", self.base_url, model_id, ONNX_SUBDIR, MODEL_FILENAME),
            &model_file,
        )
        .await
        .context("Failed to download model file")?;

        self.download_file(
            &format!("{}/{}/resolve/main/{}", self.base_url, model_id, TOKENIZER_FILENAME),
            &model_dir.join(TOKENIZER_FILENAME),
        )
        .await
        .context("Failed to download tokenizer file")?;

        let checksum = calculate_checksum(&model_file).await?;
        info!("Model {} downloaded (sha256 {})", model_id, checksum);
        Ok(())
    }

    async fn download_file(&self, url: &str, path: &Path) -> Result<()> {
        if path.exists() {
            debug!("Skipping existing file {}", path.display());
            return Ok(());
        }
        debug!("Downloading {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start download")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Download of {} failed with status: {}",
                url,
                response.status()
            ));
        }

        let content = response
            .bytes()
            .await
            .context("Failed to download file content")?;

        // Partial downloads never land at the final path.
        let partial = path.with_extension("part");
        async_fs::write(&partial, &content)
            .await
            .context("Failed to write downloaded file")?;
        async_fs::rename(&partial, path)
            .await
            .context("Failed to move downloaded file into place")?;

        debug!("Downloaded {}", path.display());
        Ok(())
    }
}

/// Locate the ONNX file inside a model directory (`model.onnx` or `onnx/model.onnx`).
pub fn find_model_file(model_dir: &Path) -> Option<PathBuf> {
    [
        model_dir.join(MODEL_FILENAME),
        model_dir.join(ONNX_SUBDIR).join(MODEL_FILENAME),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

pub fn model_files_present(model_dir: &Path) -> bool {
    find_model_file(model_dir).is_some() && model_dir.join(TOKENIZER_FILENAME).is_file()
}

pub async fn calculate_checksum(path: &Path) -> Result<String> {
    let content = async_fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const MODEL_BYTES: &[u8] = b"onnx-bytes";
    const TOKENIZER_BYTES: &[u8] = b"{\"model\": {}}";

    /// Serve a fake hub on an ephemeral port; returns its base URL and a request counter.
    async fn spawn_hub(with_files: bool) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));

        async fn count(State(hits): State<Arc<AtomicUsize>>) -> StatusCode {
            hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::NOT_FOUND
        }

        let mut app = Router::new();
        if with_files {
            app = app
                .route(
                    "/org/model/resolve/main/onnx/model.onnx",
                    get(|State(hits): State<Arc<AtomicUsize>>| async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        MODEL_BYTES
                    }),
                )
                .route(
                    "/org/model/resolve/main/tokenizer.json",
                    get(|State(hits): State<Arc<AtomicUsize>>| async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        TOKENIZER_BYTES
                    }),
                );
        }
        let app: Router = app.fallback(count).with_state(Arc::clone(&hits));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (format!("http://{}/", addr), hits)
    }

    fn leftover_partials(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in std::fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "part") {
                    found.push(path);
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn test_download_lands_in_cache_dir() {
        let (base_url, hits) = spawn_hub(true).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::with_base_url(dir.path().to_path_buf(), &base_url).unwrap();

        let resolved = manager.resolve("org/model").await.unwrap();
        assert_eq!(resolved, dir.path().join("org--model"));
        assert_eq!(
            std::fs::read(resolved.join(ONNX_SUBDIR).join(MODEL_FILENAME)).unwrap(),
            MODEL_BYTES
        );
        assert_eq!(std::fs::read(resolved.join(TOKENIZER_FILENAME)).unwrap(), TOKENIZER_BYTES);
        assert!(leftover_partials(dir.path()).is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Cached files satisfy the second resolve without touching the hub.
        let again = manager.resolve("org/model").await.unwrap();
        assert_eq!(again, resolved);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_download_skips_files_already_present() {
        let (base_url, hits) = spawn_hub(true).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::with_base_url(dir.path().to_path_buf(), &base_url).unwrap();

        let cached = manager.cache_dir("org/model");
        std::fs::create_dir_all(cached.join(ONNX_SUBDIR)).unwrap();
        std::fs::write(cached.join(ONNX_SUBDIR).join(MODEL_FILENAME), b"local").unwrap();

        manager.resolve("org/model").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::read(cached.join(ONNX_SUBDIR).join(MODEL_FILENAME)).unwrap(),
            b"local"
        );
        assert!(cached.join(TOKENIZER_FILENAME).is_file());
    }

    #[tokio::test]
    async fn test_missing_hub_files_fail_resolution() {
        let (base_url, hits) = spawn_hub(false).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::with_base_url(dir.path().to_path_buf(), &base_url).unwrap();

        let err = manager.resolve("org/model").await.unwrap_err();
        assert!(format!("{:#}", err).contains("404"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let cached = manager.cache_dir("org/model");
        assert!(!cached.join(ONNX_SUBDIR).join(MODEL_FILENAME).exists());
        assert!(leftover_partials(dir.path()).is_empty());
    }

    #[test]
    fn test_cache_dir_flattens_repository_id() {
        let manager = ModelManager::new(PathBuf::from("/tmp/models")).unwrap();
        assert_eq!(
            manager.cache_dir("KRLabsOrg/lettucedect-base-modernbert-en-v1"),
            PathBuf::from("/tmp/models/KRLabsOrg--lettucedect-base-modernbert-en-v1")
        );
    }

    #[test]
    fn test_find_model_file_checks_both_layouts() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_model_file(dir.path()).is_none());

        std::fs::create_dir_all(dir.path().join(ONNX_SUBDIR)).unwrap();
        std::fs::write(dir.path().join(ONNX_SUBDIR).join(MODEL_FILENAME), b"onnx").unwrap();
        assert_eq!(
            find_model_file(dir.path()),
            Some(dir.path().join(ONNX_SUBDIR).join(MODEL_FILENAME))
        );
        assert!(!model_files_present(dir.path()));

        std::fs::write(dir.path().join(TOKENIZER_FILENAME), b"{}").unwrap();
        assert!(model_files_present(dir.path()));
    }

    #[tokio::test]
    async fn test_resolve_prefers_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path().join("cache")).unwrap();
        let model = dir.path().to_str().unwrap();

        let resolved = manager.resolve(model).await.unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[tokio::test]
    async fn test_resolve_uses_cached_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path().to_path_buf()).unwrap();
        let cached = manager.cache_dir("org/model");
        std::fs::create_dir_all(&cached).unwrap();
        std::fs::write(cached.join(MODEL_FILENAME), b"onnx").unwrap();
        std::fs::write(cached.join(TOKENIZER_FILENAME), b"{}").unwrap();

        assert_eq!(manager.resolve("org/model").await.unwrap(), cached);
    }

    #[tokio::test]
    async fn test_checksum_is_hex_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            calculate_checksum(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
