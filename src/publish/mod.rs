//! Artifact publishing: upload a run directory to blob storage under a
//! run-scoped prefix, keeping its relative layout.

pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::config::{StorageBackend, StorageConfig};

use self::store::{content_type_for, BlobStore, HttpBlobStore, LocalBlobStore};

/// Uploads in flight at once for one run.
const UPLOAD_CONCURRENCY: usize = 4;

/// Result of publishing one run.
#[derive(Debug, Clone, Default)]
pub struct Published {
    /// Relative paths that were uploaded, sorted.
    pub uploaded: Vec<String>,
    /// Public URL of the HTML report, if it was part of the upload.
    pub report_url: Option<String>,
}

pub struct ArtifactPublisher {
    store: Option<Arc<dyn BlobStore>>,
    config: StorageConfig,
    report_dir: String,
}

impl ArtifactPublisher {
    /// Build the publisher for the configured backend.
    pub fn from_config(config: &StorageConfig, report_dir: &str) -> Result<Self> {
        let store: Option<Arc<dyn BlobStore>> = match config.backend {
            StorageBackend::Disabled => None,
            StorageBackend::Local => Some(Arc::new(LocalBlobStore::new(
                config.local_root.clone(),
                &config.bucket,
            ))),
            StorageBackend::Http => {
                let endpoint = config
                    .endpoint
                    .as_deref()
                    .context("storage.endpoint is required for the http backend")?;
                Some(Arc::new(HttpBlobStore::new(
                    endpoint,
                    &config.bucket,
                    config.token.clone(),
                )?))
            }
        };
        Ok(Self::with_store(store, config.clone(), report_dir))
    }

    pub fn with_store(
        store: Option<Arc<dyn BlobStore>>,
        config: StorageConfig,
        report_dir: &str,
    ) -> Self {
        Self {
            store,
            config,
            report_dir: report_dir.trim_matches('/').to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Object key prefix for a run: `{prefix}/{run_id}`.
    pub fn run_prefix(&self, run_id: &str) -> String {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            run_id.to_string()
        } else {
            format!("{prefix}/{run_id}")
        }
    }

    /// Public URL of an object inside a run.
    pub fn public_url(&self, run_id: &str, relative: &str) -> String {
        format!(
            "https://{}/{}/{}/{}",
            self.config.public_host.trim_matches('/'),
            self.config.bucket.trim_matches('/'),
            self.run_prefix(run_id),
            relative.trim_start_matches('/')
        )
    }

    /// Relative path of the report entry point inside a run directory.
    pub fn report_object(&self) -> String {
        format!("{}/index.html", self.report_dir)
    }

    pub fn report_url(&self, run_id: &str) -> String {
        self.public_url(run_id, &self.report_object())
    }

    /// Upload every regular file below `work_dir`. The directory is treated
    /// as read-only from here on.
    pub async fn publish(&self, run_id: &str, work_dir: &Path) -> Result<Published> {
        let Some(store) = self.store.clone() else {
            debug!(run_id, "artifact publishing disabled");
            return Ok(Published::default());
        };

        let files = collect_files(work_dir)?;
        let prefix = self.run_prefix(run_id);
        info!(run_id, files = files.len(), backend = store.name(), "publishing artifacts");

        let mut uploaded: Vec<String> = stream::iter(files)
            .map(|(path, relative)| {
                let store = store.clone();
                let key = format!("{prefix}/{relative}");
                async move {
                    let body = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    store
                        .put(&key, Bytes::from(body), content_type_for(&relative))
                        .await
                        .with_context(|| format!("failed to upload {key}"))?;
                    Ok::<_, anyhow::Error>(relative)
                }
            })
            .buffer_unordered(UPLOAD_CONCURRENCY)
            .try_collect()
            .await?;
        uploaded.sort();

        let report = self.report_object();
        let report_url = if uploaded.iter().any(|r| *r == report) {
            Some(self.report_url(run_id))
        } else {
            warn!(run_id, report = %report, "no HTML report in run directory");
            None
        };

        Ok(Published {
            uploaded,
            report_url,
        })
    }
}

/// All regular files under `root` as (absolute path, `/`-joined relative
/// path), sorted by relative path. Symlinks are skipped.
pub fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .with_context(|| format!("{} escaped the run dir", path.display()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((path, relative));
            }
        }
    }
    out.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<Vec<(String, String)>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl BlobStore for MemoryStore {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn put(&self, key: &str, _body: Bytes, content_type: &str) -> Result<()> {
            if self.fail_on.is_some_and(|f| key.ends_with(f)) {
                anyhow::bail!("injected failure");
            }
            self.objects
                .lock()
                .unwrap()
                .push((key.to_string(), content_type.to_string()));
            Ok(())
        }
    }

    fn storage() -> StorageConfig {
        StorageConfig {
            public_host: "storage.example.com".to_string(),
            bucket: "qa".to_string(),
            prefix: "/builds/".to_string(),
            ..StorageConfig::default()
        }
    }

    fn run_dir() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("playwright-report/data")).unwrap();
        std::fs::write(dir.path().join("playwright-report/index.html"), "<html/>").unwrap();
        std::fs::write(dir.path().join("playwright-report/data/a.png"), [0u8; 4]).unwrap();
        std::fs::write(dir.path().join("summary.json"), "{}").unwrap();
        dir
    }

    #[test]
    fn test_public_report_url_shape() {
        let publisher = ArtifactPublisher::with_store(None, storage(), "playwright-report");
        assert_eq!(
            publisher.report_url("run-42"),
            "https://storage.example.com/qa/builds/run-42/playwright-report/index.html"
        );

        let no_prefix = StorageConfig {
            prefix: String::new(),
            ..storage()
        };
        let publisher = ArtifactPublisher::with_store(None, no_prefix, "playwright-report");
        assert_eq!(publisher.run_prefix("r"), "r");
    }

    #[test]
    fn test_collect_files_is_relative_and_sorted() {
        let dir = run_dir();
        let rel: Vec<String> = collect_files(dir.path()).unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(
            rel,
            vec![
                "playwright-report/data/a.png",
                "playwright-report/index.html",
                "summary.json"
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_preserves_structure() {
        let dir = run_dir();
        let store = Arc::new(MemoryStore::default());
        let publisher =
            ArtifactPublisher::with_store(Some(store.clone()), storage(), "playwright-report");

        let published = publisher.publish("run-1", dir.path()).await.unwrap();
        assert_eq!(published.uploaded.len(), 3);
        assert_eq!(
            published.report_url.as_deref(),
            Some("https://storage.example.com/qa/builds/run-1/playwright-report/index.html")
        );

        let mut objects = store.objects.lock().unwrap().clone();
        objects.sort();
        assert_eq!(objects[0].0, "builds/run-1/playwright-report/data/a.png");
        assert_eq!(objects[0].1, "image/png");
        assert_eq!(objects[2].0, "builds/run-1/summary.json");
    }

    #[tokio::test]
    async fn test_publish_without_report_has_no_url() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("stdout.log"), "x").unwrap();
        let publisher = ArtifactPublisher::with_store(
            Some(Arc::new(MemoryStore::default())),
            storage(),
            "playwright-report",
        );
        let published = publisher.publish("r", dir.path()).await.unwrap();
        assert_eq!(published.uploaded, vec!["stdout.log"]);
        assert!(published.report_url.is_none());
    }

    #[tokio::test]
    async fn test_upload_failure_is_an_error() {
        let dir = run_dir();
        let store = Arc::new(MemoryStore {
            fail_on: Some("summary.json"),
            ..MemoryStore::default()
        });
        let publisher = ArtifactPublisher::with_store(Some(store), storage(), "playwright-report");
        let err = publisher.publish("r", dir.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("injected failure"));
    }

    #[tokio::test]
    async fn test_disabled_publisher_uploads_nothing() {
        let dir = run_dir();
        let publisher = ArtifactPublisher::from_config(&StorageConfig::default(), "playwright-report").unwrap();
        assert!(!publisher.is_enabled());
        let published = publisher.publish("r", dir.path()).await.unwrap();
        assert!(published.uploaded.is_empty());
    }

    #[tokio::test]
    async fn test_local_backend_from_config() {
        let dir = run_dir();
        let dest = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Local,
            local_root: dest.path().to_path_buf(),
            ..storage()
        };
        let publisher = ArtifactPublisher::from_config(&config, "playwright-report").unwrap();
        publisher.publish("run-7", dir.path()).await.unwrap();
        assert!(dest
            .path()
            .join("qa/builds/run-7/playwright-report/index.html")
            .exists());
    }
}
