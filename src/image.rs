//! Image resolution with a process-wide cache.
//!
//! Every fixture image is identified by a key: the registry reference for
//! published images, or `fixture-dock/<name>:<digest>` for images built from
//! a local context, where the digest covers every file in the context. The
//! key makes an unchanged definition reuse its image (even one built by an
//! earlier process) while an edited one gets rebuilt.
//!
//! Resolution is double-checked under a lock per key, so N concurrent first
//! requests for the same image trigger exactly one build while requests for
//! different images proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use crate::engine::{ContainerEngine, EngineResult};
use crate::error::BuildFailure;
use crate::fixture::{FixtureDescriptor, ImageSource};

/// Hex characters of the context digest used in image tags.
const DIGEST_LEN: usize = 12;

/// A runnable image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Engine image id.
    pub id: String,
    /// Cache key (tag or registry reference).
    pub key: String,
    /// When this process resolved the image.
    pub built_at: DateTime<Utc>,
}

/// Resolved images by key, plus one build lock per key.
///
/// Entries live until the process exits.
#[derive(Debug, Default)]
pub struct ImageCache {
    images: RwLock<HashMap<String, Image>>,
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every environment in this process.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ImageCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ImageCache::new())))
    }

    pub async fn get(&self, key: &str) -> Option<Image> {
        self.images.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.images.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.images.read().await.is_empty()
    }

    async fn insert(&self, image: Image) {
        self.images.write().await.insert(image.key.clone(), image);
    }

    async fn build_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.build_locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

/// Resolves fixture descriptors to runnable images.
pub struct ImageProvider {
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<ImageCache>,
}

impl ImageProvider {
    pub fn new(engine: Arc<dyn ContainerEngine>, cache: Arc<ImageCache>) -> Self {
        Self { engine, cache }
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Return the image for `descriptor`, building or pulling it at most
    /// once per key. Failures are not retried.
    pub async fn resolve(&self, descriptor: &FixtureDescriptor) -> Result<Image, BuildFailure> {
        let key = image_key(descriptor).await?;

        if let Some(image) = self.cache.get(&key).await {
            tracing::trace!(fixture = %descriptor.name, image = %key, "Image cache hit");
            return Ok(image);
        }

        let lock = self.cache.build_lock(&key).await;
        let _guard = lock.lock().await;

        // Another request may have finished the build while we waited.
        if let Some(image) = self.cache.get(&key).await {
            tracing::debug!(fixture = %descriptor.name, image = %key, "Image resolved by concurrent request");
            return Ok(image);
        }

        let id = self
            .materialize(descriptor, &key)
            .await
            .map_err(|e| BuildFailure {
                fixture: descriptor.name.clone(),
                image: key.clone(),
                reason: e.to_string(),
            })?;

        let image = Image {
            id,
            key,
            built_at: Utc::now(),
        };
        self.cache.insert(image.clone()).await;

        tracing::info!(
            fixture = %descriptor.name,
            image = %image.key,
            id = %image.id,
            "Image ready"
        );
        Ok(image)
    }

    async fn materialize(&self, descriptor: &FixtureDescriptor, key: &str) -> EngineResult<String> {
        if let Some(id) = self.engine.image_id(key).await? {
            tracing::debug!(fixture = %descriptor.name, image = %key, "Reusing local image");
            return Ok(id);
        }

        match &descriptor.image {
            ImageSource::Registry { reference } => self.engine.pull_image(reference).await,
            ImageSource::Build {
                context_dir,
                dockerfile,
            } => self.engine.build_image(context_dir, dockerfile, key).await,
        }
    }
}

/// Cache key for a descriptor's image.
pub async fn image_key(descriptor: &FixtureDescriptor) -> Result<String, BuildFailure> {
    match &descriptor.image {
        ImageSource::Registry { reference } => Ok(reference.clone()),
        ImageSource::Build { context_dir, .. } => {
            let dir = context_dir.clone();
            let digest = tokio::task::spawn_blocking(move || context_digest(&dir))
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map_err(|e| e.to_string()))
                .map_err(|reason| BuildFailure {
                    fixture: descriptor.name.clone(),
                    image: context_dir.display().to_string(),
                    reason: format!("cannot read build context: {reason}"),
                })?;
            Ok(format!("fixture-dock/{}:{}", descriptor.name, digest))
        }
    }
}

/// Digest over the relative path and content of every file under `dir`.
pub fn context_digest(dir: &Path) -> std::io::Result<String> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for (relative, path) in &files {
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(std::fs::read(path)?);
        hasher.update([0u8]);
    }

    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(DIGEST_LEN);
    Ok(digest)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((relative, path));
        }
    }
    Ok(())
}
