//! Content-addressed object storage for file observables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use triage_core::{Analysis, DisplayValue, File, Observable};
use uuid::Uuid;

use crate::traits::ObjectStore;

/// Object store in a local directory; each object is named by the hex
/// SHA-256 of its content.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, id: &str) -> anyhow::Result<PathBuf> {
        if id.len() != 64 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("`{id}` is not an object id");
        }
        Ok(self.root.join(id.to_ascii_lowercase()))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, path: &Path) -> anyhow::Result<String> {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let id = hex::encode(Sha256::digest(&content));

        let target = self.root.join(&id);
        let exists = tokio::fs::try_exists(&target)
            .await
            .with_context(|| format!("checking {}", target.display()))?;
        if !exists {
            tokio::fs::create_dir_all(&self.root)
                .await
                .with_context(|| format!("creating {}", self.root.display()))?;
            // Objects only appear under their id once fully written.
            let partial = self.root.join(format!(".{id}.{}.part", Uuid::new_v4()));
            if let Err(e) = write_then_rename(&partial, &target, &content).await {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        }
        tracing::debug!(id = %id, source = %path.display(), "object stored");
        Ok(id)
    }

    async fn download(&self, id: &str) -> anyhow::Result<PathBuf> {
        let path = self.path_of(id)?;
        let exists = tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if !exists {
            anyhow::bail!("object `{id}` not found");
        }
        Ok(path)
    }
}

async fn write_then_rename(partial: &Path, target: &Path, content: &[u8]) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(partial)
        .await
        .with_context(|| format!("creating {}", partial.display()))?;
    file.write_all(content)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", partial.display()))?;
    drop(file);
    tokio::fs::rename(partial, target)
        .await
        .with_context(|| format!("moving object to {}", target.display()))
}

/// Uploads `path` and adds it to `analysis` as a file observable.
///
/// The observable's value is the content hash id; the original file name is
/// kept as its display value.
///
/// # Errors
///
/// Returns the object store's error if the upload fails.
pub async fn add_file<'a>(
    analysis: &'a mut Analysis,
    objects: &dyn ObjectStore,
    path: &Path,
) -> anyhow::Result<&'a mut Observable> {
    let id = objects.upload(path).await?;
    let mut observable = Observable::new::<File>(&id)?;
    if let Some(name) = path.file_name() {
        observable.add::<DisplayValue>(name.to_string_lossy().into_owned());
    }
    Ok(analysis.add_observable(observable))
}
