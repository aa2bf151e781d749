//! Collects alert files dropped into a directory.
//!
//! Each `*.json` file modified after the `last_collected` watermark becomes
//! one submission. The file holds a description, optional time and details,
//! and a list of observables in wire form.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use triage_core::Submission;

use crate::service::{Collected, Collector, ModuleEnv};

const WATERMARK: &str = "last_collected";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    pub path: PathBuf,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("alerts"),
        }
    }
}

#[derive(Deserialize)]
struct AlertFile {
    description: String,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    #[serde(default)]
    details: Value,
    #[serde(default)]
    observables: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct Directory;

async fn alert_files(dir: &Path, after: DateTime<Utc>) -> anyhow::Result<Vec<(DateTime<Utc>, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("listing {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = DateTime::<Utc>::from(metadata.modified()?);
        if modified > after {
            files.push((modified, path));
        }
    }
    files.sort();
    Ok(files)
}

/// Stable id for the alert at `path` as of `modified`, so a pass repeated
/// after a failed submit is deduplicated downstream.
fn alert_id(collector: &str, path: &Path, modified: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collector.as_bytes());
    hasher.update([0u8]);
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(modified.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[async_trait]
impl Collector for Directory {
    const TYPE: &'static str = "directory";
    type Settings = DirectorySettings;
    /// Newest modification time seen, if past the stored watermark.
    type Progress = Option<DateTime<Utc>>;

    async fn collect(
        &self,
        env: &ModuleEnv<'_, DirectorySettings>,
    ) -> anyhow::Result<Collected<Self::Progress>> {
        let watermark = env
            .state()
            .get_timestamp(WATERMARK, DateTime::<Utc>::UNIX_EPOCH)
            .await?;
        let files = alert_files(&env.settings.path, watermark).await?;
        let key = env.id.key();

        let mut submissions = Vec::with_capacity(files.len());
        let mut newest = watermark;
        for (modified, path) in files {
            newest = newest.max(modified);
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let alert: AlertFile = match serde_json::from_str(&raw) {
                Ok(alert) => alert,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping unreadable alert file");
                    continue;
                }
            };

            let mut submission =
                Submission::new(key.clone(), alert.description, alert.time.unwrap_or(modified))
                    .with_id(alert_id(&key, &path, modified));
            submission.details = alert.details;
            for value in alert.observables {
                match env.ctx.catalog.decode_observable(value) {
                    Ok(observable) => {
                        submission.add_observable(observable);
                    }
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "skipping invalid observable");
                    }
                }
            }
            submissions.push(submission);
        }

        tracing::debug!(collector = %key, found = submissions.len(), "directory scanned");
        Ok(Collected {
            submissions,
            progress: (newest > watermark).then_some(newest),
        })
    }

    async fn commit(
        &self,
        env: &ModuleEnv<'_, DirectorySettings>,
        progress: Self::Progress,
    ) -> anyhow::Result<()> {
        if let Some(newest) = progress {
            env.state().set_timestamp(WATERMARK, newest).await?;
            tracing::debug!(collector = %env.id.key(), watermark = %newest, "watermark advanced");
        }
        Ok(())
    }
}
