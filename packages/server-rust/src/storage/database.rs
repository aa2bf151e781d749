//! Downstream record sinks.

use std::collections::HashSet;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use triage_core::{AnalysisRecord, Status, Submission};

use crate::traits::Database;

#[derive(Debug, Default)]
struct Ledger {
    analyses: Vec<AnalysisRecord>,
    analysis_keys: HashSet<(String, Status)>,
    submissions: Vec<Submission>,
    submission_ids: HashSet<String>,
    duplicates: usize,
}

/// Database held in memory, in submission order.
///
/// Repeated submits of the same `(analysis id, status)` or submission id are
/// counted and dropped.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    ledger: Mutex<Ledger>,
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted analysis records, oldest first.
    #[must_use]
    pub fn analyses(&self) -> Vec<AnalysisRecord> {
        self.ledger.lock().analyses.clone()
    }

    /// Accepted submissions, oldest first.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.ledger.lock().submissions.clone()
    }

    /// Number of submits dropped as repeats.
    #[must_use]
    pub fn duplicates(&self) -> usize {
        self.ledger.lock().duplicates
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn submit_analysis(&self, record: &AnalysisRecord) -> anyhow::Result<()> {
        let mut ledger = self.ledger.lock();
        if ledger
            .analysis_keys
            .insert((record.id.clone(), record.status))
        {
            ledger.analyses.push(record.clone());
        } else {
            ledger.duplicates += 1;
            tracing::debug!(id = %record.id, status = %record.status, "duplicate analysis submit dropped");
        }
        Ok(())
    }

    async fn submit_submission(&self, submission: &Submission) -> anyhow::Result<()> {
        let mut ledger = self.ledger.lock();
        if ledger.submission_ids.insert(submission.id.clone()) {
            ledger.submissions.push(submission.clone());
        } else {
            ledger.duplicates += 1;
            tracing::debug!(id = %submission.id, "duplicate submission dropped");
        }
        Ok(())
    }
}

/// Database service reached over HTTP.
///
/// Records are POSTed as JSON to `{base_url}/analyses` and
/// `{base_url}/submissions`; the service owns deduplication.
#[derive(Debug, Clone)]
pub struct HttpDatabase {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDatabase {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post<T: serde::Serialize + Sync>(&self, path: &str, body: &T) -> anyhow::Result<()> {
        let url = self.endpoint(path);
        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        Ok(())
    }
}

#[async_trait]
impl Database for HttpDatabase {
    async fn submit_analysis(&self, record: &AnalysisRecord) -> anyhow::Result<()> {
        self.post("analyses", record).await
    }

    async fn submit_submission(&self, submission: &Submission) -> anyhow::Result<()> {
        self.post("submissions", submission).await
    }
}
