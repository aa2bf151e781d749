//! Detonates file observables in a sandbox and folds the report back into the
//! analysis.
//!
//! Two hops: `run` uploads the file and schedules `get_results`; each
//! `get_results` polls the task and either reschedules itself or finishes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use triage_core::{
    Analysis, Callback, DetectionPoint, File, Fqdn, Invocation, Ipv4, Ipv6, Tag,
};

use crate::service::{
    AnalysisModule, Analyzer, MethodTable, ModuleEnv, ServiceContext, Step,
};

/// Condensed sandbox verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxReport {
    pub score: f64,
    #[serde(default)]
    pub signatures: Vec<String>,
    /// Contacted IP addresses.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Resolved domain names.
    #[serde(default)]
    pub domains: Vec<String>,
}

/// A malware sandbox.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    /// Submits a file for detonation, returning the task id.
    async fn submit(&self, path: &Path, name: &str) -> anyhow::Result<String>;

    /// Report of `task_id`, `None` while the task is still running.
    async fn report(&self, task_id: &str) -> anyhow::Result<Option<SandboxReport>>;
}

// ---------------------------------------------------------------------------
// HttpSandbox
// ---------------------------------------------------------------------------

/// Client for a Cuckoo-style REST API.
#[derive(Debug, Clone)]
pub struct HttpSandbox {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct CreateResponse {
    task_id: u64,
}

#[derive(Deserialize)]
struct ViewResponse {
    task: TaskView,
}

#[derive(Deserialize)]
struct TaskView {
    status: String,
}

#[derive(Default, Deserialize)]
struct CuckooReport {
    #[serde(default)]
    info: ReportInfo,
    #[serde(default)]
    signatures: Vec<Signature>,
    #[serde(default)]
    network: Network,
}

#[derive(Default, Deserialize)]
struct ReportInfo {
    #[serde(default)]
    score: f64,
}

#[derive(Deserialize)]
struct Signature {
    name: String,
}

#[derive(Default, Deserialize)]
struct Network {
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    domains: Vec<DomainEntry>,
}

#[derive(Deserialize)]
struct DomainEntry {
    domain: String,
}

impl From<CuckooReport> for SandboxReport {
    fn from(report: CuckooReport) -> Self {
        Self {
            score: report.info.score,
            signatures: report.signatures.into_iter().map(|s| s.name).collect(),
            hosts: report.network.hosts,
            domains: report
                .network
                .domains
                .into_iter()
                .map(|d| d.domain)
                .collect(),
        }
    }
}

impl HttpSandbox {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl SandboxClient for HttpSandbox {
    async fn submit(&self, path: &Path, name: &str) -> anyhow::Result<String> {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let part = reqwest::multipart::Part::bytes(content).file_name(name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let created: CreateResponse = self
            .request(reqwest::Method::POST, "/tasks/create/file")
            .multipart(form)
            .send()
            .await
            .context("submitting to sandbox")?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.task_id.to_string())
    }

    async fn report(&self, task_id: &str) -> anyhow::Result<Option<SandboxReport>> {
        let view: ViewResponse = self
            .request(reqwest::Method::GET, &format!("/tasks/view/{task_id}"))
            .send()
            .await
            .context("polling sandbox task")?
            .error_for_status()?
            .json()
            .await?;
        if view.task.status != "reported" {
            return Ok(None);
        }

        let report: CuckooReport = self
            .request(reqwest::Method::GET, &format!("/tasks/report/{task_id}"))
            .send()
            .await
            .context("fetching sandbox report")?
            .error_for_status()?
            .json()
            .await?;
        Ok(Some(report.into()))
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub base_url: String,
    pub poll_delay_seconds: u64,
    /// Polls before giving up on a task.
    pub max_polls: u32,
    /// Score at which the target gets a detection point.
    pub threshold: f64,
    /// Name of the secret holding the API token, if the sandbox needs one.
    pub token_secret: Option<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            poll_delay_seconds: 5,
            max_polls: 60,
            threshold: 5.0,
            token_secret: None,
        }
    }
}

impl SandboxSettings {
    fn poll_delay(&self) -> Duration {
        Duration::from_secs(self.poll_delay_seconds)
    }
}

/// Multi-hop analyzer for `file` observables.
#[derive(Debug, Default)]
pub struct Sandbox;

/// The injected client (`ServiceContext::with_extension`), else an
/// [`HttpSandbox`] built from settings.
async fn client(env: &ModuleEnv<'_, SandboxSettings>) -> anyhow::Result<Arc<dyn SandboxClient>> {
    if let Some(client) = env.ctx.extension::<Arc<dyn SandboxClient>>() {
        return Ok(Arc::clone(&*client));
    }
    let token = match &env.settings.token_secret {
        Some(name) => Some(env.ctx.secrets.get(name).await?),
        None => None,
    };
    Ok(Arc::new(HttpSandbox::new(&env.settings.base_url, token)))
}

fn fold_report(analysis: &mut Analysis, report: &SandboxReport, threshold: f64) -> anyhow::Result<()> {
    for host in &report.hosts {
        let child = if host.contains(':') {
            analysis.add::<Ipv6>(host)
        } else {
            analysis.add::<Ipv4>(host)
        };
        match child {
            Ok(child) => {
                child.add::<Tag>("sandbox_contacted");
            }
            Err(e) => tracing::debug!(host = %host, error = %e, "skipping unparsable host"),
        }
    }
    for domain in &report.domains {
        match analysis.add::<Fqdn>(domain) {
            Ok(child) => {
                child.add::<Tag>("sandbox_resolved");
            }
            Err(e) => tracing::debug!(domain = %domain, error = %e, "skipping unparsable domain"),
        }
    }
    for signature in &report.signatures {
        analysis.target.add::<Tag>(format!("sandbox:{signature}"));
    }
    if report.score >= threshold {
        analysis
            .target
            .add::<DetectionPoint>(format!("sandbox score {} >= {threshold}", report.score));
    }

    analysis.summary = Some(format!(
        "Sandbox score {} ({} signatures)",
        report.score,
        report.signatures.len()
    ));
    analysis.details = serde_json::to_value(report)?;
    Ok(())
}

async fn get_results(
    module: &mut AnalysisModule<Sandbox>,
    ctx: &ServiceContext,
    inv: Invocation,
) -> anyhow::Result<Step> {
    let env = module.env(ctx)?;
    let task_id: String = inv.arg(0)?;
    let client = client(&env).await?;
    let (_, analysis) = module.parts();

    if let Some(report) = client.report(&task_id).await? {
        tracing::info!(task = %task_id, score = report.score, "sandbox report received");
        fold_report(analysis, &report, env.settings.threshold)?;
        return Ok(Step::Done);
    }

    let polls = analysis.state::<u32>("polls").unwrap_or(0) + 1;
    if polls >= env.settings.max_polls {
        tracing::warn!(task = %task_id, polls, "sandbox task never reported");
        analysis.summary = Some("Sandbox analysis timed out".to_string());
        analysis.details = json!({"task_id": task_id, "timed_out": true});
        return Ok(Step::Done);
    }
    analysis.set_state("polls", polls)?;
    Ok(Callback::new("get_results")
        .arg(task_id)
        .after(env.settings.poll_delay())
        .into())
}

#[async_trait]
impl Analyzer for Sandbox {
    const TYPE: &'static str = "sandbox";
    type Settings = SandboxSettings;

    async fn should_run(
        &self,
        analysis: &Analysis,
        _env: &ModuleEnv<'_, SandboxSettings>,
    ) -> anyhow::Result<bool> {
        Ok(analysis.target.is::<File>())
    }

    async fn execute(
        &self,
        analysis: &mut Analysis,
        env: &ModuleEnv<'_, SandboxSettings>,
    ) -> anyhow::Result<Step> {
        let path = env.ctx.objects.download(&analysis.target.value).await?;
        let name = analysis.target.display_value().to_string();
        let task_id = client(env).await?.submit(&path, &name).await?;
        tracing::info!(task = %task_id, file = %name, "submitted to sandbox");

        analysis.set_state("task_id", &task_id)?;
        Ok(Callback::new("get_results")
            .arg(task_id)
            .after(env.settings.poll_delay())
            .into())
    }

    fn continuations(table: MethodTable<AnalysisModule<Self>>) -> MethodTable<AnalysisModule<Self>> {
        table.method("get_results", |module, ctx, inv| Box::pin(get_results(module, ctx, inv)))
    }
}
