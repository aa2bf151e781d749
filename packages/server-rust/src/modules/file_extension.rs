//! Tags file observables with their extension and flags risky ones.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use triage_core::{Analysis, DetectionPoint, File, Tag};

use crate::service::{Analyzer, ModuleEnv, Step};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileExtensionSettings {
    /// Lower-case extensions that raise a detection point.
    pub risky: Vec<String>,
}

impl Default for FileExtensionSettings {
    fn default() -> Self {
        Self {
            risky: ["exe", "scr", "js", "vbs", "hta", "lnk", "iso", "docm", "xlsm"]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// Single-hop analyzer for `file` observables.
#[derive(Debug, Default)]
pub struct FileExtension;

#[async_trait]
impl Analyzer for FileExtension {
    const TYPE: &'static str = "file_extension";
    type Settings = FileExtensionSettings;

    async fn should_run(
        &self,
        analysis: &Analysis,
        _env: &ModuleEnv<'_, FileExtensionSettings>,
    ) -> anyhow::Result<bool> {
        Ok(analysis.target.is::<File>() && analysis.target.extension().is_some())
    }

    async fn execute(
        &self,
        analysis: &mut Analysis,
        env: &ModuleEnv<'_, FileExtensionSettings>,
    ) -> anyhow::Result<Step> {
        let Some(extension) = analysis.target.extension() else {
            return Ok(Step::Done);
        };
        let risky = env.settings.risky.iter().any(|r| r.eq_ignore_ascii_case(&extension));

        analysis.target.add::<Tag>(format!("ext:{extension}"));
        if risky {
            analysis
                .target
                .add::<DetectionPoint>(format!("risky file extension .{extension}"));
        }
        analysis.summary = Some(format!("File extension: .{extension}"));
        analysis.details = json!({"extension": extension, "risky": risky});
        Ok(Step::Done)
    }
}

#[cfg(test)]
mod tests {
    use triage_core::{DisplayValue, Observable, Status};

    use super::*;
    use crate::service::{AnalysisModule, Dispatchable, ServiceRegistry};
    use crate::testing::Harness;

    fn file(name: &str) -> Observable {
        let mut o = Observable::new::<File>("f".repeat(64)).unwrap();
        o.add::<DisplayValue>(name);
        o
    }

    async fn analyze(harness: &Harness, target: Observable) -> Status {
        let mut registry = ServiceRegistry::new();
        registry.register_analyzer::<FileExtension>().unwrap();
        let spawn = registry.spawn_analysis(FileExtension::TYPE, None, target).unwrap();
        let mut service = registry
            .construct(&harness.ctx.catalog, spawn.service.clone())
            .unwrap();
        service
            .invoke(&harness.ctx, "run", spawn.invocation())
            .await
            .unwrap();
        service.finish(&harness.ctx).await.unwrap();
        let module = service
            .as_any()
            .downcast_ref::<AnalysisModule<FileExtension>>()
            .unwrap();
        assert_eq!(module.id().kind, "file_extension");
        module.analysis.status
    }

    #[tokio::test]
    async fn risky_extension_gets_detection_point() {
        let harness = Harness::new();
        assert_eq!(analyze(&harness, file("invoice.PDF.EXE")).await, Status::Complete);

        let record = &harness.database.analyses()[0];
        assert_eq!(record.target.tags(), vec!["ext:exe"]);
        assert_eq!(record.target.detection_points(), vec!["risky file extension .exe"]);
        assert_eq!(record.details["risky"], json!(true));
    }

    #[tokio::test]
    async fn benign_extension_is_only_tagged() {
        let harness = Harness::new();
        analyze(&harness, file("notes.txt")).await;
        let record = &harness.database.analyses()[0];
        assert_eq!(record.target.tags(), vec!["ext:txt"]);
        assert!(record.target.detection_points().is_empty());
    }

    #[tokio::test]
    async fn file_without_extension_is_ignored() {
        let harness = Harness::new();
        assert_eq!(analyze(&harness, file("README")).await, Status::Ignored);
        assert_eq!(harness.database.analyses()[0].status, Status::Ignored);
    }

    #[tokio::test]
    async fn configured_risky_list_replaces_default() {
        let harness = Harness::with_modules(json!({"file_extension": {"risky": ["txt"]}}));
        analyze(&harness, file("notes.txt")).await;
        assert_eq!(harness.database.analyses()[0].details["risky"], json!(true));
    }
}
