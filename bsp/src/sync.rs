//! One-sweep collection of the workspace model from a connected server.

use serde::Serialize;

use crucible_protocol::bsp::{
    BuildTarget, DependencySourcesItem, DependencySourcesParams, ResourcesItem, ResourcesParams,
    SourcesItem, SourcesParams,
};

use crate::proxy::{BuildServer, RequestError};

/// Everything the workspace reported in one sweep. Sections the server did
/// not answer in time are simply empty.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProjectDetails {
    pub targets: Vec<BuildTarget>,
    pub sources: Vec<SourcesItem>,
    pub resources: Vec<ResourcesItem>,
    pub dependency_sources: Vec<DependencySourcesItem>,
}

/// Queries the target list, then fans out for the sources, resources and
/// dependency sources of every target at once.
pub async fn collect_project_details(
    server: &BuildServer,
) -> Result<ProjectDetails, RequestError> {
    let Some(workspace) = server.workspace_build_targets().await? else {
        return Ok(ProjectDetails::default());
    };
    let targets = workspace.targets;
    if targets.is_empty() {
        tracing::debug!("workspace reports no build targets");
        return Ok(ProjectDetails::default());
    }

    let ids: Vec<_> = targets.iter().map(|target| target.id.clone()).collect();
    tracing::debug!(targets = ids.len(), "collecting project details");
    let sources_params = SourcesParams {
        targets: ids.clone(),
    };
    let resources_params = ResourcesParams {
        targets: ids.clone(),
    };
    let dependency_sources_params = DependencySourcesParams { targets: ids };
    let (sources, resources, dependency_sources) = tokio::try_join!(
        server.build_target_sources(&sources_params),
        server.build_target_resources(&resources_params),
        server.build_target_dependency_sources(&dependency_sources_params),
    )?;

    Ok(ProjectDetails {
        targets,
        sources: sources.map(|result| result.items).unwrap_or_default(),
        resources: resources.map(|result| result.items).unwrap_or_default(),
        dependency_sources: dependency_sources
            .map(|result| result.items)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::collect_project_details;
    use crate::client::LoggingClient;
    use crate::proxy::{BuildServer, RequestError};
    use crate::settings::RequestTimeout;
    use crate::testkit::{FakeServer, Reply};
    use serde_json::json;
    use std::sync::Arc;

    fn proxy(fake: &FakeServer, timeout_secs: u64) -> BuildServer {
        BuildServer::new(fake.endpoint.clone(), RequestTimeout::new(timeout_secs))
    }

    fn targets_reply() -> Reply {
        Reply::result(json!({
            "targets": [
                {"id": {"uri": "bsp://w/app"}, "languageIds": ["rust"]},
                {"id": {"uri": "bsp://w/lib"}},
            ]
        }))
    }

    #[tokio::test]
    async fn test_collects_every_section() {
        let mut fake = FakeServer::spawn(
            [
                ("workspace/buildTargets", targets_reply()),
                (
                    "buildTarget/sources",
                    Reply::result(json!({
                        "items": [{
                            "target": {"uri": "bsp://w/app"},
                            "sources": [{"uri": "file:///w/src", "kind": 2, "generated": false}]
                        }]
                    })),
                ),
                (
                    "buildTarget/resources",
                    Reply::result(json!({
                        "items": [{"target": {"uri": "bsp://w/app"}, "resources": ["file:///w/res"]}]
                    })),
                ),
                (
                    "buildTarget/dependencySources",
                    Reply::result(json!({"items": []})),
                ),
            ],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 5);

        let details = collect_project_details(&server).await.unwrap();
        assert_eq!(details.targets.len(), 2);
        assert_eq!(details.sources.len(), 1);
        assert_eq!(details.resources.len(), 1);
        assert!(details.dependency_sources.is_empty());

        // Every fan-out request names both targets.
        let sent = fake.params_for("buildTarget/sources").unwrap();
        assert_eq!(sent["targets"][0]["uri"], "bsp://w/app");
        assert_eq!(sent["targets"][1]["uri"], "bsp://w/lib");

        let seen = fake.requests();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], "workspace/buildTargets");
        assert!(seen.contains(&"buildTarget/resources".to_owned()));
        assert!(seen.contains(&"buildTarget/dependencySources".to_owned()));
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_absent_target_list_collects_nothing() {
        // The target query times out: the sweep ends with an empty model
        // and no fan-out requests.
        let mut fake = FakeServer::spawn([], Arc::new(LoggingClient));
        let server = proxy(&fake, 1);

        let details = collect_project_details(&server).await.unwrap();
        assert!(details.targets.is_empty());
        assert_eq!(fake.requests(), vec!["workspace/buildTargets"]);
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_empty_target_list_skips_fan_out() {
        let mut fake = FakeServer::spawn(
            [("workspace/buildTargets", Reply::result(json!({"targets": []})))],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 5);

        let details = collect_project_details(&server).await.unwrap();
        assert!(details.targets.is_empty());
        assert_eq!(fake.requests(), vec!["workspace/buildTargets"]);
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_absent_section_stays_empty() {
        // Sources never answers; the other sections still land.
        let mut fake = FakeServer::spawn(
            [
                ("workspace/buildTargets", targets_reply()),
                (
                    "buildTarget/resources",
                    Reply::result(json!({
                        "items": [{"target": {"uri": "bsp://w/app"}, "resources": []}]
                    })),
                ),
                (
                    "buildTarget/dependencySources",
                    Reply::result(json!({"items": []})),
                ),
            ],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 1);

        let details = collect_project_details(&server).await.unwrap();
        assert_eq!(details.targets.len(), 2);
        assert!(details.sources.is_empty());
        assert_eq!(details.resources.len(), 1);
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_remote_failure_aborts_the_sweep() {
        let mut fake = FakeServer::spawn(
            [
                ("workspace/buildTargets", targets_reply()),
                ("buildTarget/sources", Reply::error(-32603, "walker crashed")),
                (
                    "buildTarget/resources",
                    Reply::result(json!({"items": []})),
                ),
                (
                    "buildTarget/dependencySources",
                    Reply::result(json!({"items": []})),
                ),
            ],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 5);

        assert!(matches!(
            collect_project_details(&server).await,
            Err(RequestError::Remote { method, .. }) if method == "buildTarget/sources"
        ));
        fake.stop().await;
    }
}
