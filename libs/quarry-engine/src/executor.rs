/// Request Executor - High-Level Glue
///
/// **Responsibility:**
/// Take one request from raw uploads to a resolved response:
/// 1. Stage uploads into a fresh workspace (workspace manager)
/// 2. Run acquisition + answer phases (orchestrator)
/// 3. Resolve the response from `result.json` (resolver)
///
/// This module knows nothing about:
/// - How code executes (engine's job)
/// - How retries are decided (orchestrator's job)
/// - How responses are chosen (resolver's job)

use crate::orchestrator::{Orchestrator, PipelineReport};
use crate::resolver::{self, ResolvedResponse};
use quarry_common::workspace::{self, UploadedItem, WorkspaceRoot};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything known about a processed request
#[derive(Debug, Clone)]
pub struct Processed {
    pub request_id: Option<Uuid>,
    pub workspace: Option<PathBuf>,
    /// `None` when the request was rejected during staging
    pub report: Option<PipelineReport>,
    pub response: ResolvedResponse,
    pub elapsed_ms: u64,
}

pub struct Pipeline {
    root: WorkspaceRoot,
    orchestrator: Orchestrator,
}

impl Pipeline {
    pub fn new(root: WorkspaceRoot, orchestrator: Orchestrator) -> Self {
        Self { root, orchestrator }
    }

    pub fn root(&self) -> &WorkspaceRoot {
        &self.root
    }

    pub async fn process(&self, items: Vec<UploadedItem>) -> Processed {
        let start = Instant::now();

        let ctx = match workspace::stage(&self.root, items).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(error = %e, "Request rejected during staging");
                return Processed {
                    request_id: None,
                    workspace: None,
                    report: None,
                    response: resolver::staging_error(&e),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                };
            }
        };

        let report = self.orchestrator.run(&ctx).await;
        let response = resolver::resolve_workspace(&report.status, &ctx.workspace).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            request_id = %ctx.id,
            pipeline_success = report.status.is_success(),
            response_status = response.status,
            source = response.source.label(),
            elapsed_ms,
            "Request resolved"
        );

        Processed {
            request_id: Some(ctx.id),
            workspace: Some(ctx.workspace),
            report: Some(report),
            response,
            elapsed_ms,
        }
    }
}
