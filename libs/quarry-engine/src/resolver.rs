/// Result Resolver - Artifact-Driven Response Selection
///
/// **Core Responsibility:**
/// Decide the final payload from the pipeline status and the state of
/// `result.json` in the workspace.
///
/// **Critical Properties:**
/// - Knows nothing about sandboxes or LLMs
/// - The artifact is the source of truth: a valid `result.json` is returned
///   even when the pipeline aborted
/// - `resolve` is a pure function of (pipeline status, artifact state)
///
/// **Resolution Rules:**
/// - Success + valid artifact → 200, artifact
/// - Success + missing/invalid artifact → 500, read/parse error message
/// - Aborted + valid artifact → 200, artifact
/// - Aborted + missing/invalid artifact → 500, phase-specific failure message

use crate::orchestrator::PipelineStatus;
use quarry_common::types::{Phase, RESULT_ARTIFACT};
use quarry_common::workspace::WorkspaceError;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;

pub const ACQUISITION_FAILED_MESSAGE: &str = "Error occurred while scraping after retries.";
pub const ANSWER_FAILED_MESSAGE: &str = "Failed to generate valid result after retries.";

/// What was found at the well-known artifact path
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactState {
    Valid(Value),
    Missing,
    Invalid(String),
}

/// Where the response body came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// `result.json` content
    Artifact,
    /// Pipeline aborted and nothing usable was written
    AbortFallback,
    /// Pipeline succeeded but `result.json` was missing or unparsable
    ArtifactError,
    /// Request rejected before the pipeline ran
    ClientError,
    /// Server-side failure before the pipeline ran
    ServerError,
}

impl ResponseSource {
    pub fn label(&self) -> &'static str {
        match self {
            ResponseSource::Artifact => "artifact",
            ResponseSource::AbortFallback => "abort_fallback",
            ResponseSource::ArtifactError => "artifact_error",
            ResponseSource::ClientError => "client_error",
            ResponseSource::ServerError => "server_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedResponse {
    pub status: u16,
    pub body: Value,
    pub source: ResponseSource,
}

/// Read and parse `result.json` from a workspace
pub async fn read_artifact(workspace: &Path) -> ArtifactState {
    let path = workspace.join(RESULT_ARTIFACT);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ArtifactState::Missing,
        Err(e) => return ArtifactState::Invalid(e.to_string()),
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => ArtifactState::Valid(value),
        Err(e) => ArtifactState::Invalid(e.to_string()),
    }
}

/// Apply the resolution rules
pub fn resolve(status: &PipelineStatus, artifact: ArtifactState) -> ResolvedResponse {
    match (status, artifact) {
        (_, ArtifactState::Valid(body)) => ResolvedResponse {
            status: 200,
            body,
            source: ResponseSource::Artifact,
        },
        (PipelineStatus::Success, ArtifactState::Missing) => artifact_error(&format!(
            "{} was not written by the generated code",
            RESULT_ARTIFACT
        )),
        (PipelineStatus::Success, ArtifactState::Invalid(reason)) => artifact_error(&reason),
        (PipelineStatus::Aborted { phase, .. }, _) => {
            let message = match phase {
                Phase::Acquisition => ACQUISITION_FAILED_MESSAGE,
                Phase::Answer => ANSWER_FAILED_MESSAGE,
            };
            ResolvedResponse {
                status: 500,
                body: json!({ "message": message }),
                source: ResponseSource::AbortFallback,
            }
        }
    }
}

/// Read the artifact and apply the resolution rules
pub async fn resolve_workspace(status: &PipelineStatus, workspace: &Path) -> ResolvedResponse {
    resolve(status, read_artifact(workspace).await)
}

/// Response for a request that failed staging
pub fn staging_error(err: &WorkspaceError) -> ResolvedResponse {
    if err.is_client_error() {
        ResolvedResponse {
            status: 400,
            body: json!({ "error": err.to_string() }),
            source: ResponseSource::ClientError,
        }
    } else {
        ResolvedResponse {
            status: 500,
            body: json!({ "error": err.to_string() }),
            source: ResponseSource::ServerError,
        }
    }
}

fn artifact_error(reason: &str) -> ResolvedResponse {
    ResolvedResponse {
        status: 500,
        body: json!({
            "message": format!("Error occurred while processing {}: {}", RESULT_ARTIFACT, reason)
        }),
        source: ResponseSource::ArtifactError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::AbortReason;
    use tempfile::tempdir;

    fn aborted(phase: Phase) -> PipelineStatus {
        PipelineStatus::Aborted {
            phase,
            reason: AbortReason::RetriesExhausted,
        }
    }

    #[test]
    fn test_success_with_valid_artifact() {
        let response = resolve(&PipelineStatus::Success, ArtifactState::Valid(json!({"answer": 4})));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"answer": 4}));
        assert_eq!(response.source, ResponseSource::Artifact);
    }

    #[test]
    fn test_success_with_missing_artifact_is_error() {
        let response = resolve(&PipelineStatus::Success, ArtifactState::Missing);
        assert_eq!(response.status, 500);
        assert_eq!(response.source, ResponseSource::ArtifactError);
        let message = response.body["message"].as_str().unwrap();
        assert!(message.starts_with("Error occurred while processing result.json"));
    }

    #[test]
    fn test_success_with_invalid_artifact_reports_reason() {
        let response = resolve(
            &PipelineStatus::Success,
            ArtifactState::Invalid("expected value at line 1 column 1".to_string()),
        );
        assert_eq!(response.status, 500);
        assert!(response.body["message"]
            .as_str()
            .unwrap()
            .contains("expected value at line 1 column 1"));
    }

    #[test]
    fn test_abort_with_valid_artifact_returns_artifact() {
        let response = resolve(&aborted(Phase::Answer), ArtifactState::Valid(json!([1, "two"])));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!([1, "two"]));
    }

    #[test]
    fn test_abort_without_artifact_uses_phase_message() {
        let response = resolve(&aborted(Phase::Acquisition), ArtifactState::Missing);
        assert_eq!(response.status, 500);
        assert_eq!(response.body, json!({"message": ACQUISITION_FAILED_MESSAGE}));
        assert_eq!(response.source, ResponseSource::AbortFallback);

        let response = resolve(&aborted(Phase::Answer), ArtifactState::Invalid("eof".to_string()));
        assert_eq!(response.body, json!({"message": ANSWER_FAILED_MESSAGE}));
    }

    #[tokio::test]
    async fn test_read_artifact_states() {
        let dir = tempdir().unwrap();
        assert_eq!(read_artifact(dir.path()).await, ArtifactState::Missing);

        std::fs::write(dir.path().join("result.json"), "{not json").unwrap();
        assert!(matches!(read_artifact(dir.path()).await, ArtifactState::Invalid(_)));

        std::fs::write(dir.path().join("result.json"), r#"{"answer": 4}"#).unwrap();
        assert_eq!(
            read_artifact(dir.path()).await,
            ArtifactState::Valid(json!({"answer": 4}))
        );
    }

    #[test]
    fn test_staging_errors() {
        let response = staging_error(&WorkspaceError::MissingQuestion);
        assert_eq!(response.status, 400);
        assert_eq!(
            response.body,
            json!({"error": "No questions.txt file found and no fallback file available."})
        );

        let response = staging_error(&WorkspaceError::Io {
            path: "/x".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        });
        assert_eq!(response.status, 500);
        assert_eq!(response.source, ResponseSource::ServerError);
    }
}
