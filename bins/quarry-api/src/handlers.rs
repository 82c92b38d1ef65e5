// HTTP route handlers for the Quarry API

use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use quarry_common::workspace::UploadedItem;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::metrics;
use crate::AppState;

/// Read every multipart part in upload order; parts with a filename are
/// files, everything else is a scalar field
async fn collect_uploads(multipart: &mut Multipart) -> Result<Vec<UploadedItem>, MultipartError> {
    let mut items = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field
            .file_name()
            .map(str::to_string)
            .filter(|filename| !filename.is_empty());

        match filename {
            Some(filename) => {
                let content = field.bytes().await?.to_vec();
                items.push(UploadedItem::File {
                    field: name,
                    filename,
                    content,
                });
            }
            None => {
                let value = field.text().await?;
                items.push(UploadedItem::Scalar { name, value });
            }
        }
    }

    Ok(items)
}

/// POST /api - Answer the uploaded questions
pub async fn analyze(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let items = match collect_uploads(&mut multipart).await {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "Rejected malformed multipart body");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("Invalid multipart body: {}", e)
                })),
            )
                .into_response();
        }
    };

    info!(parts = items.len(), "Analysis request received");

    let processed = state.pipeline.process(items).await;
    metrics::record(&processed);

    let status = StatusCode::from_u16(processed.response.status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(processed.response.body)).into_response();

    if let Some(request_id) = processed.request_id {
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert("x-request-id", value);
        }
    }

    response
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{app, AppState};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use indexmap::IndexMap;
    use quarry_common::types::{AnswerSynthesis, ExecutionOutcome, SynthesisResult};
    use quarry_common::workspace::{StagedItem, WorkspaceRoot};
    use quarry_engine::synthesis::{CodeSynthesizer, SynthesisError};
    use quarry_engine::{Orchestrator, Pipeline, RetryPolicy, SandboxExecutor};
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "quarry-test-boundary";

    struct FixedSynthesizer;

    #[async_trait]
    impl CodeSynthesizer for FixedSynthesizer {
        async fn synthesize(
            &self,
            question: &str,
            _staged: &IndexMap<String, StagedItem>,
            _workspace: &Path,
        ) -> Result<SynthesisResult, SynthesisError> {
            Ok(SynthesisResult {
                code: "acquire".to_string(),
                libraries: vec![],
                questions: question.to_string(),
            })
        }

        async fn synthesize_answer(
            &self,
            _questions: &str,
            _workspace: &Path,
        ) -> Result<AnswerSynthesis, SynthesisError> {
            Ok(AnswerSynthesis {
                code: "answer".to_string(),
                libraries: vec![],
            })
        }
    }

    /// Succeeds every time; the answer step writes `{"answer": 4}`
    struct ArithmeticExecutor;

    #[async_trait]
    impl SandboxExecutor for ArithmeticExecutor {
        fn name(&self) -> &'static str {
            "arithmetic"
        }

        async fn execute(
            &self,
            code: &str,
            _libraries: &[String],
            workspace: &Path,
        ) -> anyhow::Result<ExecutionOutcome> {
            if code == "answer" {
                std::fs::write(workspace.join("result.json"), r#"{"answer": 4}"#)?;
            }
            Ok(ExecutionOutcome::success(""))
        }
    }

    fn test_app(root: &Path) -> axum::Router {
        let pipeline = Pipeline::new(
            WorkspaceRoot::new(root),
            Orchestrator::new(
                Arc::new(FixedSynthesizer),
                Arc::new(ArithmeticExecutor),
                RetryPolicy::default(),
            ),
        );
        app(Arc::new(AppState { pipeline }), 1024 * 1024)
    }

    fn multipart_body(parts: &[(&str, Option<&str>, &str)]) -> String {
        let mut body = String::new();
        for (name, filename, content) in parts {
            body.push_str(&format!("--{}\r\n", BOUNDARY));
            match filename {
                Some(filename) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    name, filename
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    name
                )),
            }
            body.push_str(content);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));
        body
    }

    fn post_api(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_analyze_returns_result_artifact() {
        let dir = tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(post_api(multipart_body(&[
                ("questions.txt", Some("questions.txt"), "What is 2+2?"),
                ("note", None, "scalar value"),
            ])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(json_body(response).await, json!({"answer": 4}));
    }

    #[tokio::test]
    async fn test_analyze_without_files_is_bad_request() {
        let dir = tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(post_api(multipart_body(&[("question", None, "What is 2+2?")])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({"error": "No questions.txt file found and no fallback file available."})
        );
    }

    #[tokio::test]
    async fn test_analyze_rejects_duplicate_filenames() {
        let dir = tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(post_api(multipart_body(&[
                ("a", Some("data.csv"), "1"),
                ("b", Some("data.csv"), "2"),
            ])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_non_multipart_body_is_rejected() {
        let dir = tempdir().unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/api")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let response = test_app(dir.path()).oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cross_origin_requests_are_allowed() {
        let dir = tempdir().unwrap();
        let mut request = post_api(multipart_body(&[(
            "questions.txt",
            Some("questions.txt"),
            "What is 2+2?",
        )]));
        request
            .headers_mut()
            .insert("origin", "https://dashboard.example.com".parse().unwrap());

        let response = test_app(dir.path()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let dir = tempdir().unwrap();
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api")
            .header("origin", "https://dashboard.example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();

        let response = test_app(dir.path()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert!(response.headers().contains_key("access-control-allow-methods"));
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let dir = tempdir().unwrap();
        crate::metrics::register();
        let response = test_app(dir.path())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("quarry_request_duration_seconds"));
    }
}
