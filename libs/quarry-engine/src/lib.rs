pub mod config;
pub mod engine;
pub mod executor;
pub mod local;
pub mod orchestrator;
pub mod prompts;
pub mod resolver;
pub mod synthesis;


pub use config::SandboxConfig;
pub use engine::{DockerEngine, SandboxExecutor};
pub use executor::{Pipeline, Processed};
pub use local::LocalEngine;
pub use orchestrator::{Orchestrator, PipelineReport, PipelineStatus, RetryPolicy};
pub use synthesis::{CodeSynthesizer, GeminiSynthesizer, SynthesisError};

use quarry_common::config::{QuarryConfig, SandboxKind};
use std::sync::Arc;

/// Build the configured sandbox backend
pub fn build_executor(kind: SandboxKind, config: SandboxConfig) -> anyhow::Result<Arc<dyn SandboxExecutor>> {
    let executor: Arc<dyn SandboxExecutor> = match kind {
        SandboxKind::Docker => Arc::new(DockerEngine::new(config)?),
        SandboxKind::Local => Arc::new(LocalEngine::new(config)),
    };
    Ok(executor)
}

/// Wire synthesizer, sandbox and workspace root from application config
pub fn build_pipeline(config: &QuarryConfig) -> anyhow::Result<Pipeline> {
    let sandbox = SandboxConfig::load_or_default(&config.sandbox_config_path)?;
    let executor = build_executor(config.sandbox, sandbox)?;
    let synthesizer: Arc<dyn CodeSynthesizer> = Arc::new(GeminiSynthesizer::new(&config.gemini)?);

    let policy = RetryPolicy {
        max_logged_failures: config.max_retries,
        max_structural_retries: config.max_structural_retries,
    };

    Ok(Pipeline::new(
        quarry_common::workspace::WorkspaceRoot::new(&config.upload_root),
        Orchestrator::new(synthesizer, executor, policy),
    ))
}
