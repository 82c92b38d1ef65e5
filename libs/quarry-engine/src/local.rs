// Local-process sandbox: runs generated code with the host interpreter.
// Isolation is limited to the per-request working directory; intended for
// development and for hosts without a Docker daemon.

use crate::config::SandboxConfig;
use crate::engine::{
    classify_exit, installable_libraries, write_script, SandboxExecutor, MAX_SOURCE_CODE_BYTES,
    SCRIPT_DIR,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use quarry_common::types::ExecutionOutcome;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Per-workspace install target for declared packages, put on `PYTHONPATH`
const SITE_DIR: &str = "site";

pub struct LocalEngine {
    config: SandboxConfig,
}

struct ProcessOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    timed_out: bool,
}

impl LocalEngine {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    async fn run(&self, mut command: Command, timeout_ms: u64) -> Result<ProcessOutput> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.interpreter))?;

        // Dropping the pending future on timeout kills the child
        match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output()).await {
            Ok(output) => {
                let output = output.context("Failed to collect process output")?;
                Ok(ProcessOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: exit_code(&output.status),
                    timed_out: false,
                })
            }
            Err(_) => Ok(ProcessOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                timed_out: true,
            }),
        }
    }

    async fn install(&self, packages: &[String], workspace: &Path) -> Result<Option<ExecutionOutcome>> {
        if packages.is_empty() {
            return Ok(None);
        }

        let site = site_dir(workspace);
        tokio::fs::create_dir_all(&site)
            .await
            .with_context(|| format!("Failed to create {}", site.display()))?;

        debug!(packages = ?packages, target = %site.display(), "Installing packages");
        let mut command = Command::new(&self.config.interpreter);
        command
            .args(["-m", "pip", "install", "--quiet", "--disable-pip-version-check"])
            .arg("--target")
            .arg(&site)
            .args(packages)
            .current_dir(workspace);

        let output = self.run(command, self.config.timeout_ms).await?;
        if output.timed_out || output.exit_code != Some(0) {
            warn!(packages = ?packages, "Package installation failed");
            let message = format!(
                "{}\n[Package installation failed: {}]",
                output.stderr,
                packages.join(" ")
            );
            return Ok(Some(ExecutionOutcome::recoverable(message)));
        }
        Ok(None)
    }
}

fn site_dir(workspace: &Path) -> PathBuf {
    workspace.join(SCRIPT_DIR).join(SITE_DIR)
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> Option<i64> {
    use std::os::unix::process::ExitStatusExt;
    // Report signals the way a container runtime does (128 + signal)
    status
        .code()
        .map(i64::from)
        .or_else(|| status.signal().map(|signal| 128 + i64::from(signal)))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> Option<i64> {
    status.code().map(i64::from)
}

#[async_trait]
impl SandboxExecutor for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(
        &self,
        code: &str,
        libraries: &[String],
        workspace: &Path,
    ) -> Result<ExecutionOutcome> {
        if code.len() > MAX_SOURCE_CODE_BYTES {
            bail!("Generated code exceeds maximum size of {} bytes", MAX_SOURCE_CODE_BYTES);
        }

        // Paths handed to the child must survive its change of directory
        let workspace = tokio::fs::canonicalize(workspace)
            .await
            .with_context(|| format!("Workspace not found: {}", workspace.display()))?;
        if !workspace.is_dir() {
            bail!("Workspace is not a directory: {}", workspace.display());
        }

        let packages = installable_libraries(libraries, &self.config);
        if let Some(failed) = self.install(&packages, &workspace).await? {
            return Ok(failed);
        }

        let script = write_script(code, &workspace).await?;

        let mut command = Command::new(&self.config.interpreter);
        command
            .arg(&script)
            .current_dir(&workspace)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONPATH", site_dir(&workspace));

        let output = self.run(command, self.config.timeout_ms).await?;
        debug!(
            script = %script.display(),
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            "Local execution finished"
        );

        classify_exit(
            output.exit_code,
            output.timed_out,
            &output.stdout,
            &output.stderr,
            self.config.timeout_ms,
        )
    }
}
