/// Execution Engine - Abstraction for Running Generated Code
///
/// **Core Responsibility:**
/// Execute generated Python inside a request workspace and report a status
/// plus captured output.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (Docker, local process)
/// - Engine does NOT know about phases or retries
/// - Engine does NOT read `result.json`
/// - A returned `Err` means the execution environment itself failed;
///   code that ran and failed is reported as an `ExecutionOutcome`
///
/// **Status Mapping (all backends):**
/// - exit 0 → `1` (success), stdout captured
/// - non-zero exit, failed package install, timeout → `0` (recoverable)
/// - exit 137 / 139 (killed by the sandbox) → terminal, carries the code

use crate::config::SandboxConfig;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use quarry_common::types::ExecutionOutcome;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

/// Safety limit to keep pathological generations away from the sandbox
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB

/// Captured output fed back into prompts is cut to its tail
pub const MAX_CAPTURED_OUTPUT_CHARS: usize = 8_000;

/// Workspace subdirectory holding generated scripts; hidden from the
/// listing shown to the LLM
pub const SCRIPT_DIR: &str = ".quarry";

const CONTAINER_WORKSPACE: &str = "/workspace";

/// Runner executed inside the sandbox image; the script path arrives in
/// `SCRIPT_PATH`, packages space separated in `LIBRARIES`
const CONTAINER_RUNNER: &str = r#"set -u
if [ -n "${LIBRARIES:-}" ]; then
  pip install --user --quiet --disable-pip-version-check $LIBRARIES 1>&2 || { echo "[Package installation failed: $LIBRARIES]" 1>&2; exit 3; }
fi
exec python "$SCRIPT_PATH""#;

/// Sandboxed executor contract consumed by the orchestrator
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        code: &str,
        libraries: &[String],
        workspace: &Path,
    ) -> Result<ExecutionOutcome>;
}

/// Write generated code to `<workspace>/.quarry/<uuid>.py`
pub async fn write_script(code: &str, workspace: &Path) -> Result<PathBuf> {
    let script_dir = workspace.join(SCRIPT_DIR);
    tokio::fs::create_dir_all(&script_dir)
        .await
        .with_context(|| format!("Failed to create {}", script_dir.display()))?;

    let script = script_dir.join(format!("{}.py", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&script, code)
        .await
        .with_context(|| format!("Failed to write {}", script.display()))?;
    Ok(script)
}

/// Standard-library modules LLMs routinely list as "libraries"
const STDLIB_MODULES: &[&str] = &[
    "base64", "collections", "csv", "datetime", "functools", "glob", "io", "itertools",
    "json", "math", "os", "pathlib", "random", "re", "statistics", "string", "subprocess",
    "sys", "time", "typing", "urllib", "zipfile", "sqlite3", "tempfile", "traceback",
];

/// Import names whose PyPI distribution is named differently
const PIP_ALIASES: &[(&str, &str)] = &[
    ("bs4", "beautifulsoup4"),
    ("sklearn", "scikit-learn"),
    ("PIL", "pillow"),
    ("cv2", "opencv-python"),
    ("yaml", "pyyaml"),
    ("dateutil", "python-dateutil"),
];

/// Turn the declared library list into the packages that still need
/// installing: stdlib and preinstalled packages dropped, import names mapped
/// to distributions, anything that is not a plain requirement rejected
pub fn installable_libraries(libraries: &[String], config: &SandboxConfig) -> Vec<String> {
    let mut packages: Vec<String> = Vec::new();

    for raw in libraries {
        let name = raw.trim();
        let module = name.split('.').next().unwrap_or(name);
        if module.is_empty() || STDLIB_MODULES.contains(&module) {
            continue;
        }

        let is_plain_requirement = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-=<>!~[],".contains(c));
        if !is_plain_requirement {
            warn!(library = %name, "Ignoring library with unexpected characters");
            continue;
        }

        let package = PIP_ALIASES
            .iter()
            .find(|(import, _)| *import == module)
            .map(|(_, dist)| dist.to_string())
            .unwrap_or_else(|| name.to_string());

        if config.is_preinstalled(&package) {
            continue;
        }
        if !packages.iter().any(|p| p.eq_ignore_ascii_case(&package)) {
            packages.push(package);
        }
    }

    packages
}

/// Keep the tail of long output; tracebacks end with the useful line
pub fn truncate_output(output: &str) -> String {
    let count = output.chars().count();
    if count <= MAX_CAPTURED_OUTPUT_CHARS {
        return output.to_string();
    }
    let tail: String = output
        .chars()
        .skip(count - MAX_CAPTURED_OUTPUT_CHARS)
        .collect();
    format!("[... {} chars truncated ...]\n{}", count - MAX_CAPTURED_OUTPUT_CHARS, tail)
}

/// Map a finished (or timed out) process to an execution outcome
pub fn classify_exit(
    exit_code: Option<i64>,
    timed_out: bool,
    stdout: &str,
    stderr: &str,
    timeout_ms: u64,
) -> Result<ExecutionOutcome> {
    if timed_out {
        let mut output = stderr.to_string();
        output.push_str(&format!("\n[Execution timed out after {}ms]", timeout_ms));
        return Ok(ExecutionOutcome::recoverable(truncate_output(&output)));
    }

    let Some(code) = exit_code else {
        bail!("No exit code captured from sandbox");
    };

    let outcome = match code {
        0 => ExecutionOutcome::success(truncate_output(stdout)),
        137 => ExecutionOutcome::terminal(
            code,
            truncate_output(&format!(
                "{}\n[Sandbox killed: likely OOM or exceeded memory limit]",
                stderr
            )),
        ),
        139 => ExecutionOutcome::terminal(
            code,
            truncate_output(&format!("{}\n[Sandbox killed: segmentation fault]", stderr)),
        ),
        _ => {
            let mut output = if stderr.trim().is_empty() {
                stdout.to_string()
            } else {
                stderr.to_string()
            };
            output.push_str(&format!("\n[Process exited with code {}]", code));
            ExecutionOutcome::recoverable(truncate_output(&output))
        }
    };

    Ok(outcome)
}

/// Path of a staged script as seen from inside the container
fn container_script_path(script: &Path) -> Result<String> {
    let file_name = script
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid script path: {}", script.display()))?;
    Ok(format!("{}/{}/{}", CONTAINER_WORKSPACE, SCRIPT_DIR, file_name))
}

/// Container cleanup guard - guarantees container removal on drop
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Cannot await in Drop
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

/// Docker-based sandbox
///
/// **Docker Execution Rules:**
/// 1. Pulls the sandbox image if not present
/// 2. Bind-mounts the request workspace at `/workspace` and runs there,
///    so `result.json` and any acquired data land in the workspace
/// 3. Applies memory/CPU limits from `SandboxConfig`
/// 4. Stages the script under `.quarry/` in the workspace, installs declared
///    libraries, then runs it
/// 5. Kills the container on timeout
/// 6. Removes the container after execution via `ContainerGuard`
pub struct DockerEngine {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerEngine {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        Ok(DockerEngine { docker, config })
    }

    /// Ensure the sandbox image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, script_path: &str, packages: &[String], host_workspace: &str) -> Config<String> {
        let env = vec![
            format!("SCRIPT_PATH={}", script_path),
            format!("LIBRARIES={}", packages.join(" ")),
            "PYTHONUNBUFFERED=1".to_string(),
        ];

        Config {
            image: Some(self.config.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                CONTAINER_RUNNER.to_string(),
            ]),
            env: Some(env),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(!self.config.network_enabled),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(self.config.memory_limit_bytes()),
                nano_cpus: Some(self.config.nano_cpus()),
                binds: Some(vec![format!("{}:{}", host_workspace, CONTAINER_WORKSPACE)]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SandboxExecutor for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
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

        let workspace = tokio::fs::canonicalize(workspace)
            .await
            .with_context(|| format!("Workspace not found: {}", workspace.display()))?;
        let host_workspace = workspace.to_string_lossy().to_string();

        let image = self.config.image.clone();
        self.ensure_image(&image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", image))?;

        // The script travels through the bind mount; env strings are capped
        // well below the source size limit
        let script = write_script(code, &workspace).await?;
        let script_path = container_script_path(&script)?;

        let packages = installable_libraries(libraries, &self.config);
        let container_name = format!("quarry-{}", uuid::Uuid::new_v4());
        let config = self.container_config(&script_path, &packages, &host_workspace);

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let execution_future = async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });

            let mut logs_stream = self.docker.logs(&container_id, logs_options);
            while let Some(output) = logs_stream.next().await {
                match output {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                    _ => {}
                }
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };

            // bollard reports non-zero exits as a wait error carrying the code
            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));
            let exit_code = match wait_stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to get container exit code");
                    None
                }
                None => None,
            };

            (stdout, stderr, exit_code)
        };

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let (stdout, stderr, exit_code, timed_out) =
            match tokio::time::timeout(timeout, execution_future).await {
                Ok((stdout, stderr, exit_code)) => (stdout, stderr, exit_code, false),
                Err(_) => {
                    warn!(
                        container_id = %container_id,
                        timeout_ms = self.config.timeout_ms,
                        "Execution timed out, killing container"
                    );
                    if let Err(e) = self
                        .docker
                        .kill_container(&container_id, None::<KillContainerOptions<String>>)
                        .await
                    {
                        warn!(error = %e, "Failed to kill timed-out container");
                    }
                    (String::new(), String::new(), None, true)
                }
            };

        debug!(
            container_id = %container_id,
            exit_code = ?exit_code,
            timed_out,
            execution_ms = start_time.elapsed().as_millis() as u64,
            "Container finished"
        );

        classify_exit(exit_code, timed_out, &stdout, &stderr, self.config.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::types::ExecutionStatus;

    fn libs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_installable_libraries_filters_and_maps() {
        let config = SandboxConfig::default();
        let packages = installable_libraries(
            &libs(&["json", "pandas", "bs4", "seaborn", "os.path", "sklearn", "seaborn", ""]),
            &config,
        );
        // beautifulsoup4 and pandas are preinstalled by default
        assert_eq!(packages, vec!["seaborn", "scikit-learn"]);
    }

    #[test]
    fn test_installable_libraries_rejects_shell_metacharacters() {
        let config = SandboxConfig {
            preinstalled: vec![],
            ..Default::default()
        };
        let packages = installable_libraries(
            &libs(&["requests; rm -rf /", "$(whoami)", "polars==1.0"]),
            &config,
        );
        assert_eq!(packages, vec!["polars==1.0"]);
    }

    #[test]
    fn test_classify_success() {
        let outcome = classify_exit(Some(0), false, "done\n", "warning", 1000).unwrap();
        assert_eq!(outcome.code, ExecutionStatus::Success);
        assert_eq!(outcome.output, "done\n");
    }

    #[test]
    fn test_classify_failure_is_recoverable() {
        let outcome = classify_exit(Some(1), false, "", "Traceback: KeyError", 1000).unwrap();
        assert_eq!(outcome.code, ExecutionStatus::Recoverable);
        assert!(outcome.output.contains("KeyError"));
        assert!(outcome.output.contains("exited with code 1"));
    }

    #[test]
    fn test_classify_failure_uses_stdout_when_stderr_empty() {
        let outcome = classify_exit(Some(2), false, "site unreachable", "", 1000).unwrap();
        assert!(outcome.output.starts_with("site unreachable"));
    }

    #[test]
    fn test_classify_timeout_is_recoverable() {
        let outcome = classify_exit(None, true, "", "", 1500).unwrap();
        assert_eq!(outcome.code, ExecutionStatus::Recoverable);
        assert!(outcome.output.contains("timed out after 1500ms"));
    }

    #[test]
    fn test_classify_killed_is_terminal() {
        let outcome = classify_exit(Some(137), false, "", "", 1000).unwrap();
        assert_eq!(outcome.code, ExecutionStatus::Terminal(137));
        assert!(outcome.output.contains("OOM"));
    }

    #[test]
    fn test_classify_missing_exit_code_is_error() {
        assert!(classify_exit(None, false, "", "", 1000).is_err());
    }

    #[test]
    fn test_truncate_output_keeps_tail() {
        let long = format!("{}END", "x".repeat(MAX_CAPTURED_OUTPUT_CHARS + 10));
        let truncated = truncate_output(&long);
        assert!(truncated.starts_with("[... 13 chars truncated ...]"));
        assert!(truncated.ends_with("END"));
        assert_eq!(truncate_output("short"), "short");
    }

    #[tokio::test]
    async fn test_large_script_is_staged_through_workspace() {
        let dir = tempfile::tempdir().unwrap();
        // Larger than a single environment string may be
        let code = format!("x = '{}'\n", "a".repeat(512 * 1024));

        let script = write_script(&code, dir.path()).await.unwrap();
        assert_eq!(script.parent().unwrap(), dir.path().join(SCRIPT_DIR));
        assert_eq!(std::fs::read_to_string(&script).unwrap(), code);

        let in_container = container_script_path(&script).unwrap();
        let file_name = script.file_name().unwrap().to_str().unwrap();
        assert_eq!(in_container, format!("/workspace/.quarry/{}", file_name));
        assert!(CONTAINER_RUNNER.contains("\"$SCRIPT_PATH\""));
        assert!(!CONTAINER_RUNNER.contains("SOURCE_CODE"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the sandbox image
    async fn test_docker_engine_writes_result() {
        let dir = tempfile::tempdir().unwrap();
        let engine = DockerEngine::new(SandboxConfig::default()).unwrap();

        let outcome = engine
            .execute(
                "import json\njson.dump({'answer': 4}, open('result.json', 'w'))\nprint('ok')",
                &[],
                dir.path(),
            )
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert!(dir.path().join("result.json").exists());
    }
}
