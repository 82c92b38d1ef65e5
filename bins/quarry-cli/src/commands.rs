// CLI commands for running and maintaining Quarry
use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use quarry_common::config::{QuarryConfig, SandboxKind};
use quarry_common::workspace::{UploadedItem, WorkspaceRoot};
use quarry_engine::SandboxConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const DOCKERFILE_PATH: &str = "dockerfiles/sandbox/Dockerfile";

/// Run the pipeline once over local files, print the response body to stdout
pub async fn run_files(files: &[PathBuf], sandbox: Option<&str>, keep: bool) -> Result<()> {
    let mut config = QuarryConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    if let Some(sandbox) = sandbox {
        config.sandbox = sandbox.parse::<SandboxKind>().map_err(|e| anyhow::anyhow!(e))?;
    }

    let items = read_uploads(files)?;
    let pipeline = quarry_engine::build_pipeline(&config)?;

    eprintln!("🚀 Running pipeline on {} file(s) with {:?} sandbox", items.len(), config.sandbox);
    let processed = pipeline.process(items).await;

    println!("{}", serde_json::to_string_pretty(&processed.response.body)?);

    if let Some(workspace) = &processed.workspace {
        if keep {
            eprintln!("📂 Workspace kept at {}", workspace.display());
        } else {
            pipeline
                .root()
                .remove(workspace)
                .await
                .with_context(|| format!("Failed to remove {}", workspace.display()))?;
        }
    }

    let status = processed.response.status;
    if status != 200 {
        bail!(
            "Pipeline finished with status {} ({})",
            status,
            processed.response.source.label()
        );
    }

    eprintln!("✅ Done in {} ms", processed.elapsed_ms);
    Ok(())
}

/// Turn file paths into uploads named after their final path component
fn read_uploads(files: &[PathBuf]) -> Result<Vec<UploadedItem>> {
    files
        .iter()
        .map(|path| {
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid file path: {}", path.display()))?
                .to_string();
            let content =
                fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(UploadedItem::File {
                field: filename.clone(),
                filename,
                content,
            })
        })
        .collect()
}

/// Initialize a new Quarry project
pub async fn init_project(path: &str) -> Result<()> {
    println!("🚀 Initializing Quarry project at: {}", path);

    let project_path = Path::new(path);

    let dirs = ["config", "dockerfiles/sandbox", "uploads"];
    for dir in &dirs {
        fs::create_dir_all(project_path.join(dir))
            .with_context(|| format!("Failed to create directory: {}", dir))?;
        println!("  ✅ Created: {}", dir);
    }

    let config_path = project_path.join("config/sandbox.json");
    let sandbox = if config_path.exists() {
        println!("  ⏭️  Keeping existing: config/sandbox.json");
        SandboxConfig::load(&config_path)?
    } else {
        let sandbox = SandboxConfig::default();
        sandbox.save(&config_path)?;
        println!("  ✅ Created: config/sandbox.json");
        sandbox
    };

    let dockerfile_path = project_path.join(DOCKERFILE_PATH);
    if dockerfile_path.exists() {
        println!("  ⏭️  Keeping existing: {}", DOCKERFILE_PATH);
    } else {
        fs::write(&dockerfile_path, generate_sandbox_dockerfile(&sandbox))
            .with_context(|| format!("Failed to write {}", dockerfile_path.display()))?;
        println!("  ✅ Created: {}", DOCKERFILE_PATH);
    }

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Build the sandbox: quarry-cli build-image");
    println!("  2. Set GEMINI_API_KEY in .env");
    println!("  3. Try it: quarry-cli run --file questions.txt");

    Ok(())
}

/// Dockerfile for the Python sandbox; packages listed as preinstalled are
/// baked in so requests only install what they add
fn generate_sandbox_dockerfile(config: &SandboxConfig) -> String {
    let packages = config
        .preinstalled
        .iter()
        .map(|p| format!("    {}", p))
        .collect::<Vec<_>>()
        .join(" \\\n");

    format!(
        r#"# GENERATED BY quarry-cli - DO NOT EDIT
# Python sandbox for generated analysis code
FROM python:{}

ENV PYTHONUNBUFFERED=1 \
    PYTHONDONTWRITEBYTECODE=1 \
    PIP_DISABLE_PIP_VERSION_CHECK=1 \
    MPLBACKEND=Agg

RUN pip install --no-cache-dir \
{}

WORKDIR /workspace
"#,
        config.python_version, packages
    )
}

/// Build the sandbox image named in config/sandbox.json
pub async fn build_docker_image(no_cache: bool) -> Result<()> {
    let sandbox = SandboxConfig::load_or_default(Path::new("config/sandbox.json"))?;
    println!("🐳 Building sandbox image: {}", sandbox.image);

    let dockerfile_path = PathBuf::from(DOCKERFILE_PATH);
    if !dockerfile_path.exists() {
        bail!(
            "Dockerfile not found at {}. Generate it first with the init command.",
            dockerfile_path.display()
        );
    }

    let mut docker_args = vec![
        "build".to_string(),
        "-t".to_string(),
        sandbox.image.clone(),
        "-f".to_string(),
        dockerfile_path.to_string_lossy().to_string(),
    ];
    if no_cache {
        docker_args.push("--no-cache".to_string());
    }
    docker_args.push(".".to_string());

    println!("\n🔨 Running: docker {}", docker_args.join(" "));

    let status = Command::new("docker")
        .args(&docker_args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to execute docker build. Is Docker installed and running?")?;

    if !status.success() {
        bail!("Docker build failed with exit code: {:?}", status.code());
    }

    println!("✅ Docker image {} built successfully!", sandbox.image);
    Ok(())
}

/// Remove request workspaces under the configured upload root
pub async fn clean(older_than_hours: i64, dry_run: bool) -> Result<()> {
    if older_than_hours < 0 {
        bail!("--older-than-hours must not be negative");
    }

    let config = QuarryConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let root = WorkspaceRoot::new(&config.upload_root);
    println!("🧹 Cleaning workspaces in {}", root.path().display());

    let removed = clean_workspaces(&root, Duration::hours(older_than_hours), dry_run).await?;
    for path in &removed {
        if dry_run {
            println!("  🔎 Would remove: {}", path.display());
        } else {
            println!("  🗑️  Removed: {}", path.display());
        }
    }

    println!("✅ {} workspace(s) {}", removed.len(), if dry_run { "matched" } else { "removed" });
    Ok(())
}

async fn clean_workspaces(
    root: &WorkspaceRoot,
    older_than: Duration,
    dry_run: bool,
) -> Result<Vec<PathBuf>> {
    let cutoff = Utc::now() - older_than;
    let mut removed = Vec::new();

    for entry in root.list().await? {
        if entry.modified > cutoff {
            continue;
        }
        if !dry_run {
            root.remove(&entry.path).await?;
        }
        removed.push(entry.path);
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dockerfile_bakes_in_preinstalled_packages() {
        let config = SandboxConfig::default();
        let dockerfile = generate_sandbox_dockerfile(&config);

        assert!(dockerfile.starts_with("# GENERATED BY quarry-cli"));
        assert!(dockerfile.contains("FROM python:3.11-slim"));
        assert!(dockerfile.contains("    pandas \\\n"));
        assert!(dockerfile.contains("    duckdb\n"));
        assert!(dockerfile.contains("WORKDIR /workspace"));
        assert!(!dockerfile.contains("ENTRYPOINT"));
    }

    #[tokio::test]
    async fn test_init_project_creates_layout_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap();

        init_project(path).await.unwrap();
        assert!(dir.path().join("config/sandbox.json").exists());
        assert!(dir.path().join(DOCKERFILE_PATH).exists());
        assert!(dir.path().join("uploads").is_dir());

        let custom = "# hand edited\n";
        fs::write(dir.path().join(DOCKERFILE_PATH), custom).unwrap();
        init_project(path).await.unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(DOCKERFILE_PATH)).unwrap(),
            custom
        );
    }

    #[test]
    fn test_read_uploads_uses_file_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("questions.txt");
        fs::write(&path, "How many rows?").unwrap();

        let items = read_uploads(&[path]).unwrap();
        match &items[0] {
            UploadedItem::File {
                filename, content, ..
            } => {
                assert_eq!(filename, "questions.txt");
                assert_eq!(content, b"How many rows?");
            }
            other => panic!("expected file upload, got {:?}", other),
        }

        assert!(read_uploads(&[dir.path().join("missing.csv")]).is_err());
    }

    #[tokio::test]
    async fn test_clean_respects_age_and_dry_run() {
        let dir = tempdir().unwrap();
        let root = WorkspaceRoot::new(dir.path());
        let (_, workspace) = root.allocate().await.unwrap();
        fs::create_dir(dir.path().join("not-a-request")).unwrap();

        let kept = clean_workspaces(&root, Duration::hours(24), false).await.unwrap();
        assert!(kept.is_empty());
        assert!(workspace.exists());

        let matched = clean_workspaces(&root, Duration::zero(), true).await.unwrap();
        assert_eq!(matched, vec![workspace.clone()]);
        assert!(workspace.exists());

        let removed = clean_workspaces(&root, Duration::zero(), false).await.unwrap();
        assert_eq!(removed, vec![workspace.clone()]);
        assert!(!workspace.exists());
        assert!(dir.path().join("not-a-request").exists());
    }
}
