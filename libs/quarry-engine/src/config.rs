// Sandbox configuration for Quarry executors
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Resource limits and runtime settings shared by every sandbox backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Docker image generated code runs in
    pub image: String,
    /// Python base image tag used when rendering the sandbox Dockerfile
    pub python_version: String,
    /// Interpreter used by the local sandbox
    pub interpreter: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub timeout_ms: u64,
    /// Acquisition code scrapes the web, so network is on unless disabled
    pub network_enabled: bool,
    /// Packages baked into the image; never reinstalled per execution
    pub preinstalled: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "quarry-sandbox:latest".to_string(),
            python_version: "3.11-slim".to_string(),
            interpreter: "python3".to_string(),
            memory_limit_mb: 1024,
            cpu_limit: 1.0,
            timeout_ms: 180_000,
            network_enabled: true,
            preinstalled: [
                "pandas",
                "numpy",
                "requests",
                "beautifulsoup4",
                "lxml",
                "matplotlib",
                "scipy",
                "duckdb",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl SandboxConfig {
    /// Load sandbox configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Sandbox config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: SandboxConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load the file if present, otherwise use built-in defaults
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            tracing::warn!(
                path = %config_path.display(),
                "Sandbox config not found, using defaults"
            );
            Ok(Self::default())
        }
    }

    /// Write the configuration as pretty JSON, creating parent directories
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(config_path, content)
            .with_context(|| format!("Failed to write {}", config_path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            bail!("Sandbox image must not be empty");
        }
        if self.timeout_ms == 0 {
            bail!("Sandbox timeout_ms must be greater than zero");
        }
        if self.memory_limit_mb < 64 {
            bail!("Sandbox memory_limit_mb must be at least 64");
        }
        if self.cpu_limit <= 0.0 {
            bail!("Sandbox cpu_limit must be positive");
        }
        Ok(())
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }

    pub fn is_preinstalled(&self, package: &str) -> bool {
        self.preinstalled
            .iter()
            .any(|p| p.eq_ignore_ascii_case(package))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sandbox.json");
        fs::write(&path, r#"{"image": "custom:1", "timeout_ms": 5000}"#).unwrap();

        let config = SandboxConfig::load(&path).unwrap();
        assert_eq!(config.image, "custom:1");
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.memory_limit_mb, 1024);
        assert!(config.network_enabled);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");

        assert!(SandboxConfig::load(&path).is_err());
        assert_eq!(SandboxConfig::load_or_default(&path).unwrap(), SandboxConfig::default());
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sandbox.json");
        fs::write(&path, r#"{"timeout_ms": 0}"#).unwrap();

        assert!(SandboxConfig::load(&path).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config/sandbox.json");
        let config = SandboxConfig {
            cpu_limit: 2.0,
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(SandboxConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_resource_conversions() {
        let config = SandboxConfig {
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            ..Default::default()
        };
        assert_eq!(config.memory_limit_bytes(), 256 * 1024 * 1024);
        assert_eq!(config.nano_cpus(), 500_000_000);
        assert!(config.is_preinstalled("Pandas"));
        assert!(!config.is_preinstalled("seaborn"));
    }
}
