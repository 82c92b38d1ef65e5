// Application configuration, read from the environment

use std::path::PathBuf;
use std::str::FromStr;

/// Which sandbox backend runs generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Docker,
    Local,
}

impl FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(SandboxKind::Docker),
            "local" => Ok(SandboxKind::Local),
            other => Err(format!("Invalid sandbox '{}' (valid options: docker, local)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuarryConfig {
    pub bind_addr: String,
    pub upload_root: PathBuf,
    pub sandbox: SandboxKind,
    pub sandbox_config_path: PathBuf,
    pub max_retries: u32,
    pub max_structural_retries: u32,
    pub max_upload_bytes: usize,
    pub gemini: GeminiSettings,
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for QuarryConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            upload_root: PathBuf::from("uploads"),
            sandbox: SandboxKind::Docker,
            sandbox_config_path: PathBuf::from("config/sandbox.json"),
            max_retries: 3,
            max_structural_retries: 3,
            max_upload_bytes: 50 * 1024 * 1024,
            gemini: GeminiSettings {
                api_key: None,
                model: "gemini-2.5-flash".to_string(),
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                timeout_secs: 180,
            },
        }
    }
}

impl QuarryConfig {
    /// Build the configuration from `QUARRY_*` / `GEMINI_*` variables,
    /// falling back to defaults for anything unset
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QuarryConfig::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let sandbox = match lookup("QUARRY_SANDBOX") {
            Some(value) => value.parse()?,
            None => defaults.sandbox,
        };

        let max_upload_mb: usize = parse_or(&lookup, "QUARRY_MAX_UPLOAD_MB", 50)?;

        Ok(Self {
            bind_addr: lookup("QUARRY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            upload_root: lookup("QUARRY_UPLOAD_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_root),
            sandbox,
            sandbox_config_path: lookup("QUARRY_SANDBOX_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox_config_path),
            max_retries: parse_or(&lookup, "QUARRY_MAX_RETRIES", defaults.max_retries)?,
            max_structural_retries: parse_or(
                &lookup,
                "QUARRY_MAX_STRUCTURAL_RETRIES",
                defaults.max_structural_retries,
            )?,
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            gemini: GeminiSettings {
                api_key: lookup("GEMINI_API_KEY").filter(|key| !key.trim().is_empty()),
                model: lookup("GEMINI_MODEL").unwrap_or(defaults.gemini.model),
                base_url: lookup("GEMINI_BASE_URL").unwrap_or(defaults.gemini.base_url),
                timeout_secs: parse_or(&lookup, "GEMINI_TIMEOUT_SECS", defaults.gemini.timeout_secs)?,
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, String>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("Invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}
