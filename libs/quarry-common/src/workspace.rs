/// Workspace Manager - Per-Request Isolation
///
/// **Responsibility:**
/// Allocate a fresh directory for every request under an injected
/// `WorkspaceRoot`, stage uploaded files into it, and decide which upload
/// carries the question text.
///
/// **Rules:**
/// - Files are keyed by their declared filename, never by form field name
/// - A file named `questions.txt` (any case) supplies the question
/// - Otherwise the first uploaded file (by upload order) supplies it
/// - Scalar form fields are kept as values and never become the question
/// - Duplicate names are rejected instead of silently overwriting
/// - Filenames are reduced to their last path component so nothing is
///   written outside the workspace

use crate::types::{QUESTION_SENTINEL, RESULT_ARTIFACT};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("No questions.txt file found and no fallback file available.")]
    MissingQuestion,

    #[error("Invalid upload filename: '{0}'")]
    InvalidFilename(String),

    #[error("Duplicate upload name: '{0}'")]
    DuplicateUpload(String),

    #[error("Workspace I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    /// Whether the error was caused by the request rather than the server
    pub fn is_client_error(&self) -> bool {
        !matches!(self, WorkspaceError::Io { .. })
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One part of an upload, in the order it was received
#[derive(Debug, Clone)]
pub enum UploadedItem {
    File {
        field: String,
        filename: String,
        content: Vec<u8>,
    },
    Scalar {
        name: String,
        value: String,
    },
}

/// What a staged upload name resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedItem {
    File(PathBuf),
    Scalar(String),
}

/// Everything the pipeline needs to know about one request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: Uuid,
    pub workspace: PathBuf,
    pub staged: IndexMap<String, StagedItem>,
    pub question: String,
}

impl RequestContext {
    pub fn result_path(&self) -> PathBuf {
        self.workspace.join(RESULT_ARTIFACT)
    }

    /// Staged files in upload order
    pub fn staged_files(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.staged.iter().filter_map(|(name, item)| match item {
            StagedItem::File(path) => Some((name.as_str(), path.as_path())),
            StagedItem::Scalar(_) => None,
        })
    }

    /// Scalar form fields in upload order
    pub fn scalars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.staged.iter().filter_map(|(name, item)| match item {
            StagedItem::Scalar(value) => Some((name.as_str(), value.as_str())),
            StagedItem::File(_) => None,
        })
    }
}

/// A request workspace found under the root
#[derive(Debug, Clone)]
pub struct WorkspaceEntry {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

/// Directory under which every request gets its own workspace
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    path: PathBuf,
}

impl WorkspaceRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create `<root>/<uuid>`; `create_dir` fails rather than reusing an
    /// existing directory
    pub async fn allocate(&self) -> Result<(Uuid, PathBuf), WorkspaceError> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .map_err(|e| WorkspaceError::io(&self.path, e))?;

        let id = Uuid::new_v4();
        let dir = self.path.join(id.to_string());
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|e| WorkspaceError::io(&dir, e))?;

        debug!(request_id = %id, workspace = %dir.display(), "Workspace allocated");
        Ok((id, dir))
    }

    /// List request workspaces with their last modification time
    pub async fn list(&self) -> Result<Vec<WorkspaceEntry>, WorkspaceError> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(WorkspaceError::io(&self.path, e)),
        };

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::io(&self.path, e))?
        {
            let path = entry.path();
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| WorkspaceError::io(&path, e))?;
            if !metadata.is_dir() {
                continue;
            }
            let is_request_dir = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| Uuid::parse_str(name).is_ok())
                .unwrap_or(false);
            if !is_request_dir {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(WorkspaceEntry {
                path,
                modified: DateTime::<Utc>::from(modified),
            });
        }

        entries.sort_by_key(|entry| entry.modified);
        Ok(entries)
    }

    /// Remove a workspace previously allocated under this root
    pub async fn remove(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        if workspace.parent() != Some(self.path.as_path()) {
            return Err(WorkspaceError::InvalidFilename(workspace.display().to_string()));
        }
        tokio::fs::remove_dir_all(workspace)
            .await
            .map_err(|e| WorkspaceError::io(workspace, e))
    }
}

/// Reduce an uploaded filename to a bare name safe to join onto the
/// workspace
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();

    match name {
        "" | "." | ".." => None,
        name if name.contains('\0') => None,
        name => Some(name.to_string()),
    }
}

fn is_question_sentinel(filename: &str) -> bool {
    filename.eq_ignore_ascii_case(QUESTION_SENTINEL)
}

/// Stage all uploads into a fresh workspace and resolve the question text
pub async fn stage(
    root: &WorkspaceRoot,
    items: Vec<UploadedItem>,
) -> Result<RequestContext, WorkspaceError> {
    // Validate everything before touching the filesystem
    let mut seen = HashSet::new();
    let mut prepared = Vec::with_capacity(items.len());
    for item in items {
        let (key, item) = match item {
            UploadedItem::File {
                filename, content, ..
            } => {
                let name = sanitize_filename(&filename)
                    .ok_or_else(|| WorkspaceError::InvalidFilename(filename.clone()))?;
                (name, Prepared::File(content))
            }
            UploadedItem::Scalar { name, value } => (name, Prepared::Scalar(value)),
        };
        // Names differing only in case collide on case-insensitive filesystems
        if !seen.insert(key.to_ascii_lowercase()) {
            return Err(WorkspaceError::DuplicateUpload(key));
        }
        prepared.push((key, item));
    }

    if !prepared
        .iter()
        .any(|(_, item)| matches!(item, Prepared::File(_)))
    {
        return Err(WorkspaceError::MissingQuestion);
    }

    let (id, workspace) = root.allocate().await?;

    let mut staged = IndexMap::new();
    let mut sentinel_question = None;
    let mut first_file_text = None;

    for (name, item) in prepared {
        match item {
            Prepared::File(content) => {
                let path = workspace.join(&name);
                tokio::fs::write(&path, &content)
                    .await
                    .map_err(|e| WorkspaceError::io(&path, e))?;

                if is_question_sentinel(&name) {
                    sentinel_question = Some(String::from_utf8_lossy(&content).into_owned());
                } else if first_file_text.is_none() {
                    first_file_text = Some(String::from_utf8_lossy(&content).into_owned());
                }

                debug!(request_id = %id, file = %name, bytes = content.len(), "Staged upload");
                staged.insert(name, StagedItem::File(path));
            }
            Prepared::Scalar(value) => {
                staged.insert(name, StagedItem::Scalar(value));
            }
        }
    }

    let from_sentinel = sentinel_question.is_some();
    let question = sentinel_question
        .or(first_file_text)
        .ok_or(WorkspaceError::MissingQuestion)?;

    info!(
        request_id = %id,
        staged = staged.len(),
        from_sentinel,
        question_chars = question.chars().count(),
        "Request staged"
    );

    Ok(RequestContext {
        id,
        workspace,
        staged,
        question,
    })
}

enum Prepared {
    File(Vec<u8>),
    Scalar(String),
}
