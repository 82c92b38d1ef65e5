// Prompt construction for the synthesis client

use indexmap::IndexMap;
use quarry_common::types::RESULT_ARTIFACT;
use quarry_common::workspace::StagedItem;
use std::fmt::Write as _;
use std::path::Path;
use tokio::io::{AsyncReadExt, BufReader};

const PREVIEW_LINES: usize = 5;
const PREVIEW_CHARS: usize = 600;
/// Enough bytes for `PREVIEW_CHARS` characters of any UTF-8 text
const PREVIEW_BYTES: u64 = (PREVIEW_CHARS * 4) as u64;
const PREVIEWABLE_EXTENSIONS: &[&str] = &["csv", "tsv", "txt", "json", "md", "html", "xml"];

pub const ACQUISITION_SYSTEM: &str = r#"You are a data engineer writing Python 3 scripts.
Given analysis questions and the files already uploaded, write ONE script that
collects every piece of data needed to answer them:
- read the uploaded files from the current working directory;
- scrape or download anything else the questions reference;
- save every acquired dataset into the current working directory
  (CSV for tables, original format otherwise) with descriptive filenames;
- print a short summary of each saved file (name, columns, row count);
- exit with a non-zero status (raise) if any required data could not be obtained.
Do NOT answer the questions yet.

Respond with a JSON object only:
{"code": "<python source>", "libraries": ["<pip package>", ...], "questions": "<the questions restated as a numbered list, naming the files that hold their data and the exact output format requested>"}"#;

pub const ANSWER_SYSTEM: &str = r#"You are a data analyst writing Python 3 scripts.
The data needed for the questions is already in the current working directory.
Write ONE script that computes every answer and writes them to `result.json`
in the current working directory, using exactly the output structure the
questions ask for (a JSON array or object). Encode images as base64 data URIs
when a plot is requested. Raise an exception if an answer cannot be computed.

Respond with a JSON object only:
{"code": "<python source>", "libraries": ["<pip package>", ...]}"#;

/// One workspace file as shown to the answer prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub name: String,
    pub bytes: u64,
    pub preview: Option<String>,
}

pub fn acquisition_prompt(question: &str, staged: &IndexMap<String, StagedItem>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Questions:\n{}\n", question.trim_end());

    let files: Vec<&str> = staged
        .iter()
        .filter(|(_, item)| matches!(item, StagedItem::File(_)))
        .map(|(name, _)| name.as_str())
        .collect();
    if files.is_empty() {
        prompt.push_str("Uploaded files: none\n");
    } else {
        prompt.push_str("Uploaded files (in the working directory):\n");
        for name in files {
            let _ = writeln!(prompt, "- {}", name);
        }
    }

    let scalars: Vec<(&str, &str)> = staged
        .iter()
        .filter_map(|(name, item)| match item {
            StagedItem::Scalar(value) => Some((name.as_str(), value.as_str())),
            StagedItem::File(_) => None,
        })
        .collect();
    if !scalars.is_empty() {
        prompt.push_str("\nAdditional form values:\n");
        for (name, value) in scalars {
            let _ = writeln!(prompt, "- {}: {}", name, value);
        }
    }

    prompt
}

pub fn answer_prompt(questions: &str, files: &[FileSummary]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Questions:\n{}\n", questions.trim_end());

    if files.is_empty() {
        prompt.push_str("Files in the working directory: none\n");
        return prompt;
    }

    prompt.push_str("Files in the working directory:\n");
    for file in files {
        let _ = writeln!(prompt, "- {} ({} bytes)", file.name, file.bytes);
        if let Some(preview) = &file.preview {
            for line in preview.lines() {
                let _ = writeln!(prompt, "    {}", line);
            }
        }
    }
    let _ = writeln!(prompt, "\nWrite the answers to {}.", RESULT_ARTIFACT);
    prompt
}

/// Summarize the visible files of a workspace; hidden entries and a stale
/// result artifact are skipped
pub async fn describe_workspace(workspace: &Path) -> std::io::Result<Vec<FileSummary>> {
    let mut summaries = Vec::new();
    let mut dir = tokio::fs::read_dir(workspace).await?;

    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == RESULT_ARTIFACT {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let previewable = Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| PREVIEWABLE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false);

        let preview = if previewable {
            let content = read_prefix(&entry.path()).await?;
            Some(preview_text(&String::from_utf8_lossy(&content)))
        } else {
            None
        };

        summaries.push(FileSummary {
            name,
            bytes: metadata.len(),
            preview,
        });
    }

    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}

/// Read at most `PREVIEW_BYTES` from the start of a file
async fn read_prefix(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut content = Vec::new();
    BufReader::new(file)
        .take(PREVIEW_BYTES)
        .read_to_end(&mut content)
        .await?;
    Ok(content)
}

fn preview_text(content: &str) -> String {
    let head: Vec<&str> = content.lines().take(PREVIEW_LINES).collect();
    let head = head.join("\n");
    if head.chars().count() > PREVIEW_CHARS {
        head.chars().take(PREVIEW_CHARS).collect()
    } else {
        head
    }
}
