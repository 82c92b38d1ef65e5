use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Well-known artifact generated code must write to signal a usable answer
pub const RESULT_ARTIFACT: &str = "result.json";

/// Uploaded filename (case-insensitive) whose content is the question text
pub const QUESTION_SENTINEL: &str = "questions.txt";

/// Code, libraries and normalized questions returned by the acquisition
/// synthesis call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub code: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub libraries: Vec<String>,
    #[serde(default)]
    pub questions: String,
}

/// Answer-phase synthesis carries only code and libraries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSynthesis {
    pub code: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub libraries: Vec<String>,
}

/// Tri-state execution status reported by a sandbox
///
/// On the wire this is a bare integer: `1` success, `0` recoverable,
/// anything else terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ExecutionStatus {
    Success,
    Recoverable,
    Terminal(i64),
}

impl From<i64> for ExecutionStatus {
    fn from(code: i64) -> Self {
        match code {
            1 => ExecutionStatus::Success,
            0 => ExecutionStatus::Recoverable,
            other => ExecutionStatus::Terminal(other),
        }
    }
}

impl From<ExecutionStatus> for i64 {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => 1,
            ExecutionStatus::Recoverable => 0,
            ExecutionStatus::Terminal(code) => code,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", i64::from(*self))
    }
}

/// Status plus captured output of one sandbox execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub code: ExecutionStatus,
    pub output: String,
}

impl ExecutionOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            code: ExecutionStatus::Success,
            output: output.into(),
        }
    }

    pub fn recoverable(output: impl Into<String>) -> Self {
        Self {
            code: ExecutionStatus::Recoverable,
            output: output.into(),
        }
    }

    pub fn terminal(code: i64, output: impl Into<String>) -> Self {
        Self {
            code: ExecutionStatus::from(code),
            output: output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ExecutionStatus::Success
    }
}

/// Pipeline phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Acquisition,
    Answer,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Acquisition => "acquisition",
            Phase::Answer => "answer",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LLMs return libraries either as a JSON list or as a single
/// comma/whitespace separated string
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Libraries {
        List(Vec<String>),
        Joined(String),
        Missing(Option<()>),
    }

    let libraries = match Libraries::deserialize(deserializer)? {
        Libraries::List(list) => list,
        Libraries::Joined(joined) => joined
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::to_string)
            .collect(),
        Libraries::Missing(_) => Vec::new(),
    };

    Ok(libraries
        .into_iter()
        .map(|lib| lib.trim().to_string())
        .filter(|lib| !lib.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_wire_code() {
        assert_eq!(ExecutionStatus::from(1), ExecutionStatus::Success);
        assert_eq!(ExecutionStatus::from(0), ExecutionStatus::Recoverable);
        assert_eq!(ExecutionStatus::from(-1), ExecutionStatus::Terminal(-1));
        assert_eq!(ExecutionStatus::from(137), ExecutionStatus::Terminal(137));
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome: ExecutionOutcome =
            serde_json::from_str(r#"{"code": 0, "output": "HTTP 503"}"#).unwrap();
        assert_eq!(outcome.code, ExecutionStatus::Recoverable);
        assert_eq!(outcome.output, "HTTP 503");

        let json = serde_json::to_value(ExecutionOutcome::terminal(2, "boom")).unwrap();
        assert_eq!(json["code"], 2);
    }

    #[test]
    fn test_libraries_as_list() {
        let result: SynthesisResult = serde_json::from_str(
            r#"{"code": "print(1)", "libraries": ["pandas", " numpy "], "questions": "q"}"#,
        )
        .unwrap();
        assert_eq!(result.libraries, vec!["pandas", "numpy"]);
    }

    #[test]
    fn test_libraries_as_joined_string() {
        let result: AnswerSynthesis =
            serde_json::from_str(r#"{"code": "x", "libraries": "pandas, matplotlib  bs4"}"#)
                .unwrap();
        assert_eq!(result.libraries, vec!["pandas", "matplotlib", "bs4"]);
    }

    #[test]
    fn test_libraries_null_or_missing() {
        let result: AnswerSynthesis =
            serde_json::from_str(r#"{"code": "x", "libraries": null}"#).unwrap();
        assert!(result.libraries.is_empty());

        let result: SynthesisResult = serde_json::from_str(r#"{"code": "x"}"#).unwrap();
        assert!(result.libraries.is_empty());
        assert!(result.questions.is_empty());
    }

    #[test]
    fn test_missing_code_is_rejected() {
        let result = serde_json::from_str::<AnswerSynthesis>(r#"{"libraries": []}"#);
        assert!(result.is_err());
    }
}
