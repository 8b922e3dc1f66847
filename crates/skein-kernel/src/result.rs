use serde::{Deserialize, Serialize};

/// A file or inline object produced by one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionArtifact {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub original_name: String,
    #[serde(default)]
    pub file_name: String,
    /// Inline content for small artifacts; base64 when the encoding says so.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content_encoding: Option<String>,
    #[serde(default)]
    pub preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Outcome of one code execution.
///
/// `stdout`/`stderr` keep the kernel's chunk boundaries: concatenated, they
/// equal exactly what any streaming observer saw for the same execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    #[serde(default)]
    pub code: String,
    pub is_success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Display values as (name-or-mime, content) pairs.
    #[serde(default)]
    pub output: Vec<(String, String)>,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
    /// (level, tag, message) entries logged by plugins.
    #[serde(default)]
    pub log: Vec<(String, String, String)>,
    #[serde(default)]
    pub artifacts: Vec<ExecutionArtifact>,
    /// (name, short repr) pairs surfaced from the kernel namespace.
    #[serde(default)]
    pub variables: Vec<(String, String)>,
}

impl ExecutionResult {
    pub fn failed(execution_id: impl Into<String>, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            code: code.into(),
            is_success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// All stdout chunks joined, for display and prompt assembly.
    pub fn stdout_text(&self) -> String {
        self.stdout.concat()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_round_trips() {
        let result = ExecutionResult {
            execution_id: "e1".to_string(),
            code: "print('hello')".to_string(),
            is_success: true,
            error: None,
            output: vec![("text/plain".to_string(), "hello".to_string())],
            stdout: vec!["hello\n".to_string()],
            stderr: vec![],
            log: vec![("info".to_string(), "plugin".to_string(), "ok".to_string())],
            artifacts: vec![ExecutionArtifact {
                name: "chart".to_string(),
                kind: "image".to_string(),
                mime_type: "image/png".to_string(),
                ..ExecutionArtifact::default()
            }],
            variables: vec![("x".to_string(), "41".to_string())],
        };
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["artifacts"][0]["type"], "image");
        let back: ExecutionResult = serde_json::from_value(value).expect("deserialize");
        assert_eq!(result, back);
    }

    #[test]
    fn test_stdout_text_concatenates_chunks() {
        let result = ExecutionResult {
            stdout: vec!["0\n".to_string(), "1\n".to_string()],
            ..ExecutionResult::default()
        };
        assert_eq!(result.stdout_text(), "0\n1\n");
    }
}
