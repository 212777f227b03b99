use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{HarnessError, Result};

/// ChatML system turn plus the opening of the user turn. The shared context
/// is appended directly after it.
pub const SYSTEM_PREAMBLE: &str =
    "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n<|im_start|>user\n";

/// Closes the user turn and opens the assistant turn.
pub const ASSISTANT_OPENER: &str = "<|im_end|>\n<|im_start|>assistant\n";

/// One record of the test-case file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub content: Option<String>,
    pub question: String,
}

impl TestCase {
    /// Text of the shared prefix: the system preamble followed by the record's
    /// content, or nothing when the record has no content.
    pub fn shared_text(&self) -> String {
        match &self.content {
            Some(content) => format!("{}{}", SYSTEM_PREAMBLE, content),
            None => String::new(),
        }
    }

    /// Text of the unshared tail.
    pub fn task_text(&self) -> String {
        format!("{}{}", self.question, ASSISTANT_OPENER)
    }
}

/// Ordered collection of test cases.
#[derive(Debug, Clone, Default)]
pub struct TestCases {
    cases: Vec<TestCase>,
}

impl TestCases {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let cases: Vec<TestCase> = serde_json::from_str(raw)
            .map_err(|e| HarnessError::Config(format!("test cases: {}", e)))?;
        Ok(Self { cases })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read test cases {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn get(&self, index: usize) -> Result<&TestCase> {
        self.cases.get(index).ok_or_else(|| {
            HarnessError::InvalidInput(format!(
                "test case {} does not exist ({} loaded)",
                index,
                self.cases.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl From<Vec<TestCase>> for TestCases {
    fn from(cases: Vec<TestCase>) -> Self {
        Self { cases }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_records_with_chatml_delimiters() {
        let cases = TestCases::from_json_str(
            r#"[{"content": "Long document.", "question": "can you help me"},
                {"question": "tell me a love story"}]"#,
        )
        .expect("cases parse");
        assert_eq!(cases.len(), 2);

        let first = cases.get(0).expect("case 0");
        assert_eq!(
            first.shared_text(),
            "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n<|im_start|>user\nLong document."
        );
        assert_eq!(
            first.task_text(),
            "can you help me<|im_end|>\n<|im_start|>assistant\n"
        );

        let second = cases.get(1).expect("case 1");
        assert_eq!(second.shared_text(), "");
        assert!(second.task_text().starts_with("tell me a love story<|im_end|>"));
    }

    #[test]
    fn missing_question_or_index_is_reported() {
        assert!(TestCases::from_json_str(r#"[{"content": "x"}]"#).is_err());

        let cases = TestCases::from(vec![TestCase {
            content: None,
            question: "q".to_string(),
        }]);
        assert!(matches!(cases.get(3), Err(HarnessError::InvalidInput(_))));
    }
}
