use crate::engine::{TextCodec, Token};
use crate::error::Result;

/// Shared prefix tokens, encoded once per (model, prefix bound) pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedPrefix {
    tokens: Vec<Token>,
    /// Length before truncation.
    encoded_len: usize,
}

impl SharedPrefix {
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn was_truncated(&self) -> bool {
        self.encoded_len > self.tokens.len()
    }
}

/// Prompt for one task: shared prefix followed by the task's own tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPrompt {
    tokens: Vec<Token>,
    shared_len: usize,
}

impl TaskPrompt {
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn shared_len(&self) -> usize {
        self.shared_len
    }

    pub fn tail(&self) -> &[Token] {
        &self.tokens[self.shared_len..]
    }
}

/// Splits prompt text into a bounded shared prefix and an unbounded tail.
pub struct PrefixPlanner<'c, C: TextCodec + ?Sized> {
    codec: &'c C,
}

impl<'c, C: TextCodec + ?Sized> PrefixPlanner<'c, C> {
    pub fn new(codec: &'c C) -> Self {
        Self { codec }
    }

    /// Encodes the shared context, keeping at most `max_len` leading tokens.
    pub fn shared_prefix(&self, text: &str, max_len: Option<usize>) -> Result<SharedPrefix> {
        let mut tokens = self.codec.encode(text)?;
        let encoded_len = tokens.len();
        if let Some(limit) = max_len {
            truncate_tokens(&mut tokens, limit);
        }
        if encoded_len > tokens.len() {
            tracing::debug!(
                encoded = encoded_len,
                kept = tokens.len(),
                "shared prefix truncated"
            );
        }
        Ok(SharedPrefix {
            tokens,
            encoded_len,
        })
    }

    /// Appends the encoded task text to `prefix`.
    pub fn task_prompt(&self, prefix: &SharedPrefix, task_text: &str) -> Result<TaskPrompt> {
        let tail = self.codec.encode(task_text)?;
        let mut tokens = Vec::with_capacity(prefix.len() + tail.len());
        tokens.extend_from_slice(prefix.tokens());
        tokens.extend(tail);
        Ok(TaskPrompt {
            tokens,
            shared_len: prefix.len(),
        })
    }
}

/// Keeps the first `max_len` tokens.
pub fn truncate_tokens(tokens: &mut Vec<Token>, max_len: usize) {
    tokens.truncate(max_len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use crate::stub::ByteCodec;

    #[test]
    fn truncation_keeps_leading_tokens() {
        let original: Vec<Token> = (0..10).collect();
        for limit in [0usize, 1, 5, 10, 25] {
            let mut tokens = original.clone();
            truncate_tokens(&mut tokens, limit);
            let kept = limit.min(original.len());
            assert_eq!(tokens.len(), kept);
            assert_eq!(tokens[..], original[..kept]);
        }
    }

    #[test]
    fn builds_prefix_and_task_prompt() {
        let codec = ByteCodec;
        let planner = PrefixPlanner::new(&codec);

        let prefix = planner
            .shared_prefix("system context", Some(6))
            .expect("prefix");
        assert_eq!(prefix.tokens(), codec.encode("system").expect("encode").as_slice());
        assert!(prefix.was_truncated());

        let prompt = planner.task_prompt(&prefix, "question?").expect("prompt");
        assert_eq!(prompt.shared_len(), 6);
        assert_eq!(prompt.tail(), codec.encode("question?").expect("encode").as_slice());
        assert_eq!(prompt.tokens().len(), 6 + 9);
    }

    #[test]
    fn unbounded_and_empty_prefix() {
        let codec = ByteCodec;
        let planner = PrefixPlanner::new(&codec);

        let full = planner.shared_prefix("abc", None).expect("prefix");
        assert_eq!(full.len(), 3);
        assert!(!full.was_truncated());

        let empty = planner.shared_prefix("", Some(100)).expect("prefix");
        assert!(empty.is_empty());
        let prompt = planner.task_prompt(&empty, "q").expect("prompt");
        assert_eq!(prompt.shared_len(), 0);
    }

    #[test]
    fn codec_rejection_is_an_encoding_error() {
        let codec = ByteCodec;
        let planner = PrefixPlanner::new(&codec);
        let err = planner.shared_prefix("bad\0text", None).expect_err("reject");
        assert!(matches!(err, HarnessError::Encoding(_)));
    }
}
