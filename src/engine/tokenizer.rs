use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

use crate::error::{HarnessError, Result};

use super::Token;

/// End-of-sequence names tried in order when none is configured.
const EOS_CANDIDATES: &[&str] = &["<|im_end|>", "<|endoftext|>", "</s>", "<|end_of_text|>"];

/// Tokenizer contract used by the planner and the decode loop.
pub trait TextCodec {
    fn encode(&self, text: &str) -> Result<Vec<Token>>;

    fn decode(&self, tokens: &[Token], skip_special: bool) -> Result<String>;

    fn eos_token(&self) -> Token;
}

impl<C: TextCodec + ?Sized> TextCodec for Box<C> {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        (**self).encode(text)
    }

    fn decode(&self, tokens: &[Token], skip_special: bool) -> Result<String> {
        (**self).decode(tokens, skip_special)
    }

    fn eos_token(&self) -> Token {
        (**self).eos_token()
    }
}

/// HuggingFace `tokenizer.json` backed codec.
pub struct HfCodec {
    tokenizer: Tokenizer,
    eos: Token,
}

impl HfCodec {
    pub fn load(location: &Path, eos_name: Option<&str>) -> Result<Self> {
        let path = resolve_tokenizer_path(location).ok_or_else(|| {
            HarnessError::Config(format!("tokenizer.json not found at {}", location.display()))
        })?;
        tracing::info!(path = %path.display(), "loading tokenizer");
        let tokenizer = Tokenizer::from_file(&path)
            .map_err(|e| HarnessError::Config(format!("cannot load tokenizer: {}", e)))?;
        Self::from_tokenizer(tokenizer, eos_name)
    }

    pub fn from_tokenizer(tokenizer: Tokenizer, eos_name: Option<&str>) -> Result<Self> {
        let eos = resolve_eos(&tokenizer, eos_name)?;
        // first decode is slow on some tokenizers; pay it before timing starts
        let _ = tokenizer.decode(&[0], true);
        Ok(Self { tokenizer, eos })
    }
}

impl TextCodec for HfCodec {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| HarnessError::Encoding(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[Token], skip_special: bool) -> Result<String> {
        self.tokenizer
            .decode(tokens, skip_special)
            .map_err(|e| HarnessError::Encoding(e.to_string()))
    }

    fn eos_token(&self) -> Token {
        self.eos
    }
}

fn resolve_eos(tokenizer: &Tokenizer, eos_name: Option<&str>) -> Result<Token> {
    if let Some(name) = eos_name {
        return tokenizer.token_to_id(name).ok_or_else(|| {
            HarnessError::Config(format!("tokenizer has no token named '{}'", name))
        });
    }
    EOS_CANDIDATES
        .iter()
        .find_map(|name| tokenizer.token_to_id(name))
        .ok_or_else(|| {
            HarnessError::Config(format!(
                "tokenizer defines none of the end-of-sequence tokens {:?}",
                EOS_CANDIDATES
            ))
        })
}

/// Accepts either a `tokenizer.json` file or a directory holding one.
pub fn resolve_tokenizer_path(location: &Path) -> Option<PathBuf> {
    if location.is_file() {
        return Some(location.to_path_buf());
    }

    let in_dir = location.join("tokenizer.json");
    if in_dir.is_file() {
        return Some(in_dir);
    }

    None
}
