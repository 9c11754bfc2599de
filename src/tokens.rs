//! Token counting for request and response text.
//!
//! Counts are computed locally with a BPE tokenizer chosen from the model name.
//! Selection is advisory: unrecognised models fall back to `cl100k_base`.

use crate::error::{ProxyError, Result};
use crate::translate::anthropic_types::MessagesRequest;
use crate::translate::content::extract_text;
use crate::translate::openai_types::ChatCompletionRequest;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tiktoken_rs::CoreBPE;

/// BPE vocabularies the counter knows how to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Cl100kBase,
}

impl Encoding {
    pub fn for_model(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.contains("gpt-4") || lower.contains("gpt-3.5-turbo") || lower.contains("claude") {
            return Encoding::Cl100kBase;
        }
        tracing::debug!(model, "Unknown model family, using cl100k_base encoding");
        Encoding::Cl100kBase
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Cl100kBase => "cl100k_base",
        }
    }

    fn load(self) -> Result<CoreBPE> {
        let loaded = match self {
            Encoding::Cl100kBase => tiktoken_rs::cl100k_base(),
        };
        loaded.map_err(|e| ProxyError::tokenizer(format!("Failed to load {}: {e}", self.name())))
    }
}

/// Which API schema a raw request body is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSchema {
    /// Anthropic Messages
    Source,
    /// OpenAI Chat Completions
    Target,
}

/// Lazily loads and caches one encoder per [`Encoding`].
#[derive(Default)]
pub struct TokenCounter {
    encoders: Mutex<HashMap<Encoding, Arc<CoreBPE>>>,
}

impl fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaded: Vec<&'static str> = self
            .encoders
            .lock()
            .map(|m| m.keys().map(|e| e.name()).collect())
            .unwrap_or_default();
        f.debug_struct("TokenCounter").field("loaded", &loaded).finish()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the tokens in `text` under the tokenizer family of `model`.
    pub fn count_tokens(&self, text: &str, model: &str) -> Result<u64> {
        if text.is_empty() {
            return Ok(0);
        }
        let encoder = self.encoder(Encoding::for_model(model))?;
        Ok(encoder.encode_with_special_tokens(text).len() as u64)
    }

    /// Sum the tokens of every message in a raw request body.
    ///
    /// Source-schema bodies have each message flattened to text first (the system
    /// prompt counts too); target-schema bodies already carry flat strings.
    pub fn count_tokens_in_request(&self, body: &str, schema: RequestSchema) -> Result<u64> {
        match schema {
            RequestSchema::Source => {
                let req: MessagesRequest = serde_json::from_str(body)?;
                let system = req.system.as_ref().map(extract_text);
                system
                    .iter()
                    .map(String::as_str)
                    .map(|text| self.count_tokens(text, &req.model))
                    .chain(req.messages.iter().map(|m| {
                        self.count_tokens(&extract_text(&m.content), &req.model)
                    }))
                    .sum()
            }
            RequestSchema::Target => {
                let req: ChatCompletionRequest = serde_json::from_str(body)?;
                req.messages
                    .iter()
                    .map(|m| self.count_tokens(&m.content, &req.model))
                    .sum()
            }
        }
    }

    /// Load `encoding` now so the first request does not pay for it.
    pub fn warm(&self, encoding: Encoding) -> Result<()> {
        self.encoder(encoding).map(|_| ())
    }

    fn encoder(&self, encoding: Encoding) -> Result<Arc<CoreBPE>> {
        let mut encoders = self
            .encoders
            .lock()
            .map_err(|_| ProxyError::tokenizer("Encoder cache lock poisoned"))?;
        if let Some(encoder) = encoders.get(&encoding) {
            return Ok(Arc::clone(encoder));
        }
        let encoder = Arc::new(encoding.load()?);
        encoders.insert(encoding, Arc::clone(&encoder));
        Ok(encoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encoding_selection_falls_back() {
        assert_eq!(Encoding::for_model("GPT-4o"), Encoding::Cl100kBase);
        assert_eq!(Encoding::for_model("gpt-3.5-turbo-0125"), Encoding::Cl100kBase);
        assert_eq!(Encoding::for_model("claude-3-haiku"), Encoding::Cl100kBase);
        assert_eq!(Encoding::for_model("mystery-model"), Encoding::Cl100kBase);
    }

    #[test]
    fn test_warm_loads_encoder_once() {
        let counter = TokenCounter::new();
        assert!(format!("{counter:?}").contains("[]"));
        counter.warm(Encoding::Cl100kBase).unwrap();
        counter.warm(Encoding::Cl100kBase).unwrap();
        assert!(format!("{counter:?}").contains("[\"cl100k_base\"]"));
        assert_eq!(counter.count_tokens("hello world", "gpt-4").unwrap(), 2);
    }

    #[test]
    fn test_count_tokens() {
        let counter = TokenCounter::new();
        assert_eq!(counter.count_tokens("", "gpt-4").unwrap(), 0);
        assert_eq!(counter.count_tokens("hello world", "gpt-4").unwrap(), 2);
        // Unknown models count the same way as known ones.
        assert_eq!(
            counter.count_tokens("Hello world", "unknown").unwrap(),
            counter.count_tokens("Hello world", "claude-3-opus").unwrap()
        );
    }

    #[test]
    fn test_count_source_request_flattens_blocks() {
        let counter = TokenCounter::new();
        let body = json!({
            "model": "claude-3-haiku",
            "max_tokens": 10,
            "messages": [
                {"role": "user", "content": "hello world"},
                {"role": "user", "content": [
                    {"type": "text", "text": "hello world"},
                    {"type": "image", "source": {}},
                ]},
                {"role": "user", "content": 3},
            ],
        })
        .to_string();

        let total = counter
            .count_tokens_in_request(&body, RequestSchema::Source)
            .unwrap();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_count_source_request_includes_system() {
        let counter = TokenCounter::new();
        let body = json!({
            "model": "claude-3-haiku",
            "system": "hello world",
            "messages": [{"role": "user", "content": "hello world"}],
        })
        .to_string();

        assert_eq!(
            counter
                .count_tokens_in_request(&body, RequestSchema::Source)
                .unwrap(),
            4
        );
    }

    #[test]
    fn test_count_target_request() {
        let counter = TokenCounter::new();
        let body = json!({
            "model": "openai/gpt-4",
            "max_tokens": 10,
            "messages": [
                {"role": "system", "content": "hello world"},
                {"role": "user", "content": "hello world"},
            ],
        })
        .to_string();

        assert_eq!(
            counter
                .count_tokens_in_request(&body, RequestSchema::Target)
                .unwrap(),
            4
        );
    }

    #[test]
    fn test_unparseable_request_is_an_error() {
        let counter = TokenCounter::new();
        assert!(counter
            .count_tokens_in_request("not json", RequestSchema::Source)
            .is_err());
    }
}
