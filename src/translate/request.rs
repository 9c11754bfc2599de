//! Translate Anthropic Messages API requests into `OpenAI` Chat Completions requests.
//!
//! Every message is flattened to plain text, the optional system prompt becomes a
//! leading `system` message, and optional sampling parameters are carried over only
//! when the client actually set them.

use super::anthropic_types::MessagesRequest;
use super::content::extract_text;
use super::openai_types::{ChatCompletionRequest, ChatMessage};

const PROVIDER_PREFIX: &str = "openai/";

/// Translate an Anthropic Messages API request into an `OpenAI` Chat Completions request.
/// Total: malformed message content degrades to empty text instead of failing.
pub fn anthropic_to_openai(req: &MessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(ref system) = req.system {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: extract_text(system),
        });
    }

    messages.extend(req.messages.iter().map(|msg| ChatMessage {
        role: msg.role.clone(),
        content: extract_text(&msg.content),
    }));

    let stop = req
        .stop_sequences
        .as_ref()
        .filter(|s| !s.is_empty())
        .cloned();

    ChatCompletionRequest {
        model: target_model_name(&req.model),
        max_tokens: req.max_tokens,
        messages,
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        n: req.top_k.filter(|k| *k > 0),
        stop,
        presence_penalty: req.presence_penalty,
        frequency_penalty: req.frequency_penalty,
    }
}

/// Namespace a model with the upstream provider prefix unless it already has one.
pub fn target_model_name(model: &str) -> String {
    if model.contains('/') {
        model.to_string()
    } else {
        format!("{PROVIDER_PREFIX}{model}")
    }
}
