//! Flattening of message content into plain text.

use super::anthropic_types::{ContentBlock, MessageContent};

/// Reduce a message's content to plain text.
///
/// A bare string is returned unchanged. A block list yields the `text` of
/// every `text` block, concatenated in order; all other blocks are dropped.
/// Content that is neither degrades to an empty string.
pub fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other(_) => None,
            })
            .collect(),
        MessageContent::Malformed(value) => {
            tracing::warn!(content = %value, "Error parsing message content, using empty text");
            String::new()
        }
    }
}
