use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Request types (what the client sends TO us)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// A message's `content` field: either a bare string or a list of typed
/// blocks. Anything else is kept verbatim as `Malformed` so that decoding
/// the surrounding request never fails because of one bad message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    Malformed(Value),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Malformed(Value::Null)
    }
}

/// One element of a structured content list. Only `text` blocks carry
/// meaning for translation; every other mapping is preserved as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub enum ContentBlock {
    Text { text: String },
    Other(Map<String, Value>),
}

impl From<Map<String, Value>> for ContentBlock {
    fn from(map: Map<String, Value>) -> Self {
        let is_text = map.get("type").and_then(Value::as_str) == Some("text");
        match map.get("text").and_then(Value::as_str) {
            Some(text) if is_text => ContentBlock::Text {
                text: text.to_string(),
            },
            _ => ContentBlock::Other(map),
        }
    }
}

impl From<ContentBlock> for Map<String, Value> {
    fn from(block: ContentBlock) -> Self {
        match block {
            ContentBlock::Text { text } => {
                let mut map = Map::new();
                map.insert("type".to_string(), Value::String("text".to_string()));
                map.insert("text".to_string(), Value::String(text));
                map
            }
            ContentBlock::Other(map) => map,
        }
    }
}

// ---------------------------------------------------------------------------
// Response types (what we send BACK to the client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String, // "message"
    pub role: String,          // "assistant"
    pub content: Vec<ResponseContentBlock>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// ---------------------------------------------------------------------------
// Streaming event types (SSE events we send back to the client)
// ---------------------------------------------------------------------------

/// Every event the streaming translator can emit. All text lives in a single
/// content block at index 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStartBody },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: usize,
        content_block: ResponseContentBlock,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: Delta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_stop")]
    MessageStop {
        id: String,
        role: String,
        usage: Usage,
    },
    /// Terminal sentinel. Its wire payload is the literal `[DONE]`.
    #[serde(rename = "done")]
    Done,
}

/// The `message` object of `message_start`. Identity fields nest here, as in
/// Anthropic's own stream, rather than at the top level of the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStartBody {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ResponseContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            error_type: "error".to_string(),
            error: ErrorBody {
                error_type: error_type.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new("invalid_request_error", msg)
    }

    pub fn api_error(msg: impl Into<String>) -> Self {
        Self::new("api_error", msg)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

impl StreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageStop { .. } => "message_stop",
            StreamEvent::Done => "done",
        }
    }

    /// The `data:` payload of this event's SSE frame.
    pub fn payload(&self) -> serde_json::Result<String> {
        match self {
            StreamEvent::Done => Ok("[DONE]".to_string()),
            other => serde_json::to_string(other),
        }
    }

    /// Encode as one SSE frame: `event: <name>\ndata: <payload>\n\n`.
    pub fn to_sse_frame(&self) -> serde_json::Result<String> {
        Ok(format!(
            "event: {}\ndata: {}\n\n",
            self.event_name(),
            self.payload()?
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_decodes_string_and_blocks() {
        let text: MessageContent = serde_json::from_str("\"hi\"").unwrap();
        assert!(matches!(text, MessageContent::Text(ref t) if t == "hi"));

        let blocks: MessageContent = serde_json::from_str(
            r#"[{"type":"text","text":"a"},{"type":"image","source":{"data":"x"}}]"#,
        )
        .unwrap();
        match blocks {
            MessageContent::Blocks(b) => {
                assert_eq!(b[0], ContentBlock::Text { text: "a".to_string() });
                assert!(matches!(b[1], ContentBlock::Other(_)));
            }
            other => panic!("Expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_content_does_not_fail_request() {
        let req: MessagesRequest = serde_json::from_str(
            r#"{"model":"m","max_tokens":1,"messages":[{"role":"user","content":42},{"role":"user"}]}"#,
        )
        .unwrap();
        assert!(matches!(req.messages[0].content, MessageContent::Malformed(_)));
        assert!(matches!(req.messages[1].content, MessageContent::Malformed(Value::Null)));
    }

    #[test]
    fn test_text_block_with_non_string_text_is_other() {
        let block: ContentBlock = serde_json::from_str(r#"{"type":"text","text":5}"#).unwrap();
        assert!(matches!(block, ContentBlock::Other(_)));
    }

    #[test]
    fn test_done_frame_is_literal() {
        assert_eq!(
            StreamEvent::Done.to_sse_frame().unwrap(),
            "event: done\ndata: [DONE]\n\n"
        );
    }

    #[test]
    fn test_content_block_stop_frame() {
        let frame = StreamEvent::ContentBlockStop { index: 0 }
            .to_sse_frame()
            .unwrap();
        assert_eq!(
            frame,
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n"
        );
    }
}
