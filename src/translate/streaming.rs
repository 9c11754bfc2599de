//! State machine for translating OpenAI streaming chunks into Anthropic SSE events.
//!
//! The [`StreamTranslator`] consumes upstream SSE lines one at a time and emits the
//! Anthropic events for them. A stream always uses a single text block at index 0
//! and moves through `NotStarted → Started → ContentOpen → ContentClosed → Stopped`.
//! [`SseLineBuffer`] reassembles lines from the raw upstream byte chunks.

use std::sync::Arc;

use super::anthropic_types::{Delta, MessageStartBody, ResponseContentBlock, StreamEvent, Usage};
use super::openai_types::ChatCompletionChunk;
use crate::cost::UsageData;
use crate::tokens::{RequestSchema, TokenCounter};

const DONE_SENTINEL: &str = "[DONE]";
const DATA_PREFIX: &str = "data: ";
const BLOCK_INDEX: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    Started,
    ContentOpen,
    ContentClosed,
    Stopped,
}

/// State machine that translates OpenAI streaming chunks into Anthropic SSE events.
///
/// Usage:
///   let mut translator = StreamTranslator::new("openai/gpt-4o", Some(12), counter);
///   for line in upstream_lines {
///       for event in translator.process_line(&line) {
///           // write event.to_sse_frame() and flush
///       }
///   }
///   let usage = translator.final_usage();
#[derive(Debug)]
pub struct StreamTranslator {
    state: StreamState,
    model: String,
    message_id: String,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    text: String,
    counter: Arc<TokenCounter>,
}

impl StreamTranslator {
    /// `input_tokens` is `None` when the request could not be counted.
    pub fn new(model: &str, input_tokens: Option<u64>, counter: Arc<TokenCounter>) -> Self {
        Self {
            state: StreamState::NotStarted,
            model: model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            input_tokens,
            output_tokens: None,
            text: String::new(),
            counter,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// All delta text seen so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_stopped(&self) -> bool {
        self.state == StreamState::Stopped
    }

    /// Open the message and its content block. Idempotent.
    pub fn begin(&mut self) -> Vec<StreamEvent> {
        if self.state != StreamState::NotStarted {
            return Vec::new();
        }

        let message_start = StreamEvent::MessageStart {
            message: MessageStartBody {
                id: self.message_id.clone(),
                message_type: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
            },
        };
        self.state = StreamState::Started;

        let block_start = StreamEvent::ContentBlockStart {
            index: BLOCK_INDEX,
            content_block: ResponseContentBlock::Text {
                text: String::new(),
            },
        };
        self.state = StreamState::ContentOpen;

        vec![message_start, block_start]
    }

    /// Process one upstream SSE line, returning zero or more events to emit.
    pub fn process_line(&mut self, line: &str) -> Vec<StreamEvent> {
        if self.is_stopped() || line.is_empty() || line.starts_with(':') {
            return Vec::new();
        }
        let Some(data) = line.strip_prefix(DATA_PREFIX) else {
            return Vec::new();
        };

        let mut events = self.begin();

        if data == DONE_SENTINEL {
            events.extend(self.finish());
            return events;
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!("Skipping unparseable chunk: {e}");
                return events;
            }
        };

        if let Some(text) = chunk.delta_text() {
            self.text.push_str(text);
            events.push(StreamEvent::ContentBlockDelta {
                index: BLOCK_INDEX,
                delta: Delta::TextDelta {
                    text: text.to_string(),
                },
            });
        }

        events
    }

    /// Usage to record for this stream: the request's input tokens and the output
    /// tokens of all accumulated text. `None` if either count is unavailable.
    pub fn final_usage(&self) -> Option<UsageData> {
        let input = self.input_tokens?;
        let output = match self.output_tokens {
            Some(n) => n,
            None => self.count_output()?,
        };
        Some(UsageData::from_counts(input, output, RequestSchema::Source))
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::with_capacity(3);

        if self.state == StreamState::ContentOpen {
            events.push(StreamEvent::ContentBlockStop { index: BLOCK_INDEX });
            self.state = StreamState::ContentClosed;
        }

        self.output_tokens = self.count_output();
        events.push(StreamEvent::MessageStop {
            id: self.message_id.clone(),
            role: "assistant".to_string(),
            usage: Usage {
                input_tokens: self.input_tokens.unwrap_or_default(),
                output_tokens: self.output_tokens.unwrap_or_default(),
            },
        });
        events.push(StreamEvent::Done);
        self.state = StreamState::Stopped;

        events
    }

    fn count_output(&self) -> Option<u64> {
        match self.counter.count_tokens(&self.text, &self.model) {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!("Error counting tokens in response: {e}");
                None
            }
        }
    }
}

/// Splits a byte stream into lines. A line ends at `\n`; a trailing `\r` is
/// dropped. Bytes are only decoded once a whole line is available.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        Some(decode_line(line))
    }

    /// Whatever is left once the stream has ended without a final newline.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        Some(decode_line(std::mem::take(&mut self.buf)))
    }
}

fn decode_line(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8_lossy(&line).into_owned()
}
