use super::anthropic_types::{MessagesResponse, ResponseContentBlock, Usage};
use super::openai_types::ChatCompletionResponse;

/// Translate an OpenAI Chat Completion response into an Anthropic Messages response.
/// Only the first choice is carried over; usage is copied, never recomputed.
pub fn openai_to_anthropic(resp: &ChatCompletionResponse) -> MessagesResponse {
    let choice = resp.choices.first();

    let content = choice
        .map(|c| {
            vec![ResponseContentBlock::Text {
                text: c.message.content.clone().unwrap_or_default(),
            }]
        })
        .unwrap_or_default();

    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .filter(|r| !r.is_empty())
        .map(map_finish_reason);

    MessagesResponse {
        id: resp.id.clone(),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model.clone(),
        stop_reason,
        stop_sequence: None,
        usage: Usage {
            input_tokens: resp.usage.prompt_tokens,
            output_tokens: resp.usage.completion_tokens,
        },
    }
}

/// Map OpenAI finish_reason to Anthropic stop_reason
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" | "function_call" => "tool_use".to_string(),
        "content_filter" => "end_turn".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::*;

    fn make_response(choices: Vec<Choice>) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-abc123".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "openai/gpt-4o".to_string(),
            choices,
            usage: ChatUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            },
        }
    }

    fn choice(content: Option<&str>, finish_reason: Option<&str>) -> Choice {
        Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: content.map(String::from),
            },
            finish_reason: finish_reason.map(String::from),
        }
    }

    #[test]
    fn test_simple_text_response() {
        let resp = make_response(vec![choice(Some("Hello!"), Some("stop"))]);
        let result = openai_to_anthropic(&resp);

        assert_eq!(result.id, "chatcmpl-abc123");
        assert_eq!(result.response_type, "message");
        assert_eq!(result.role, "assistant");
        assert_eq!(result.model, "openai/gpt-4o");
        assert_eq!(result.stop_reason, Some("end_turn".to_string()));
        assert_eq!(
            result.content,
            vec![ResponseContentBlock::Text {
                text: "Hello!".to_string()
            }]
        );
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.usage.output_tokens, 20);
    }

    #[test]
    fn test_only_first_choice_is_used() {
        let resp = make_response(vec![
            choice(Some("first"), Some("length")),
            choice(Some("second"), Some("stop")),
        ]);
        let result = openai_to_anthropic(&resp);

        assert_eq!(result.content.len(), 1);
        assert_eq!(
            result.content[0],
            ResponseContentBlock::Text {
                text: "first".to_string()
            }
        );
        assert_eq!(result.stop_reason, Some("max_tokens".to_string()));
    }

    #[test]
    fn test_empty_choices_yield_empty_content() {
        let result = openai_to_anthropic(&make_response(Vec::new()));
        assert!(result.content.is_empty());
        assert_eq!(result.stop_reason, None);
        assert_eq!(result.usage.input_tokens, 10);
    }

    #[test]
    fn test_missing_finish_reason_is_omitted() {
        let result = openai_to_anthropic(&make_response(vec![choice(None, None)]));
        assert_eq!(result.stop_reason, None);
        assert_eq!(
            result.content[0],
            ResponseContentBlock::Text {
                text: String::new()
            }
        );

        let wire = serde_json::to_value(&result).unwrap();
        assert!(wire.get("stop_reason").is_none());
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("unknown"), "unknown");
    }

    #[test]
    fn test_null_usage_and_choices_still_translate() {
        let body = r#"{
            "id": "chatcmpl-null",
            "object": "chat.completion",
            "model": "openai/gpt-4o",
            "choices": null,
            "usage": null
        }"#;
        let resp: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        let result = openai_to_anthropic(&resp);

        assert_eq!(result.id, "chatcmpl-null");
        assert!(result.content.is_empty());
        assert_eq!(result.usage.input_tokens, 0);
        assert_eq!(result.usage.output_tokens, 0);
    }
}
