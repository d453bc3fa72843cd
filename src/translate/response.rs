//! Buffered response translation back into the caller dialect.

use super::openai_types::{
    AssistantMessage, ChatCompletionResponse, Choice, Usage,
};
use super::upstream;

/// Wrap assistant text into a single buffered completion. Usage counters are
/// zeroed because the upstream does not report token counts.
pub fn completion_from_text(model: &str, text: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: new_response_id(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: text.to_string(),
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: Usage::default(),
    }
}

/// Translate a buffered upstream reply body into a caller completion.
pub fn buffered_from_upstream(model: &str, body: &str) -> ChatCompletionResponse {
    completion_from_text(model, &upstream::extract_content(body))
}

pub fn new_response_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_shape() {
        let resp = buffered_from_upstream("my-model", r#"{"content":"hello"}"#);

        assert!(resp.id.starts_with("chatcmpl-"));
        assert_eq!(resp.object, "chat.completion");
        assert_eq!(resp.model, "my-model");
        assert_eq!(resp.choices.len(), 1);
        assert_eq!(resp.choices[0].message.role, "assistant");
        assert_eq!(resp.choices[0].message.content, "hello");
        assert_eq!(resp.choices[0].finish_reason, Some("stop".to_string()));
        assert_eq!(resp.usage.total_tokens, 0);
    }

    #[test]
    fn test_quote_wrapped_content_unwrapped() {
        let resp = buffered_from_upstream("m", r#"{"content":"\"hi\""}"#);
        assert_eq!(resp.choices[0].message.content, "hi");
    }
}
