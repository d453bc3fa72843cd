//! Frame builder for streaming responses.
//!
//! The upstream streams raw text chunks, not pre-framed events. [`StreamRelay`]
//! stamps every outbound frame of one logical response with the same response
//! id and creation timestamp, and builds the three frame kinds the caller
//! dialect expects: the role announcement, per-chunk content deltas, and the
//! terminating stop frame.

use super::openai_types::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
use super::response::new_response_id;

#[derive(Debug)]
pub struct StreamRelay {
    id: String,
    created: i64,
    model: String,
}

impl StreamRelay {
    pub fn new(model: &str) -> Self {
        Self {
            id: new_response_id(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
        }
    }

    /// First frame of every stream: announces the assistant role with empty
    /// content.
    pub fn role_chunk(&self) -> ChatCompletionChunk {
        self.chunk(
            ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
            },
            None,
        )
    }

    /// One delta frame per upstream chunk, text carried verbatim.
    pub fn content_chunk(&self, text: &str) -> ChatCompletionChunk {
        self.chunk(
            ChunkDelta {
                role: None,
                content: Some(text.to_string()),
            },
            None,
        )
    }

    /// Terminating frame with an explicit `stop` finish reason.
    pub fn stop_chunk(&self) -> ChatCompletionChunk {
        self.chunk(ChunkDelta::default(), Some("stop".to_string()))
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_share_id_and_timestamp() {
        let relay = StreamRelay::new("m");
        let role = relay.role_chunk();
        let delta = relay.content_chunk("Hel");
        let stop = relay.stop_chunk();

        assert_eq!(role.id, delta.id);
        assert_eq!(delta.id, stop.id);
        assert_eq!(role.created, stop.created);
        assert!(role.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn test_role_frame_shape() {
        let relay = StreamRelay::new("m");
        let frame = relay.role_chunk();

        assert_eq!(frame.object, "chat.completion.chunk");
        assert_eq!(frame.choices[0].delta.role, Some("assistant".to_string()));
        assert_eq!(frame.choices[0].delta.content, Some(String::new()));
        assert_eq!(frame.choices[0].finish_reason, None);
    }

    #[test]
    fn test_content_frame_is_verbatim() {
        let relay = StreamRelay::new("m");
        let frame = relay.content_chunk(" spaced \n");
        assert_eq!(
            frame.choices[0].delta.content,
            Some(" spaced \n".to_string())
        );
    }

    #[test]
    fn test_stop_frame_omits_delta_fields() {
        let relay = StreamRelay::new("m");
        let frame = relay.stop_chunk();

        assert_eq!(frame.choices[0].finish_reason, Some("stop".to_string()));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["choices"][0]["delta"], serde_json::json!({}));
    }
}
