//! Mammouth wire format: the multipart chat request and the buffered reply.

use crate::error::Result;
use reqwest::multipart::Form;
use serde::{Deserialize, Serialize};

/// A fully resolved upstream chat request. Kept as an owned value (rather
/// than a one-shot multipart form) so a retry can rebuild the form.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub preprompt: String,
    pub messages: Vec<UpstreamMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub content: String,
    #[serde(rename = "imagesData")]
    pub images_data: Vec<String>,
    #[serde(rename = "documentsData")]
    pub documents_data: Vec<String>,
}

impl UpstreamRequest {
    /// Multipart encoding: `model`, `preprompt`, then one `messages` field
    /// per message carrying a JSON-encoded object.
    pub fn to_form(&self) -> Result<Form> {
        let mut form = Form::new()
            .text("model", self.model.clone())
            .text("preprompt", self.preprompt.clone());

        for message in &self.messages {
            form = form.text("messages", serde_json::to_string(message)?);
        }

        Ok(form)
    }
}

/// Pull the assistant text out of a buffered upstream reply.
///
/// The reply is JSON with a `content` field, which the upstream sometimes
/// wraps in an extra layer of double quotes.
pub fn extract_content(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match value.get("content") {
            Some(serde_json::Value::String(s)) => strip_wrapping_quotes(s).to_string(),
            Some(other) => other.to_string(),
            None => body.to_string(),
        },
        Err(_) => body.to_string(),
    }
}

fn strip_wrapping_quotes(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Error detail the upstream attaches to rejection replies.
#[derive(Debug, Deserialize)]
pub struct UpstreamErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "statusMessage")]
    pub status_message: Option<String>,
}

impl UpstreamErrorBody {
    pub fn detail(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.status_message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg = UpstreamMessage {
            content: "hi".to_string(),
            images_data: vec!["/a.png".to_string()],
            documents_data: Vec::new(),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], "hi");
        assert_eq!(json["imagesData"][0], "/a.png");
        assert_eq!(json["documentsData"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_extract_plain_content() {
        assert_eq!(extract_content(r#"{"content":"hello"}"#), "hello");
    }

    #[test]
    fn test_extract_strips_one_quote_layer() {
        assert_eq!(
            extract_content(r#"{"content":"\"quoted\""}"#),
            "quoted"
        );
    }

    #[test]
    fn test_extract_falls_back_to_raw_body() {
        assert_eq!(extract_content("not json"), "not json");
        assert_eq!(extract_content(r#"{"other":1}"#), r#"{"other":1}"#);
    }

    #[test]
    fn test_error_body_prefers_message() {
        let err: UpstreamErrorBody =
            serde_json::from_str(r#"{"message":"m","statusMessage":"s"}"#).unwrap();
        assert_eq!(err.detail(), Some("m".to_string()));

        let err: UpstreamErrorBody = serde_json::from_str(r#"{"statusMessage":"s"}"#).unwrap();
        assert_eq!(err.detail(), Some("s".to_string()));
    }
}
