//! Transcode caller requests into the upstream Mammouth form.
//!
//! System-role messages never reach the upstream message list; they are
//! concatenated, in order, into a single preprompt separated by blank lines.
//! Multimodal image parts are resolved through the uploader; a failed
//! resolution drops that attachment and the request proceeds.

use std::collections::HashMap;

use crate::error::Result;
use crate::logging::SharedLogger;

use super::openai_types::{ChatCompletionRequest, ContentPart, MessageContent};
use super::upstream::{UpstreamMessage, UpstreamRequest};

/// Resolves image parts to upstream attachment locations. The production
/// implementation is [`crate::upload::Uploader`].
#[allow(async_fn_in_trait)]
pub trait ImageResolver {
    async fn resolve_base64(&self, data_uri: &str) -> Result<String>;
    async fn resolve_url(&self, url: &str) -> Result<String>;
}

impl ImageResolver for crate::upload::Uploader {
    async fn resolve_base64(&self, data_uri: &str) -> Result<String> {
        self.upload_base64(data_uri, None).await
    }

    async fn resolve_url(&self, url: &str) -> Result<String> {
        self.upload_from_url(url, None).await
    }
}

/// Translate a caller request into the upstream form, uploading any embedded
/// images along the way.
pub async fn transcode<R: ImageResolver>(
    req: &ChatCompletionRequest,
    model_map: &HashMap<String, String>,
    resolver: &R,
    logger: &SharedLogger,
) -> UpstreamRequest {
    let model = model_map
        .get(&req.model)
        .cloned()
        .unwrap_or_else(|| req.model.clone());

    let mut preprompt_parts: Vec<String> = Vec::new();
    let mut messages: Vec<UpstreamMessage> = Vec::new();

    for message in &req.messages {
        if message.role == "system" {
            preprompt_parts.push(flatten_text(&message.content));
            continue;
        }

        messages.push(transcode_message(&message.content, resolver, logger).await);
    }

    UpstreamRequest {
        model,
        preprompt: preprompt_parts.join("\n\n"),
        messages,
    }
}

async fn transcode_message<R: ImageResolver>(
    content: &MessageContent,
    resolver: &R,
    logger: &SharedLogger,
) -> UpstreamMessage {
    let (text, images_data) = match content {
        MessageContent::Text(text) => (text.clone(), Vec::new()),
        MessageContent::Parts(parts) => {
            let mut text_parts: Vec<&str> = Vec::new();
            let mut images_data: Vec<String> = Vec::new();

            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text),
                    ContentPart::ImageUrl { image_url } => {
                        let url = image_url.url();
                        let resolved = if url.starts_with("data:image") {
                            resolver.resolve_base64(url).await
                        } else {
                            resolver.resolve_url(url).await
                        };

                        match resolved {
                            Ok(location) => images_data.push(location),
                            Err(e) => {
                                // Partial-content degradation: drop the
                                // attachment, keep the message.
                                logger.error(
                                    "transcode",
                                    format!("image resolution failed, dropping: {e}"),
                                );
                            }
                        }
                    }
                }
            }

            (text_parts.join("\n"), images_data)
        }
    };

    UpstreamMessage {
        content: text,
        images_data,
        documents_data: Vec::new(),
    }
}

fn flatten_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
