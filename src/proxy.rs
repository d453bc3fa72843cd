//! Request orchestration: credential selection, the upstream chat call, and
//! the quota retry/degrade policy.
//!
//! An upstream 403 is treated as "this credential hit its usage limit": the
//! credential is marked unavailable and the call retried exactly once with a
//! freshly selected one. If that also fails, the caller receives a normal
//! completion (streamed or buffered, matching the request) whose assistant
//! content is a human-readable exhaustion message, instead of a transport
//! error. Any other upstream failure surfaces as an error without retry.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;
use crate::pool::CredentialPool;
use crate::translate::openai_types::{ChatCompletionChunk, ChatCompletionRequest};
use crate::translate::request::transcode;
use crate::translate::response::{buffered_from_upstream, completion_from_text};
use crate::translate::streaming::StreamRelay;
use crate::translate::upstream::{UpstreamErrorBody, UpstreamRequest};
use crate::upload::Uploader;

use futures::stream::{self, Stream};
use futures::StreamExt;
use std::pin::Pin;
use std::sync::Arc;

const EXHAUSTED_MESSAGE: &str =
    "Usage limit: all accounts have temporarily reached their usage limit. Please try again later.";

/// One caller-facing SSE frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Chunk(ChatCompletionChunk),
    Done,
}

pub type FrameStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Frame, std::io::Error>> + Send>>;

/// Outcome of orchestrating one chat request.
pub enum ProxyResponse {
    Buffered(Box<crate::translate::openai_types::ChatCompletionResponse>),
    Streaming(FrameStream),
}

pub async fn proxy_chat(
    req: &ChatCompletionRequest,
    config: &ProxyConfig,
    client: &reqwest::Client,
    pool: &Arc<CredentialPool>,
    uploader: &Uploader,
    logger: &SharedLogger,
) -> Result<ProxyResponse> {
    let is_streaming = req.stream.unwrap_or(false);
    let unlimited = config.is_unlimited_model(&req.model);

    let upstream_req = transcode(req, &config.models, uploader, logger).await;

    let credential = select_credential(pool, unlimited)?;

    logger.info(
        "proxy",
        format!(
            "POST {} model={} streaming={} unlimited={}",
            config.chat_url(),
            upstream_req.model,
            is_streaming,
            unlimited
        ),
    );

    let response = send_chat(client, config, &upstream_req, &credential).await?;
    let status = response.status().as_u16();

    if status == 403 {
        return quota_retry(
            req,
            &upstream_req,
            response,
            &credential,
            unlimited,
            is_streaming,
            config,
            client,
            pool,
            logger,
        )
        .await;
    }

    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::upstream(format!(
            "upstream returned status {}: {}",
            status,
            truncate(&body, 300)
        )));
    }

    relay(response, &req.model, is_streaming, logger).await
}

/// Mark the rejected credential, retry exactly once with a fresh one, and
/// degrade to an in-band answer when the retry fails too.
#[allow(clippy::too_many_arguments)]
async fn quota_retry(
    req: &ChatCompletionRequest,
    upstream_req: &UpstreamRequest,
    rejection: reqwest::Response,
    credential: &str,
    unlimited: bool,
    is_streaming: bool,
    config: &ProxyConfig,
    client: &reqwest::Client,
    pool: &Arc<CredentialPool>,
    logger: &SharedLogger,
) -> Result<ProxyResponse> {
    let rejection_body = rejection.text().await.unwrap_or_default();

    logger.warn(
        "proxy",
        format!(
            "credential {} hit usage limit for model {}",
            redact(credential),
            req.model
        ),
    );
    pool.mark_unavailable(credential);

    let retry_credential = if unlimited {
        pool.any_credential()
    } else {
        pool.next_available()
    };

    if let Ok(retry_credential) = retry_credential {
        logger.info(
            "proxy",
            format!("retrying with credential {}", redact(&retry_credential)),
        );

        match send_chat(client, config, upstream_req, &retry_credential).await {
            Ok(retry_response) if retry_response.status().is_success() => {
                return relay(retry_response, &req.model, is_streaming, logger).await;
            }
            Ok(retry_response) => {
                logger.warn(
                    "proxy",
                    format!("retry returned status {}", retry_response.status()),
                );
            }
            Err(e) => {
                logger.warn("proxy", format!("retry failed: {e}"));
            }
        }
    }

    let message = serde_json::from_str::<UpstreamErrorBody>(&rejection_body)
        .ok()
        .and_then(|b| b.detail())
        .unwrap_or_else(|| EXHAUSTED_MESSAGE.to_string());

    Ok(degraded_response(&req.model, is_streaming, &message))
}

fn select_credential(pool: &CredentialPool, unlimited: bool) -> Result<String> {
    if unlimited {
        pool.any_credential()
    } else {
        pool.next_available()
    }
}

async fn send_chat(
    client: &reqwest::Client,
    config: &ProxyConfig,
    upstream_req: &UpstreamRequest,
    credential: &str,
) -> Result<reqwest::Response> {
    let form = upstream_req.to_form()?;

    client
        .post(config.chat_url())
        .header("Cookie", format!("auth_session={credential}"))
        .header("Origin", config.origin())
        .multipart(form)
        .send()
        .await
        .map_err(|e| ProxyError::upstream(format!("chat request failed: {e}")))
}

async fn relay(
    response: reqwest::Response,
    model: &str,
    is_streaming: bool,
    logger: &SharedLogger,
) -> Result<ProxyResponse> {
    if is_streaming {
        return Ok(ProxyResponse::Streaming(relay_stream(
            response,
            model.to_string(),
            logger.clone(),
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| ProxyError::upstream(format!("failed to read upstream body: {e}")))?;

    Ok(ProxyResponse::Buffered(Box::new(buffered_from_upstream(
        model, &body,
    ))))
}

/// One outbound delta frame per upstream byte chunk, in arrival order. A
/// multibyte character cut in half by a chunk boundary is held back until its
/// remaining bytes arrive, so the relayed text never contains replacement
/// characters for well-formed input. An upstream read error aborts the stream
/// without emitting further frames.
fn relay_stream(response: reqwest::Response, model: String, logger: SharedLogger) -> FrameStream {
    Box::pin(async_stream::stream! {
        let relay = StreamRelay::new(&model);

        yield Ok(Frame::Chunk(relay.role_chunk()));

        let mut byte_stream = response.bytes_stream();
        let mut carry = Utf8Carry::default();

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    let text = carry.decode(&bytes);
                    if !text.is_empty() {
                        yield Ok(Frame::Chunk(relay.content_chunk(&text)));
                    }
                }
                Err(e) => {
                    logger.error("relay", format!("upstream stream error: {e}"));
                    return;
                }
            }
        }

        let tail = carry.flush();
        if !tail.is_empty() {
            yield Ok(Frame::Chunk(relay.content_chunk(&tail)));
        }

        yield Ok(Frame::Chunk(relay.stop_chunk()));
        yield Ok(Frame::Done);
        logger.info("relay", "stream completed");
    })
}

/// Incremental UTF-8 decoder. An incomplete trailing byte sequence is kept
/// pending until the next chunk completes it; the stream end flushes whatever
/// is left lossily.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let text = s.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Synthesize a normal completion carrying an exhaustion message, in the mode
/// the caller asked for.
pub fn degraded_response(model: &str, is_streaming: bool, message: &str) -> ProxyResponse {
    if !is_streaming {
        return ProxyResponse::Buffered(Box::new(completion_from_text(model, message)));
    }

    let relay = StreamRelay::new(model);
    let frames = vec![
        Ok(Frame::Chunk(relay.role_chunk())),
        Ok(Frame::Chunk(relay.content_chunk(message))),
        Ok(Frame::Chunk(relay.stop_chunk())),
        Ok(Frame::Done),
    ];

    ProxyResponse::Streaming(Box::pin(stream::iter(frames)))
}

fn redact(credential: &str) -> String {
    let prefix: String = credential.chars().take(5).collect();
    format!("{}...", prefix)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_degraded_buffered_is_normal_completion() {
        let resp = degraded_response("m", false, "limit reached");

        match resp {
            ProxyResponse::Buffered(completion) => {
                assert_eq!(completion.choices[0].message.content, "limit reached");
                assert_eq!(
                    completion.choices[0].finish_reason,
                    Some("stop".to_string())
                );
            }
            ProxyResponse::Streaming(_) => panic!("expected buffered response"),
        }
    }

    #[tokio::test]
    async fn test_degraded_stream_frame_order() {
        let resp = degraded_response("m", true, "limit reached");

        let frames: Vec<Frame> = match resp {
            ProxyResponse::Streaming(s) => s
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .filter_map(std::result::Result::ok)
                .collect(),
            ProxyResponse::Buffered(_) => panic!("expected streaming response"),
        };

        assert_eq!(frames.len(), 4);

        match &frames[0] {
            Frame::Chunk(c) => {
                assert_eq!(c.choices[0].delta.role, Some("assistant".to_string()));
            }
            Frame::Done => panic!("unexpected DONE"),
        }
        match &frames[1] {
            Frame::Chunk(c) => {
                assert_eq!(c.choices[0].delta.content, Some("limit reached".to_string()));
            }
            Frame::Done => panic!("unexpected DONE"),
        }
        match &frames[2] {
            Frame::Chunk(c) => assert_eq!(c.choices[0].finish_reason, Some("stop".to_string())),
            Frame::Done => panic!("unexpected DONE"),
        }
        assert!(matches!(frames[3], Frame::Done));
    }

    #[test]
    fn test_utf8_carry_reassembles_split_character() {
        // "€" is E2 82 AC; the boundary falls inside it.
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(&[0xE2, 0x82]), "");
        assert_eq!(carry.decode(&[0xAC, b'!']), "€!");
        assert_eq!(carry.flush(), "");
    }

    #[test]
    fn test_utf8_carry_emits_valid_prefix_immediately() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode("ab€".as_bytes()), "ab€");
        assert_eq!(carry.decode(&[b'c', 0xF0, 0x9F]), "c");
        assert_eq!(carry.decode(&[0x98, 0x80]), "😀");
    }

    #[test]
    fn test_utf8_carry_flushes_dangling_bytes_lossily() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(&[b'x', 0xE2]), "x");
        assert_eq!(carry.flush(), "\u{FFFD}");
    }

    #[test]
    fn test_utf8_carry_replaces_invalid_bytes() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");

        let s = "a".repeat(299) + "€";
        let cut = truncate(&s, 300);
        assert_eq!(cut.len(), 299);
        assert!(cut.chars().all(|c| c == 'a'));
    }
}
