//! Binary attachment uploads to the upstream storage endpoint.
//!
//! Identical attachment bytes are uploaded at most once per process lifetime:
//! the SHA-256 digest of the payload keys an [`AttachmentCache`] entry holding
//! the upstream-assigned location. A 403 from the upstream is interpreted as
//! "credential exhausted"; the credential is marked unavailable and the upload
//! retried with a fresh one, at most pool-size times.

use crate::cache::AttachmentCache;
use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;
use crate::pool::CredentialPool;

use base64::Engine;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub struct Uploader {
    client: reqwest::Client,
    pool: Arc<CredentialPool>,
    cache: Arc<AttachmentCache>,
    upload_url: String,
    origin: String,
    referer: String,
    logger: SharedLogger,
}

/// Explicit decode of the upstream's reply to one upload attempt.
enum AttemptOutcome {
    Uploaded(String),
    CredentialRejected,
    Failed(ProxyError),
}

#[derive(Debug, Deserialize)]
struct SaveFileReply {
    location: String,
}

impl Uploader {
    pub fn new(
        client: reqwest::Client,
        pool: Arc<CredentialPool>,
        cache: Arc<AttachmentCache>,
        upload_url: String,
        origin: String,
        referer: String,
        logger: SharedLogger,
    ) -> Self {
        Self {
            client,
            pool,
            cache,
            upload_url,
            origin,
            referer,
            logger,
        }
    }

    /// Upload raw attachment bytes, deduping via the content digest.
    pub async fn upload(&self, bytes: Vec<u8>, name: Option<String>) -> Result<String> {
        if bytes.is_empty() {
            return Err(ProxyError::invalid_attachment("empty attachment payload"));
        }

        let key = hash_bytes(&bytes);

        if let Some(location) = self.cache.lookup(&key) {
            self.logger
                .debug("uploader", format!("cache hit: {}...", &key[..8]));
            return Ok(location);
        }

        self.logger
            .debug("uploader", format!("cache miss, uploading: {}...", &key[..8]));

        let name = name.unwrap_or_else(|| default_name(&key, "png"));

        // One attempt per pool entry at most. Every rejection marks a
        // credential, so the loop terminates even when all of them fail.
        let max_attempts = self.pool.len().max(1);

        for _ in 0..max_attempts {
            let credential = self.pool.next_available()?;

            match self.attempt(&bytes, &name, &credential).await {
                AttemptOutcome::Uploaded(location) => {
                    self.cache.store(&key, &location);
                    self.logger.info(
                        "uploader",
                        format!("uploaded and cached: {}... -> {}", &key[..8], location),
                    );
                    return Ok(location);
                }
                AttemptOutcome::CredentialRejected => {
                    self.logger.warn(
                        "uploader",
                        format!("credential rejected (403), rotating: {}...", &key[..8]),
                    );
                    self.pool.mark_unavailable(&credential);
                }
                AttemptOutcome::Failed(err) => return Err(err),
            }
        }

        Err(ProxyError::quota_exceeded(
            "every credential rejected the attachment upload",
        ))
    }

    /// Upload an inline `data:image/...;base64,` payload.
    pub async fn upload_base64(&self, data_uri: &str, name: Option<String>) -> Result<String> {
        let (bytes, ext) = decode_data_uri(data_uri)?;
        let name = name.unwrap_or_else(|| default_name(&hash_bytes(&bytes), &ext));
        self.upload(bytes, Some(name)).await
    }

    /// Fetch an image from a remote URL and upload it.
    pub async fn upload_from_url(&self, url: &str, name: Option<String>) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProxyError::upload_failed(format!("failed to fetch image URL: {e}")))?;

        if response.status().as_u16() >= 400 {
            return Err(ProxyError::upload_failed(format!(
                "image URL returned status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::upload_failed(format!("failed to read image bytes: {e}")))?
            .to_vec();

        let ext = extension_from_url(url);
        let name = name.unwrap_or_else(|| default_name(&hash_bytes(&bytes), &ext));
        self.upload(bytes, Some(name)).await
    }

    async fn attempt(&self, bytes: &[u8], name: &str, credential: &str) -> AttemptOutcome {
        let file_part = match Part::bytes(bytes.to_vec())
            .file_name("blob")
            .mime_str("image/png")
        {
            Ok(p) => p,
            Err(e) => return AttemptOutcome::Failed(ProxyError::Http(e)),
        };

        let form = Form::new()
            .text("type", "image")
            .text("name", name.to_string())
            .part("file", file_part);

        let response = self
            .client
            .post(&self.upload_url)
            .header("Cookie", format!("auth_session={credential}"))
            .header("Origin", &self.origin)
            .header("Referer", &self.referer)
            .multipart(form)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return AttemptOutcome::Failed(ProxyError::upload_failed(format!(
                    "upload request failed: {e}"
                )))
            }
        };

        let status = response.status().as_u16();

        if status == 403 {
            return AttemptOutcome::CredentialRejected;
        }

        if status >= 400 {
            return AttemptOutcome::Failed(ProxyError::upload_failed(format!(
                "upload returned status {status}"
            )));
        }

        match response.json::<SaveFileReply>().await {
            Ok(reply) => AttemptOutcome::Uploaded(reply.location),
            Err(e) => AttemptOutcome::Failed(ProxyError::upload_failed(format!(
                "unexpected upload reply shape: {e}"
            ))),
        }
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Decode an inline base64 image, returning the bytes and the file extension
/// inferred from the media-type prefix (default `png`).
fn decode_data_uri(data_uri: &str) -> Result<(Vec<u8>, String)> {
    let (ext, payload) = match data_uri
        .strip_prefix("data:image/")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        Some((media, payload)) => (media.to_lowercase(), payload),
        None => ("png".to_string(), data_uri),
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ProxyError::invalid_attachment(format!("bad base64 payload: {e}")))?;

    Ok((bytes, ext))
}

/// Infer a file extension from the URL path, ignoring any query string.
fn extension_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "png".to_string())
}

fn default_name(hash: &str, ext: &str) -> String {
    let prefix: String = hash.chars().take(8).collect();
    format!(
        "image_{}_{}.{}",
        prefix,
        chrono::Utc::now().timestamp_millis(),
        ext
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
        assert_eq!(hash_bytes(b"abc").len(), 64);
    }

    #[test]
    fn test_decode_data_uri_with_prefix() {
        let (bytes, ext) = decode_data_uri("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(ext, "jpeg");
    }

    #[test]
    fn test_decode_bare_base64_defaults_to_png() {
        let (bytes, ext) = decode_data_uri("aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(ext, "png");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_data_uri("data:image/png;base64,!!!not-base64!!!").is_err());
    }

    #[test]
    fn test_extension_from_url() {
        assert_eq!(extension_from_url("https://x.test/a/b/cat.JPG?w=1"), "jpg");
        assert_eq!(extension_from_url("https://x.test/noext"), "png");
        assert_eq!(extension_from_url("https://x.test/weird.tar.gz"), "gz");
    }

    #[test]
    fn test_default_name_shape() {
        let name = default_name(&hash_bytes(b"x"), "webp");
        assert!(name.starts_with("image_"));
        assert!(name.ends_with(".webp"));
    }
}
