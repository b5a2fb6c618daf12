//! Server-sent event framing and HTTP status mapping shared by the HTTP
//! adapters.

use chatrelay_core::ProviderError;
use tracing::warn;

/// One `data:` line, with the `event:` name that preceded it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE line decoder.
///
/// Buffers raw bytes so multi-byte characters split across network chunks
/// are decoded intact.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every complete `data:` frame.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line ends the event block
                self.event = None;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                self.event = Some(name.trim().to_string());
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                frames.push(SseFrame {
                    event: self.event.clone(),
                    data: data.trim().to_string(),
                });
            }
        }

        frames
    }
}

/// Map a non-success response to a [`ProviderError`].
pub(crate) async fn check_status(
    response: reqwest::Response,
    provider: &str,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    // 529 is the message-block family's "overloaded"
    if code == 429 || code == 529 {
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(5);
        return Err(ProviderError::RateLimited { retry_after_secs });
    }

    let body = response.text().await.unwrap_or_default();
    warn!(provider = %provider, status = code, body = %body, "Provider returned error");

    match code {
        401 | 403 => Err(ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        )),
        404 => Err(ProviderError::ModelNotFound(body)),
        _ => Err(ProviderError::ApiError {
            status_code: code,
            message: body,
        }),
    }
}

/// Map a reqwest transport error.
pub(crate) fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}
