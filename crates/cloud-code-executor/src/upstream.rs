//! Upstream HTTP transport seam (spec.md §1, §6)
//!
//! Actually talking to the Cloud Code backend — URL shape, auth header,
//! request/response framing beyond "it's JSON over HTTPS" — is an external
//! collaborator out of this core's scope. [`Upstream`] is the seam: the
//! executor only needs a status code, headers, and a body (buffered or
//! streamed) out of one call. [`ReqwestUpstream`] is a real implementation
//! grounded on the teacher's own `reqwest::Client` usage in
//! `provider_impl.rs`; tests drive the executor against a canned in-memory
//! double instead.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

/// Body of an [`UpstreamResponse`]. Non-2xx responses are always buffered —
/// the upstream's error bodies are small JSON documents, never streamed.
pub enum UpstreamBody {
    Buffered(Bytes),
    Streamed(BoxByteStream),
}

pub type BoxByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// One upstream HTTP response, transport-agnostic.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn retry_after(&self) -> Option<&str> {
        self.headers.get("retry-after").map(String::as_str)
    }

    /// Collects the body into text, draining a streamed body if present.
    pub async fn into_text(self) -> String {
        match self.body {
            UpstreamBody::Buffered(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            UpstreamBody::Streamed(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => out.extend_from_slice(&bytes),
                        Err(_) => break,
                    }
                }
                String::from_utf8_lossy(&out).into_owned()
            }
        }
    }
}

/// One upstream call: endpoint base, bearer token, model label, and the
/// already-built JSON payload. Implementations decide the exact path,
/// headers, and streaming transport.
pub trait Upstream: Send + Sync {
    fn call<'a>(
        &'a self,
        endpoint: &'a str,
        access_token: &'a str,
        model: &'a str,
        payload: &'a Value,
        stream: bool,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, String>> + Send + 'a>>;
}

/// Talks to a real Cloud Code endpoint over `reqwest`, following the
/// teacher's `provider_impl.rs` pattern of a shared client plus per-call
/// header injection.
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Upstream for ReqwestUpstream {
    fn call<'a>(
        &'a self,
        endpoint: &'a str,
        access_token: &'a str,
        model: &'a str,
        payload: &'a Value,
        stream: bool,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, String>> + Send + 'a>> {
        Box::pin(async move {
            let method = if stream {
                "v1internal:streamGenerateContent?alt=sse"
            } else {
                "v1internal:generateContent"
            };
            let url = format!("{}/{}", endpoint.trim_end_matches('/'), method);

            let resp = self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .header("x-cloud-code-model", model)
                .header("content-type", "application/json")
                .json(payload)
                .send()
                .await
                .map_err(|e| e.to_string())?;

            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_lowercase(), v.to_str().unwrap_or("").to_string()))
                .collect();

            if stream && (200..=299).contains(&status) {
                let byte_stream = resp.bytes_stream().map(|r| r.map_err(|e| e.to_string()));
                Ok(UpstreamResponse {
                    status,
                    headers,
                    body: UpstreamBody::Streamed(Box::pin(byte_stream)),
                })
            } else {
                let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
                Ok(UpstreamResponse {
                    status,
                    headers,
                    body: UpstreamBody::Buffered(bytes),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_after_reads_lowercased_header() {
        let resp = UpstreamResponse {
            status: 429,
            headers: HashMap::from([("retry-after".to_string(), "30".to_string())]),
            body: UpstreamBody::Buffered(Bytes::from_static(b"{}")),
        };
        assert_eq!(resp.retry_after(), Some("30"));
    }

    #[tokio::test]
    async fn into_text_drains_streamed_body() {
        let chunks = vec![
            Ok::<_, String>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let stream = futures_util::stream::iter(chunks);
        let resp = UpstreamResponse {
            status: 200,
            headers: HashMap::new(),
            body: UpstreamBody::Streamed(Box::pin(stream)),
        };
        assert_eq!(resp.into_text().await, "hello world");
    }
}
