//! One upstream call, relayed back to the caller.
//!
//! A streamed call has two phases. While connecting (headers plus the first
//! body chunk) any failure is returned to the orchestrator and may be retried.
//! Once the first chunk is in hand the stream is committed: later upstream
//! errors, or a gap longer than the upstream timeout between chunks, become a
//! final inline `data: {"error": ...}` event.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use futures_util::stream::{self, BoxStream};
use futures_util::{future, StreamExt};
use reqwest::Client;
use serde_json::json;
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::transform::RequestEnvelope;
use crate::AppConfig;

/// A failed attempt. Every variant is eligible for retry and failover.
#[derive(Debug)]
pub enum UpstreamFailure {
    Status { status: StatusCode, body: String },
    Transport(String),
}

impl UpstreamFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(status.as_u16()),
            Self::Transport(_) => None,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Status { .. } => "upstream_status",
            Self::Transport(_) => "upstream_transport",
        }
    }
}

impl From<UpstreamFailure> for GatewayError {
    fn from(failure: UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::Status { status, body } => GatewayError::UpstreamHttp {
                status: status.as_u16(),
                body,
            },
            UpstreamFailure::Transport(message) => GatewayError::UpstreamTransport(message),
        }
    }
}

pub async fn relay(
    client: &Client,
    config: &AppConfig,
    url: &str,
    token: &str,
    envelope: &RequestEnvelope,
) -> Result<Response, UpstreamFailure> {
    let body = envelope
        .to_vec()
        .map_err(|e| UpstreamFailure::Transport(format!("failed to serialize request body: {e}")))?;
    let request = client
        .post(url)
        .bearer_auth(token)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body);

    if envelope.is_stream() {
        let committed = connect_stream(request, config).await?;
        Ok(committed.into_response())
    } else {
        relay_buffered(request, config).await
    }
}

async fn relay_buffered(
    request: reqwest::RequestBuilder,
    config: &AppConfig,
) -> Result<Response, UpstreamFailure> {
    let call = async {
        let upstream = request.send().await?;
        let status = upstream.status();
        let headers = upstream.headers().clone();
        let bytes = upstream.bytes().await?;
        Ok::<_, reqwest::Error>((status, headers, bytes))
    };

    let (status, headers, bytes) = match tokio::time::timeout(config.upstream_timeout, call).await
    {
        Err(_) => {
            return Err(UpstreamFailure::Transport(format!(
                "upstream timed out after {}s",
                config.upstream_timeout.as_secs()
            )));
        }
        Ok(Err(e)) => return Err(UpstreamFailure::Transport(e.to_string())),
        Ok(Ok(parts)) => parts,
    };

    if status != StatusCode::OK {
        return Err(UpstreamFailure::Status {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }

    let mut resp = Response::new(Body::from(bytes));
    copy_upstream_response_headers(&headers, resp.headers_mut());
    resp.headers_mut()
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("application/json"));
    Ok(resp)
}

/// An upstream stream that has produced its first chunk.
pub struct CommittedStream {
    headers: HeaderMap,
    first_chunk: Bytes,
    rest: BoxStream<'static, reqwest::Result<Bytes>>,
    idle_timeout: Duration,
}

async fn connect_stream(
    request: reqwest::RequestBuilder,
    config: &AppConfig,
) -> Result<CommittedStream, UpstreamFailure> {
    let deadline = Instant::now() + config.upstream_first_byte_timeout;
    let timed_out = || {
        UpstreamFailure::Transport(format!(
            "upstream sent no data within {}s",
            config.upstream_first_byte_timeout.as_secs()
        ))
    };

    let upstream = match tokio::time::timeout_at(deadline, request.send()).await {
        Err(_) => return Err(timed_out()),
        Ok(Err(e)) => return Err(UpstreamFailure::Transport(e.to_string())),
        Ok(Ok(resp)) => resp,
    };

    let status = upstream.status();
    if status != StatusCode::OK {
        let body = match tokio::time::timeout_at(deadline, upstream.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => e.to_string(),
            Err(_) => String::new(),
        };
        return Err(UpstreamFailure::Status { status, body });
    }

    let headers = upstream.headers().clone();
    let mut body = upstream.bytes_stream().boxed();
    match tokio::time::timeout_at(deadline, body.next()).await {
        Err(_) => Err(timed_out()),
        Ok(None) => Err(UpstreamFailure::Transport(
            "upstream closed the stream before sending data".to_string(),
        )),
        Ok(Some(Err(e))) => Err(UpstreamFailure::Transport(e.to_string())),
        Ok(Some(Ok(first_chunk))) => Ok(CommittedStream {
            headers,
            first_chunk,
            rest: body,
            idle_timeout: config.upstream_timeout,
        }),
    }
}

impl CommittedStream {
    /// Starts relaying. From here on nothing is retried.
    pub fn into_response(self) -> Response {
        let Self {
            headers,
            first_chunk,
            rest,
            idle_timeout,
        } = self;

        let rest = stream::unfold(Some(rest), move |rest| async move {
            let mut rest = rest?;
            let chunk = match tokio::time::timeout(idle_timeout, rest.next()).await {
                Ok(None) => return None,
                Ok(Some(Ok(chunk))) => return Some((Ok(chunk), Some(rest))),
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, "upstream stream failed after commit");
                    sse_error_event(&e.to_string())
                }
                Err(_) => {
                    tracing::warn!(idle = ?idle_timeout, "upstream stream stalled after commit");
                    sse_error_event(&format!("upstream sent no data for {idle_timeout:?}"))
                }
            };
            // The error event is the last item; dropping `rest` closes the upstream.
            Some((Ok::<Bytes, Infallible>(chunk), None))
        });
        let relayed = stream::once(future::ready(Ok::<Bytes, Infallible>(first_chunk))).chain(rest);

        let mut resp = Response::new(Body::from_stream(relayed));
        copy_upstream_response_headers(&headers, resp.headers_mut());
        resp.headers_mut().remove(header::CONTENT_LENGTH);
        set_event_stream_headers(resp.headers_mut());
        resp
    }
}

pub fn sse_error_event(message: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", json!({ "error": message })))
}

/// Terminal outcome for a streaming request that never got a stream.
pub fn sse_error_response(message: &str) -> Response {
    let mut resp = Response::new(Body::from(sse_error_event(message)));
    set_event_stream_headers(resp.headers_mut());
    resp
}

fn set_event_stream_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name.as_str() == "keep-alive"
        || name == header::PROXY_AUTHENTICATE
        || name == header::PROXY_AUTHORIZATION
        || name == header::TE
        || name == header::TRAILER
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
}

fn copy_upstream_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        if is_hop_by_hop_header(name) {
            continue;
        }
        to.append(name, value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::BodyExt;

    #[test]
    fn sse_error_event_is_a_single_data_frame() {
        let event = sse_error_event("boom \"quoted\"");
        assert_eq!(&event[..], b"data: {\"error\":\"boom \\\"quoted\\\"\"}\n\n");
    }

    #[tokio::test]
    async fn sse_error_response_has_event_stream_headers() {
        let resp = sse_error_response("nope");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"data: {\"error\":\"nope\"}\n\n");
    }

    #[test]
    fn hop_by_hop_headers_are_not_copied() {
        let mut from = HeaderMap::new();
        from.insert(header::CONNECTION, HeaderValue::from_static("close"));
        from.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        from.insert("x-request-id", HeaderValue::from_static("abc"));

        let mut to = HeaderMap::new();
        copy_upstream_response_headers(&from, &mut to);
        assert_eq!(to.len(), 1);
        assert_eq!(to.get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn failures_convert_to_gateway_errors() {
        let err: GatewayError = UpstreamFailure::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: "overloaded".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            GatewayError::UpstreamHttp { status: 503, ref body } if body == "overloaded"
        ));

        let failure = UpstreamFailure::Transport("connection reset".to_string());
        assert_eq!(failure.status(), None);
        assert_eq!(failure.reason(), "upstream_transport");
        let err: GatewayError = failure.into();
        assert_eq!(err.to_string(), "connection reset");
    }
}
