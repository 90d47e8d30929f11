//! Proxy pipeline: turns an inbound request into one or more upstream
//! attempts, honoring strategy selection, retries, fallback, streaming, and
//! header discipline.
//!
//! Each attempt runs a retry loop against the primary target, marking
//! upstream health on success/failure, then falls back to exactly one
//! attempt against a configured fallback URL before giving up.

use {
    crate::{
        lifecycle::LifecycleManager,
        selector::{RequestContext, Selector},
        utils::is_hop_by_hop,
    },
    axum::{
        body::Body,
        http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
        response::{IntoResponse, Response},
    },
    bytes::Bytes,
    std::{collections::HashMap, sync::Arc, time::Duration},
};

/// The two inbound shapes the pipeline accepts; both reduce to the same
/// outbound call.
pub struct OutboundRequest {
    pub method: String,
    /// Path (and query, if any) appended after the resolved upstream base.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A materialized upstream response, ready to hand back to the caller
/// either as the transparent-proxy body or as a dispatcher envelope field.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

pub struct ProxyPipeline {
    client: reqwest::Client,
    lifecycle: Arc<LifecycleManager>,
    selector: Arc<Selector>,
}

/// Content types eligible for streaming, and the size threshold beyond
/// which any content type is streamed regardless of its declared type.
const STREAMABLE_CONTENT_TYPES: &[&str] = &[
    "text/event-stream",
    "application/octet-stream",
    "text/plain",
    "application/json",
];
const STREAM_SIZE_THRESHOLD_BYTES: u64 = 1024 * 1024;

impl ProxyPipeline {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        selector: Arc<Selector>,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .timeout(request_timeout)
            .build()
            .expect("reqwest client configuration is valid");

        Self {
            client,
            lifecycle,
            selector,
        }
    }

    /// Runs the full primary-attempt-loop + single-fallback-attempt pipeline
    /// and buffers the result into an [`UpstreamResponse`]. Used by the
    /// dispatcher, which never streams.
    pub async fn dispatch(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        config: &crate::config::ServiceConfig,
        req: OutboundRequest,
    ) -> Option<UpstreamResponse> {
        let (url, _reason) = self.selector.resolve(service_id, ctx, config);
        if let Some(resp) = self.attempt_primary(service_id, &url, config, &req).await {
            return Some(resp);
        }

        if let Some(fallback_base) = &config.fallback_url {
            return self.attempt_once(service_id, fallback_base, &req).await;
        }

        None
    }

    /// Same pipeline, but returns a streaming `axum::Response` directly for
    /// transparent-proxy callers, per the streaming eligibility rule.
    pub async fn dispatch_streaming(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        config: &crate::config::ServiceConfig,
        req: OutboundRequest,
    ) -> Response {
        let (url, _reason) = self.selector.resolve(service_id, ctx, config);

        if let Some(resp) = self
            .attempt_primary_streaming(service_id, &url, config, &req)
            .await
        {
            return resp;
        }

        if let Some(fallback_base) = &config.fallback_url
            && let Some(resp) = self
                .attempt_once_streaming(service_id, fallback_base, &req)
                .await
        {
            return resp;
        }

        (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable").into_response()
    }

    async fn attempt_primary(
        &self,
        service_id: &str,
        base_url: &str,
        config: &crate::config::ServiceConfig,
        req: &OutboundRequest,
    ) -> Option<UpstreamResponse> {
        let attempts = config.effective_retry_count();
        for attempt in 0..attempts {
            match self.send(base_url, req).await {
                Ok(resp) if resp.status().as_u16() < 500 => {
                    self.selector.mark_healthy(service_id, base_url);
                    self.lifecycle.touch(service_id).await;
                    return Some(materialize(resp).await);
                }
                Ok(_resp) => {
                    self.selector.mark_unhealthy(service_id, base_url);
                }
                Err(_) => {
                    self.selector.mark_unhealthy(service_id, base_url);
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }
        }
        None
    }

    async fn attempt_primary_streaming(
        &self,
        service_id: &str,
        base_url: &str,
        config: &crate::config::ServiceConfig,
        req: &OutboundRequest,
    ) -> Option<Response> {
        let attempts = config.effective_retry_count();
        for attempt in 0..attempts {
            match self.send(base_url, req).await {
                Ok(resp) if resp.status().as_u16() < 500 => {
                    self.selector.mark_healthy(service_id, base_url);
                    self.lifecycle.touch(service_id).await;
                    return Some(to_axum_response(resp).await);
                }
                Ok(_resp) => {
                    self.selector.mark_unhealthy(service_id, base_url);
                }
                Err(_) => {
                    self.selector.mark_unhealthy(service_id, base_url);
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }
        }
        None
    }

    async fn attempt_once(
        &self,
        service_id: &str,
        base_url: &str,
        req: &OutboundRequest,
    ) -> Option<UpstreamResponse> {
        match self.send(base_url, req).await {
            Ok(resp) => {
                self.lifecycle.touch(service_id).await;
                Some(materialize(resp).await)
            }
            Err(_) => None,
        }
    }

    async fn attempt_once_streaming(
        &self,
        service_id: &str,
        base_url: &str,
        req: &OutboundRequest,
    ) -> Option<Response> {
        match self.send(base_url, req).await {
            Ok(resp) => {
                self.lifecycle.touch(service_id).await;
                Some(to_axum_response(resp).await)
            }
            Err(_) => None,
        }
    }

    async fn send(
        &self,
        base_url: &str,
        req: &OutboundRequest,
    ) -> reqwest::Result<reqwest::Response> {
        let url = join_url(base_url, &req.path_and_query);
        let method =
            reqwest::Method::from_bytes(req.method.as_bytes()).unwrap_or(reqwest::Method::GET);

        let mut builder = self.client.request(method, url);
        builder = builder.headers(filter_outbound_headers(&req.headers));
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }
        builder.send().await
    }
}

/// Joins a base URL with a path, matching `urljoin(base.rstrip('/')+'/', path)`.
fn join_url(base_url: &str, path_and_query: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path_and_query.trim_start_matches('/');
    format!("{base}/{path}")
}

/// Strips hop-by-hop headers before forwarding upstream.
fn filter_outbound_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

/// Strips hop-by-hop headers from an upstream response before returning it
/// to the client, collapsing duplicates last-value-wins.
fn filtered_response_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    out
}

async fn materialize(resp: reqwest::Response) -> UpstreamResponse {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = filtered_response_headers(resp.headers());
    let body = resp.bytes().await.unwrap_or_default();
    UpstreamResponse {
        status,
        headers,
        body,
    }
}

/// Decides whether a transparent-proxy response should stream, per the
/// content-type / content-length eligibility rule, and builds the axum
/// response accordingly.
async fn to_axum_response(resp: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let content_length = resp.content_length();

    let should_stream = STREAMABLE_CONTENT_TYPES
        .iter()
        .any(|t| content_type.contains(t))
        || content_length.is_some_and(|len| len > STREAM_SIZE_THRESHOLD_BYTES);

    let mut header_map = HeaderMap::new();
    for (name, value) in filtered_response_headers(resp.headers()) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            header_map.insert(name, value);
        }
    }

    let body = if should_stream {
        Body::from_stream(resp.bytes_stream())
    } else {
        let bytes = resp.bytes().await.unwrap_or_default();
        Body::from(bytes)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = header_map;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_trailing_and_leading_slashes() {
        assert_eq!(
            join_url("http://host/", "/v1/models"),
            "http://host/v1/models"
        );
        assert_eq!(
            join_url("http://host", "v1/models"),
            "http://host/v1/models"
        );
    }

    #[test]
    fn filters_hop_by_hop_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let filtered = filter_outbound_headers(&headers);
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("host").is_none());
        assert!(filtered.get("x-request-id").is_some());
    }
}
