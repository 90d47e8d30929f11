//! HTTP surface: four endpoints over the lifecycle/queue/selector/proxy
//! components, wired together as a shared [`GatewayState`].
//!
//! Layered with the usual trace/timeout/panic-catching/request-id stack
//! over the four routes each service exposes.

use {
    crate::{
        config::{GatewayConfig, ServiceConfig},
        lifecycle::{EnsureStartingOutcome, LifecycleManager, ProactiveStartOutcome},
        proxy::{OutboundRequest, ProxyPipeline},
        queue::{QueueOutcome, RequestQueue},
        selector::{RequestContext, Selector},
        utils::RequestIdGenerator,
    },
    axum::{
        Json, Router,
        body::Bytes,
        extract::{Path, Request, State},
        http::{HeaderMap, Method, StatusCode},
        response::{IntoResponse, Response},
        routing::{any, get, post},
    },
    serde::{Deserialize, Serialize},
    serde_json::Value,
    std::{collections::HashMap, sync::Arc, time::Duration},
    tower::ServiceBuilder,
    tower_http::{
        catch_panic::CatchPanicLayer,
        request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    },
};

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub services: Arc<dashmap::DashMap<String, ServiceConfig>>,
    pub lifecycle: Arc<LifecycleManager>,
    pub queue: Arc<RequestQueue>,
    pub selector: Arc<Selector>,
    pub proxy: Arc<ProxyPipeline>,
}

impl GatewayState {
    fn service_config(&self, service_id: &str) -> Option<ServiceConfig> {
        self.services.get(service_id).map(|r| r.value().clone())
    }
}

/// Builds the gateway's axum [`Router`], layered with the ambient
/// tracing/timeout/panic/request-id stack.
pub fn build(state: GatewayState) -> Router {
    let request_timeout = state.config.request_timeout;

    Router::new()
        .route("/v1/requests", post(dispatch_request))
        .route("/v1/services/{id}/status", get(service_status))
        .route("/v1/services/{id}/start", post(service_start))
        .route("/services/{id}/{*path}", any(transparent_proxy))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(RequestIdGenerator))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::new())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::SERVICE_UNAVAILABLE,
                    request_timeout,
                )),
        )
}

#[derive(Deserialize)]
struct DispatchBody {
    #[serde(rename = "serviceId")]
    service_id: String,
    method: String,
    path: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

#[derive(Serialize)]
struct DispatchResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Value,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

/// Pulls string-valued top-level fields (e.g. `model`) out of a JSON body
/// for routing strategies to inspect.
fn extract_body_fields(body: &Value) -> HashMap<String, String> {
    match body {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Case-insensitive header lookup over a plain string map, for headers that
/// arrived as JSON object keys rather than through axum's `HeaderMap`.
fn header_field_ci<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

async fn dispatch_request(
    State(state): State<GatewayState>,
    Json(payload): Json<DispatchBody>,
) -> Response {
    let Some(config) = state.service_config(&payload.service_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(MessageResponse {
                message: "unknown service".into(),
            }),
        )
            .into_response();
    };

    if !wait_for_ready(&state, &payload.service_id, &config).await {
        return service_unavailable();
    }

    let mut body_fields = HashMap::new();
    let body_bytes = match &payload.body {
        Some(value) => {
            body_fields = extract_body_fields(value);
            Bytes::from(serde_json::to_vec(value).unwrap_or_default())
        }
        None => Bytes::new(),
    };

    let mut headers = HeaderMap::new();
    let mut header_fields = HashMap::new();
    for (name, value) in &payload.headers {
        header_fields.insert(name.clone(), value.clone());
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            axum::http::HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    if !body_bytes.is_empty() && !headers.contains_key(axum::http::header::CONTENT_TYPE) {
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/json"),
        );
    }

    let user_region = header_field_ci(&header_fields, "x-user-region").map(String::from);
    let ctx = RequestContext {
        method: payload.method.clone(),
        path: payload.path.clone(),
        headers: header_fields,
        body_fields,
        user_region,
    };

    let outbound = OutboundRequest {
        method: payload.method,
        path_and_query: payload.path,
        headers,
        body: body_bytes,
    };

    match state
        .proxy
        .dispatch(&payload.service_id, &ctx, &config, outbound)
        .await
    {
        Some(resp) => {
            let body = if resp
                .headers
                .get("content-type")
                .is_some_and(|ct| ct.contains("application/json"))
            {
                serde_json::from_slice(&resp.body).unwrap_or(Value::String(
                    String::from_utf8_lossy(&resp.body).to_string(),
                ))
            } else {
                Value::String(String::from_utf8_lossy(&resp.body).to_string())
            };
            Json(DispatchResponse {
                status: resp.status.as_u16(),
                headers: resp.headers,
                body,
            })
            .into_response()
        }
        None => service_unavailable(),
    }
}

async fn service_status(
    State(state): State<GatewayState>,
    Path(service_id): Path<String>,
) -> Response {
    if state.service_config(&service_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(MessageResponse {
                message: "unknown service".into(),
            }),
        )
            .into_response();
    }

    let status = state.lifecycle.status(&service_id).await;
    #[derive(Serialize)]
    struct StatusResponse {
        #[serde(rename = "serviceId")]
        service_id: String,
        state: String,
        #[serde(rename = "machineId")]
        machine_id: Option<String>,
        readiness: String,
        #[serde(rename = "queuePending")]
        queue_pending: usize,
    }

    let state_str = match status.state {
        crate::lifecycle::ServiceState::Cold => "cold",
        crate::lifecycle::ServiceState::Starting => "starting",
        crate::lifecycle::ServiceState::Hot => "hot",
        crate::lifecycle::ServiceState::Stopping => "stopping",
    };
    let readiness_str = match status.readiness {
        crate::lifecycle::Readiness::Ready => "ready",
        crate::lifecycle::Readiness::NotReady => "not_ready",
    };

    Json(StatusResponse {
        service_id,
        state: state_str.to_string(),
        machine_id: status.machine_id,
        readiness: readiness_str.to_string(),
        queue_pending: status.queue_pending,
    })
    .into_response()
}

async fn service_start(
    State(state): State<GatewayState>,
    Path(service_id): Path<String>,
) -> Response {
    if state.service_config(&service_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(MessageResponse {
                message: "unknown service".into(),
            }),
        )
            .into_response();
    }

    match state.lifecycle.proactive_start(&service_id).await {
        ProactiveStartOutcome::Started202 => (
            StatusCode::ACCEPTED,
            Json(MessageResponse {
                message: "starting".into(),
            }),
        )
            .into_response(),
        ProactiveStartOutcome::ConflictAlreadyRunning409 => (
            StatusCode::CONFLICT,
            Json(MessageResponse {
                message: "already running".into(),
            }),
        )
            .into_response(),
        ProactiveStartOutcome::ConflictAlreadyStarting409 => (
            StatusCode::CONFLICT,
            Json(MessageResponse {
                message: "already starting".into(),
            }),
        )
            .into_response(),
    }
}

async fn transparent_proxy(
    State(state): State<GatewayState>,
    Path((service_id, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let Some(config) = state.service_config(&service_id) else {
        return (StatusCode::NOT_FOUND, "unknown service").into_response();
    };

    if !wait_for_ready(&state, &service_id, &config).await {
        return service_unavailable();
    }

    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let path_and_query = format!("{path}{query}");

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => Bytes::new(),
    };

    let is_json = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));
    let body_fields = if is_json {
        serde_json::from_slice::<Value>(&body)
            .map(|v| extract_body_fields(&v))
            .unwrap_or_default()
    } else {
        HashMap::new()
    };
    let user_region = headers
        .get("x-user-region")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let ctx = RequestContext {
        method: method.to_string(),
        path: path.clone(),
        headers: headers
            .iter()
            .filter_map(|(n, v)| Some((n.to_string(), v.to_str().ok()?.to_string())))
            .collect(),
        body_fields,
        user_region,
    };

    let outbound = OutboundRequest {
        method: method.to_string(),
        path_and_query,
        headers,
        body,
    };

    state
        .proxy
        .dispatch_streaming(&service_id, &ctx, &config, outbound)
        .await
}

/// Ensures the service is ready before a request proceeds, ensuring startup
/// is underway and queueing the caller if it isn't hot yet.
async fn wait_for_ready(state: &GatewayState, service_id: &str, config: &ServiceConfig) -> bool {
    if state.lifecycle.is_ready(service_id).await {
        return true;
    }

    match state.lifecycle.ensure_starting(service_id).await {
        EnsureStartingOutcome::AlreadyReady => return true,
        EnsureStartingOutcome::Started | EnsureStartingOutcome::AlreadyStarting => {}
    }

    let Some(ticket) = state.queue.queue(service_id, config.queue_size).await else {
        return false;
    };

    let deadline = Duration::from_secs(config.request_timeout_seconds);
    matches!(
        state.queue.wait(service_id, ticket, deadline).await,
        QueueOutcome::Released
    )
}

fn service_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(MessageResponse {
            message: "Service unavailable".into(),
        }),
    )
        .into_response()
}
