use std::{
    convert::Infallible,
    sync::{Arc, OnceLock},
};

use hyper::{
    body,
    header::{self, HeaderValue},
    Body, Method, Request, Response, StatusCode,
};
use orrery_kernel::{
    EventSinks, EventStreams, KernelClient, KernelConfig, KernelError, KernelManager, PortError,
    PortPool,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<KernelManager>,
    pub ports: Arc<PortPool>,
    /// Whether new kernels get a heartbeat port.
    pub heartbeat: bool,
}

#[derive(Serialize)]
struct KernelView<'a> {
    id: &'a str,
    config: &'a KernelConfig,
}

impl<'a> KernelView<'a> {
    fn of(kernel: &'a KernelClient) -> Self {
        Self {
            id: kernel.id(),
            config: kernel.config(),
        }
    }
}

#[derive(Deserialize)]
struct CreateKernel {
    id: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Kernels,
    Kernel(&'a str),
    Shutdown(&'a str),
    ShutdownWithoutId,
}

fn route(path: &str) -> Option<Route<'_>> {
    static KERNELS: OnceLock<Regex> = OnceLock::new();
    static KERNEL: OnceLock<Regex> = OnceLock::new();
    static SHUTDOWN: OnceLock<Regex> = OnceLock::new();

    let kernels = KERNELS.get_or_init(|| Regex::new(r"^/kernels/?$").expect("valid route"));
    let kernel = KERNEL.get_or_init(|| Regex::new(r"^/kernels/(?P<id>[^/:]+)$").expect("valid route"));
    let shutdown = SHUTDOWN
        .get_or_init(|| Regex::new(r"^/kernels/(?P<id>[^/:]*):shutdown$").expect("valid route"));

    if kernels.is_match(path) {
        return Some(Route::Kernels);
    }
    if let Some(id) = shutdown.captures(path).and_then(|c| c.name("id")) {
        return Some(match id.as_str() {
            "" => Route::ShutdownWithoutId,
            id => Route::Shutdown(id),
        });
    }
    kernel
        .captures(path)
        .and_then(|c| c.name("id"))
        .map(|id| Route::Kernel(id.as_str()))
}

/// Serves one request of the kernel API.
pub async fn handle(state: AppState, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = match (route(&path), &method) {
        (Some(Route::Kernels), &Method::GET) => list_kernels(&state),
        (Some(Route::Kernels), &Method::POST) => create_kernel(&state, request).await,
        (Some(Route::Kernel(id)), &Method::GET) => get_kernel(&state, id),
        (Some(Route::Shutdown(id)), &Method::POST) => shutdown_kernel(&state, id).await,
        (Some(Route::ShutdownWithoutId), &Method::POST) => {
            error_response(StatusCode::BAD_REQUEST, "missing kernel id")
        }
        (Some(_), _) => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        (None, _) => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    debug!(%method, path = %path, status = %response.status(), "request handled");
    Ok(response)
}

fn list_kernels(state: &AppState) -> Response<Body> {
    let mut kernels = state.manager.list();
    kernels.sort_by(|a, b| a.id().cmp(b.id()));

    let views: Vec<KernelView> = kernels.iter().map(|kernel| KernelView::of(kernel)).collect();
    json_response(StatusCode::OK, &views)
}

fn get_kernel(state: &AppState, id: &str) -> Response<Body> {
    match state.manager.get(id) {
        Some(kernel) => json_response(StatusCode::OK, &KernelView::of(&kernel)),
        None => error_response(StatusCode::NOT_FOUND, &KernelError::NotFound(id.to_string()).to_string()),
    }
}

async fn create_kernel(state: &AppState, request: Request<Body>) -> Response<Body> {
    let bytes = match body::to_bytes(request.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("failed to read body: {e}")),
    };
    let CreateKernel { id } = match serde_json::from_slice(&bytes) {
        Ok(create) => create,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid body: {e}")),
    };
    if id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing kernel id");
    }

    let lease = match PortLease::allocate(&state.ports, state.heartbeat) {
        Ok(lease) => lease,
        Err(e) => {
            warn!(kernel = %id, "cannot allocate kernel ports: {e}");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        }
    };

    let (sinks, streams) = EventSinks::channel();
    match state.manager.create(&id, lease.config, sinks).await {
        Ok(kernel) => {
            lease.keep();
            tokio::spawn(drain_events(streams).instrument(info_span!("kernel", id = %id)));
            json_response(StatusCode::CREATED, &KernelView::of(&kernel))
        }
        Err(e) => {
            let status = match e {
                KernelError::Duplicate(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, &e.to_string())
        }
    }
}

/// Ports allocated for a kernel that is not registered yet. They go back to
/// the pool on drop unless kept, including when the request is abandoned
/// mid-start.
struct PortLease<'a> {
    ports: &'a PortPool,
    config: KernelConfig,
    kept: bool,
}

impl<'a> PortLease<'a> {
    fn allocate(ports: &'a PortPool, heartbeat: bool) -> Result<Self, PortError> {
        Ok(Self {
            config: ports.allocate(heartbeat)?,
            ports,
            kept: false,
        })
    }

    /// Hands the ports over to the registered kernel; shutdown releases them.
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        if !self.kept {
            debug!(config = ?self.config, "returning unused kernel ports");
            self.ports.release_config(&self.config);
        }
    }
}

async fn shutdown_kernel(state: &AppState, id: &str) -> Response<Body> {
    let config = state.manager.get(id).map(|kernel| *kernel.config());

    match state.manager.shutdown(id).await {
        Ok(()) => {
            if let Some(config) = config {
                state.ports.release_config(&config);
            }
            json_response(StatusCode::OK, &json!({}))
        }
        Err(e @ KernelError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, &e.to_string()),
        Err(e) => {
            error!(kernel = id, "shutdown failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Logs the events of a kernel nobody else listens to, until the kernel is gone.
async fn drain_events(mut streams: EventStreams) {
    loop {
        tokio::select! {
            Some(reply) = streams.execute_reply.recv() => {
                info!(request = %reply.request_id, success = reply.success, "execute reply");
            }
            Some(status) = streams.kernel_status.recv() => {
                info!(status = ?status.status, request = ?status.request_id, "kernel status");
            }
            Some(output) = streams.output_data.recv() => {
                debug!(request = %output.request_id, kind = ?output.kind, "kernel output");
            }
            else => break,
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("failed to serialize response: {e}");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &json!({ "error": message }))
}
