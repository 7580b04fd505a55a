//! Tower middleware that puts the gate in front of an axum router.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use http_body::{Body as HttpBody, Frame, SizeHint};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

use crate::gate::{Admission, Gate, Rejection, RejectionResponse};
use crate::ratelimit::RequestContext;

/// Layer applying a [`Gate`] to every request of the wrapped service.
#[derive(Clone)]
pub struct GateLayer {
    gate: Arc<Gate>,
    policy: Option<String>,
}

impl GateLayer {
    pub fn new(gate: Arc<Gate>) -> Self {
        Self { gate, policy: None }
    }

    /// Pin a named policy for the wrapped routes, bypassing the route table.
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            gate: Arc::clone(&self.gate),
            policy: self.policy.clone(),
        }
    }
}

/// Service produced by [`GateLayer`].
#[derive(Clone)]
pub struct GateService<S> {
    inner: S,
    gate: Arc<Gate>,
    policy: Option<String>,
}

impl<S> Service<Request<Body>> for GateService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let gate = Arc::clone(&self.gate);
        // Call the instance that was polled ready; keep a fresh clone for the next request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let ctx = request_context(&request, self.policy.as_deref());

        Box::pin(async move {
            match gate.acquire(&ctx).await {
                Ok(admission) => {
                    let response = inner.call(request).await?;
                    Ok(response.map(|body| Body::new(AdmittedBody::new(body, admission))))
                }
                Err(rejection) => Ok(rejection_response(rejection)),
            }
        })
    }
}

/// Response body that holds the request's admission until the body has been
/// sent or dropped, so streamed responses keep their concurrency slot.
struct AdmittedBody {
    inner: Body,
    admission: Option<Admission>,
}

impl AdmittedBody {
    fn new(inner: Body, admission: Admission) -> Self {
        Self {
            inner,
            admission: Some(admission),
        }
    }
}

impl HttpBody for AdmittedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            self.admission.take();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Describe an HTTP request to the gate.
pub fn request_context(request: &Request<Body>, policy: Option<&str>) -> RequestContext {
    let mut ctx = RequestContext::new().with_route(request.uri().path());

    if let Some(policy) = policy {
        ctx = ctx.with_policy(policy);
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        ctx = ctx.with_remote_addr(addr.ip());
    }

    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            ctx = ctx.with_header(name.as_str(), value);
        }
    }

    ctx
}

/// Turn a rejection into the HTTP response sent to the client.
pub fn rejection_response(rejection: Rejection) -> Response {
    build_response(rejection.response)
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        rejection_response(self)
    }
}

fn build_response(description: RejectionResponse) -> Response {
    let status = StatusCode::from_u16(description.status).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    let mut response = match description.body {
        Some(body) => (status, body).into_response(),
        None => status.into_response(),
    };

    let headers = response.headers_mut();
    for (name, value) in &description.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid rejection header"),
        }
    }

    response
}
