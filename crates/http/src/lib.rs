//! # weft-http
//!
//! The request adapter for [`weft-context`]: a `tower` middleware that opens
//! exactly one context scope per inbound HTTP request, seeded with a request
//! id (taken from a configurable header, else generated) and an optional user
//! id. Anything downstream — handlers, extractors, logging — reads the scope
//! through [`request_id`] / [`user_id`] or through a [`container`] built over
//! the same store.
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use weft_http::{RequestScopeLayer, request_id};
//!
//! async fn handler() -> String {
//!     format!("handled {}", request_id().unwrap_or_default())
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let app: Router = Router::new()
//!         .route("/", get(handler))
//!         .layer(RequestScopeLayer::new());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! [`weft-context`]: weft_context

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use tower::{Layer, Service};
use uuid::Uuid;
use weft_context::{ContextContainer, ContextMap, ScopeCell};

/// Default header consulted for an inbound request id (and used to echo the
/// resolved id on the response). Header matching is case-insensitive per HTTP
/// semantics; multi-valued headers yield their first value.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The fixed field set of a request scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestField {
    /// Inbound or generated request id; always present inside a scope.
    RequestId,
    /// Extracted user id; omitted from the mapping when unknown.
    UserId,
}

impl fmt::Display for RequestField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestField::RequestId => "request_id",
            RequestField::UserId => "user_id",
        })
    }
}

tokio::task_local! {
    /// The per-request store. One scope is opened over it per request by
    /// [`RequestScope`]; custom containers that should observe request state
    /// must be built over this store (see [`container`]).
    pub static REQUEST_SCOPE: ScopeCell<RequestField, String>;
}

/// A lenient [`ContextContainer`] over the request store.
///
/// The middleware uses one of these internally by default; build your own
/// here when you want strict mode, defaults or hooks, and hand it to
/// [`RequestScopeLayer::with_container`].
pub fn container() -> ContextContainer<RequestField, String> {
    ContextContainer::new(&REQUEST_SCOPE)
}

/// The current request id, if a request scope is active.
pub fn request_id() -> Option<String> {
    REQUEST_SCOPE
        .try_with(|cell| cell.borrow().get(RequestField::RequestId).cloned())
        .ok()
        .flatten()
}

/// The current user id, if a request scope is active and one was extracted.
pub fn user_id() -> Option<String> {
    REQUEST_SCOPE
        .try_with(|cell| cell.borrow().get(RequestField::UserId).cloned())
        .ok()
        .flatten()
}

type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;
type UserIdExtractor = Arc<dyn Fn(&HeaderMap) -> Option<String> + Send + Sync>;

/// `tower::Layer` that wraps a service in [`RequestScope`].
#[derive(Clone)]
pub struct RequestScopeLayer {
    header_name: HeaderName,
    echo_header: bool,
    generate: IdGenerator,
    user_extractor: Option<UserIdExtractor>,
    container: ContextContainer<RequestField, String>,
}

impl RequestScopeLayer {
    /// Layer with the default configuration: `x-request-id` header, UUID v4
    /// generator, no user extraction, response-header echo on, lenient
    /// container.
    pub fn new() -> Self {
        Self {
            header_name: HeaderName::from_static(REQUEST_ID_HEADER),
            echo_header: true,
            generate: Arc::new(|| Uuid::new_v4().to_string()),
            user_extractor: None,
            container: container(),
        }
    }

    /// Header to consult for an inbound id and to echo on the response.
    pub fn with_header_name(mut self, name: HeaderName) -> Self {
        self.header_name = name;
        self
    }

    /// Generator used when the inbound request carries no id header.
    pub fn with_generator<G>(mut self, generate: G) -> Self
    where
        G: Fn() -> String + Send + Sync + 'static,
    {
        self.generate = Arc::new(generate);
        self
    }

    /// Extract an optional user id from the request headers. When the
    /// extractor returns `None` the `user_id` key is omitted from the scope
    /// entirely, never set to an empty value.
    pub fn with_user_extractor<E>(mut self, extract: E) -> Self
    where
        E: Fn(&HeaderMap) -> Option<String> + Send + Sync + 'static,
    {
        self.user_extractor = Some(Arc::new(extract));
        self
    }

    /// Use a custom container (strict mode, defaults, hooks). It must be
    /// built over [`REQUEST_SCOPE`] — see [`container`] — or downstream
    /// readers will not see the scope this middleware opens.
    pub fn with_container(mut self, container: ContextContainer<RequestField, String>) -> Self {
        self.container = container;
        self
    }

    /// Whether to echo the resolved request id on the response.
    pub fn with_echo_header(mut self, echo: bool) -> Self {
        self.echo_header = echo;
        self
    }
}

impl Default for RequestScopeLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestScopeLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScopeLayer")
            .field("header_name", &self.header_name)
            .field("echo_header", &self.echo_header)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RequestScopeLayer {
    type Service = RequestScope<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestScope {
            inner,
            config: self.clone(),
        }
    }
}

/// Middleware that resolves a request id, seeds a fresh context scope and
/// runs the inner service inside it.
///
/// Exactly one scope per request; concurrently processed requests never see
/// each other's mappings. A failing inner service propagates its error
/// through the scope unchanged.
#[derive(Clone)]
pub struct RequestScope<S> {
    inner: S,
    config: RequestScopeLayer,
}

impl<S: fmt::Debug> fmt::Debug for RequestScope<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("inner", &self.inner)
            .field("config", &self.config)
            .finish()
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestScope<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness; leave the clone.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();

        // First value wins on multi-valued headers; non-UTF-8 values are
        // treated as absent.
        let request_id = req
            .headers()
            .get(&config.header_name)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| (config.generate)());
        let user_id = config
            .user_extractor
            .as_ref()
            .and_then(|extract| extract(req.headers()));

        let mut seed = ContextMap::new();
        seed.insert(RequestField::RequestId, request_id.clone());
        if let Some(user_id) = user_id {
            seed.insert(RequestField::UserId, user_id);
        }

        Box::pin(async move {
            tracing::debug!(request_id = %request_id, "entering request scope");
            let mut response = config
                .container
                .run(seed, async move {
                    let mut inner = inner;
                    inner.call(req).await
                })
                .await?;
            if config.echo_header {
                if let Ok(value) = HeaderValue::from_str(&request_id) {
                    response.headers_mut().insert(config.header_name, value);
                }
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn read_body(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn counting_generator() -> (Arc<AtomicUsize>, impl Fn() -> String + Send + Sync + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = {
            let calls = calls.clone();
            move || format!("gen-{}", calls.fetch_add(1, Ordering::SeqCst))
        };
        (calls, generator)
    }

    async fn echo_ids() -> String {
        format!(
            "{}/{}",
            request_id().unwrap_or_default(),
            user_id().unwrap_or_else(|| "-".to_owned())
        )
    }

    fn app(layer: RequestScopeLayer) -> Router {
        Router::new().route("/", get(echo_ids)).layer(layer)
    }

    #[tokio::test]
    async fn generates_distinct_ids_when_no_header_is_present() {
        let (calls, generator) = counting_generator();
        let app = app(RequestScopeLayer::new().with_generator(generator));

        let first = app
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let second = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(read_body(first).await, "gen-0/-");
        assert_eq!(read_body(second).await, "gen-1/-");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn inbound_header_is_used_verbatim() {
        let (calls, generator) = counting_generator();
        let app = app(RequestScopeLayer::new().with_generator(generator));

        // Header names are matched case-insensitively.
        let response = app
            .oneshot(
                Request::get("/")
                    .header("X-Request-Id", "req-inbound")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(read_body(response).await, "req-inbound/-");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_of_multiple_header_values_wins() {
        let app = app(RequestScopeLayer::new());

        let response = app
            .oneshot(
                Request::get("/")
                    .header(REQUEST_ID_HEADER, "first")
                    .header(REQUEST_ID_HEADER, "second")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(read_body(response).await, "first/-");
    }

    #[tokio::test]
    async fn custom_header_name_is_honoured() {
        let app = app(
            RequestScopeLayer::new()
                .with_header_name(HeaderName::from_static("x-correlation-id")),
        );

        let response = app
            .oneshot(
                Request::get("/")
                    .header("x-correlation-id", "corr-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response
                .headers()
                .get("x-correlation-id")
                .and_then(|v| v.to_str().ok()),
            Some("corr-7")
        );
        assert_eq!(read_body(response).await, "corr-7/-");
    }

    #[tokio::test]
    async fn user_extractor_feeds_the_scope() {
        let layer = RequestScopeLayer::new().with_user_extractor(|headers| {
            headers
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned)
        });
        let app = app(layer);

        let with_user = app
            .clone()
            .oneshot(
                Request::get("/")
                    .header(REQUEST_ID_HEADER, "r-1")
                    .header("x-user-id", "u-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(read_body(with_user).await, "r-1/u-42");

        // No user: the key is omitted from the mapping entirely.
        let without_user = app
            .oneshot(
                Request::get("/")
                    .header(REQUEST_ID_HEADER, "r-2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(read_body(without_user).await, "r-2/-");
    }

    #[tokio::test]
    async fn absent_user_key_is_a_missing_key_for_require() {
        async fn probe() -> String {
            let err = container().require(RequestField::UserId).unwrap_err();
            assert!(err.is_missing_key());
            "probed".to_owned()
        }
        let app = Router::new()
            .route("/", get(probe))
            .layer(RequestScopeLayer::new());

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(read_body(response).await, "probed");
    }

    #[tokio::test]
    async fn container_defaults_sit_beneath_request_values() {
        let defaults: ContextMap<RequestField, String> =
            ContextMap::from([(RequestField::UserId, "anonymous".to_owned())]);
        let layer =
            RequestScopeLayer::new().with_container(container().with_defaults(defaults));
        let app = app(layer);

        let response = app
            .oneshot(
                Request::get("/")
                    .header(REQUEST_ID_HEADER, "r-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(read_body(response).await, "r-1/anonymous");
    }

    #[tokio::test]
    async fn resolved_id_is_echoed_on_the_response() {
        let (_, generator) = counting_generator();
        let app = app(RequestScopeLayer::new().with_generator(generator));

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("gen-0")
        );

        let muted = self::app(RequestScopeLayer::new().with_echo_header(false));
        let response = muted
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().get(REQUEST_ID_HEADER).is_none());
    }

    #[tokio::test]
    async fn no_scope_outside_a_request() {
        assert_eq!(request_id(), None);
        assert_eq!(user_id(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_are_isolated() {
        async fn slow_echo() -> String {
            let before = request_id().unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let after = request_id().unwrap_or_default();
            assert_eq!(before, after);
            after
        }
        let app = Router::new()
            .route("/", get(slow_echo))
            .layer(RequestScopeLayer::new());

        let send = |id: &'static str| {
            let app = app.clone();
            async move {
                let response = app
                    .oneshot(
                        Request::get("/")
                            .header(REQUEST_ID_HEADER, id)
                            .body(Body::empty())
                            .unwrap(),
                    )
                    .await
                    .unwrap();
                read_body(response).await
            }
        };

        let (a, b) = tokio::join!(send("req-a"), send("req-b"));
        assert_eq!(a, "req-a");
        assert_eq!(b, "req-b");
    }

    #[tokio::test]
    async fn downstream_failure_propagates_unchanged() {
        #[derive(Clone)]
        struct Failing;

        impl Service<Request<Body>> for Failing {
            type Response = Response<Body>;
            type Error = String;
            type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, _req: Request<Body>) -> Self::Future {
                std::future::ready(Err("downstream failure".to_owned()))
            }
        }

        let service = RequestScopeLayer::new().layer(Failing);
        let err = service
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, "downstream failure");
    }
}
