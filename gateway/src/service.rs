//! The hyper service wrapping the dispatch engine.

use crate::errors::GatewayError;
use crate::router::{HandlerKind, PathVars, Router};
use crate::{account_route, fallback, fanout, introspect, ops};
use fleet::accounts::AccountRouter;
use fleet::health::HealthSupervisor;
use http::header::{CONTENT_TYPE, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use shared::client::BackendClient;
use shared::http::make_error_response;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// The dependencies every handler works against. Cheap to clone; handlers
/// receive a reference per dispatch.
#[derive(Clone)]
pub struct Dispatcher {
    pub client: BackendClient,
    pub accounts: Arc<AccountRouter>,
    pub health: Arc<HealthSupervisor>,
}

impl Dispatcher {
    pub async fn dispatch(
        &self,
        kind: HandlerKind,
        vars: PathVars,
        request: Request<Bytes>,
    ) -> Response<Bytes> {
        use HandlerKind::*;

        let result = match kind {
            FetchList { dedup_key } => fanout::fetch_list(self, &request, dedup_key).await,
            FetchMap => fanout::fetch_map(self, &request).await,
            FetchFeatures => fanout::fetch_features(self, &request).await,
            Broadcast => fanout::broadcast(self, &request).await,
            AccountPath { var } => {
                account_route::by_path(self, &vars, var, &request, account_route::RouteMap::Cloud)
                    .await
            }
            ArtifactPath { var } => {
                account_route::by_path(
                    self,
                    &vars,
                    var,
                    &request,
                    account_route::RouteMap::Artifact,
                )
                .await
            }
            AccountQuery { param } => account_route::by_query(self, param, &request).await,
            CloudOps => ops::cloud_ops(self, &request).await,
            ArtifactFetch => ops::artifact_fetch(self, &request).await,
            CachePost => ops::cache_post(self, &request).await,
            Accounts => introspect::accounts(self),
            AccountRoutes => introspect::account_routes(self),
            Health => introspect::health(self),
            FallbackProxy => fallback::proxy(self, &request).await,
            FallbackFail => fallback::fail_and_log(&request),
        };

        result.unwrap_or_else(error_response)
    }
}

/// Maps request-scoped errors onto the statuses the surface promises.
fn error_response(error: GatewayError) -> Response<Bytes> {
    let status = match &error {
        GatewayError::NoRouteForAccount(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::RequestBodyError(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::NoHealthyBackends => StatusCode::BAD_GATEWAY,
        GatewayError::ResponseSerializationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(error = %error, status = status.as_u16(), "Request failed");
    make_error_response(status)
}

/// Serializes a value into a JSON 200 response.
pub(crate) fn json_response<T: Serialize>(value: &T) -> Result<Response<Bytes>, GatewayError> {
    json_response_with_status(value, StatusCode::OK)
}

pub(crate) fn json_response_with_status<T: Serialize>(
    value: &T,
    status: StatusCode,
) -> Result<Response<Bytes>, GatewayError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| GatewayError::ResponseSerializationError(e.to_string()))?;
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

/// The inbound path and query, used verbatim when composing backend URLs.
pub(crate) fn request_uri(request: &Request<Bytes>) -> &str {
    request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

pub struct GatewayService {
    router: Router,
    dispatcher: Dispatcher,
}

impl GatewayService {
    pub fn new(router: Router, dispatcher: Dispatcher) -> Self {
        Self { router, dispatcher }
    }
}

impl<B> Service<Request<B>> for GatewayService
where
    B: BodyExt<Data = Bytes> + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B: Unpin,
{
    type Response = Response<Full<Bytes>>;
    type Error = GatewayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let (kind, vars) = self.router.resolve(req.method(), req.uri().path());
        let dispatcher = self.dispatcher.clone();
        let started = Instant::now();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(make_error_response(StatusCode::BAD_REQUEST).map(Full::new));
                }
            };

            let request = Request::from_parts(parts, body_bytes);
            let method = request.method().clone();
            let path = request.uri().path().to_string();

            let response = dispatcher.dispatch(kind, vars, request).await;

            tracing::info!(
                %method,
                %path,
                status = response.status().as_u16(),
                elapsed_millis = started.elapsed().as_millis() as u64,
                "Handled request"
            );
            Ok(response.map(Full::new))
        })
    }
}
