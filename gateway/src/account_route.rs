//! Single-target dispatch: requests scoped to one account are proxied to
//! the backend that owns it.

use crate::errors::{GatewayError, Result};
use crate::fanout;
use crate::router::PathVars;
use crate::service::{Dispatcher, request_uri};
use bytes::Bytes;
use fleet::backend::BackendRef;
use http::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response, StatusCode};
use shared::client::{ClientError, UpstreamResponse};
use shared::http::{combine_url, copy_headers, make_error_response};

/// Which routing map resolves the account name.
#[derive(Clone, Copy, Debug)]
pub enum RouteMap {
    Cloud,
    Artifact,
}

impl RouteMap {
    fn find(self, dispatcher: &Dispatcher, account_name: &str) -> Option<BackendRef> {
        match self {
            RouteMap::Cloud => dispatcher.accounts.find_cloud_route(account_name),
            RouteMap::Artifact => dispatcher.accounts.find_artifact_route(account_name),
        }
    }
}

/// Proxies to the backend owning the account named by a path variable.
pub async fn by_path(
    dispatcher: &Dispatcher,
    vars: &PathVars,
    var: &'static str,
    request: &Request<Bytes>,
    map: RouteMap,
) -> Result<Response<Bytes>> {
    let account_name = vars.get(var).cloned().unwrap_or_default();
    let target = map
        .find(dispatcher, &account_name)
        .ok_or(GatewayError::NoRouteForAccount(account_name))?;
    proxy_get(dispatcher, &target, request).await
}

/// Proxies by an optional query parameter; without it the request is not
/// account-scoped and degrades to a plain list fan-out.
pub async fn by_query(
    dispatcher: &Dispatcher,
    param: &'static str,
    request: &Request<Bytes>,
) -> Result<Response<Bytes>> {
    let query = request.uri().query().unwrap_or("");
    let account_name = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == param)
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();

    if account_name.is_empty() {
        return fanout::fetch_list(dispatcher, request, None).await;
    }

    let target = dispatcher
        .accounts
        .find_cloud_route(&account_name)
        .ok_or(GatewayError::NoRouteForAccount(account_name))?;
    proxy_get(dispatcher, &target, request).await
}

async fn proxy_get(
    dispatcher: &Dispatcher,
    target: &BackendRef,
    request: &Request<Bytes>,
) -> Result<Response<Bytes>> {
    let target_url = combine_url(&target.url, request_uri(request));
    let result = dispatcher
        .client
        .get(&target_url, target.token.as_deref(), request.headers())
        .await;
    Ok(forward_upstream(&target_url, result))
}

/// Turns an upstream exchange into the client-facing response.
///
/// Transport failures become 503. A non-2xx is forwarded with its body and
/// the upstream content type only; a 2xx additionally carries the upstream
/// headers minus the ignored set.
pub(crate) fn forward_upstream(
    target_url: &str,
    result: std::result::Result<UpstreamResponse, ClientError>,
) -> Response<Bytes> {
    let upstream = match result {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(target = target_url, error = %e, "Upstream fetch failed");
            return make_error_response(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    let content_type = upstream
        .headers
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    let status = upstream.status;
    let mut response = Response::new(upstream.body);
    *response.status_mut() = status;
    if status.is_success() {
        copy_headers(response.headers_mut(), &upstream.headers);
    }
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{TestBackend, test_dispatcher_with_routes};
    use hyper::Method;

    fn get(path: &str) -> Request<Bytes> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Bytes::new())
            .unwrap()
    }

    fn vars(var: &'static str, value: &str) -> PathVars {
        PathVars::from([(var, value.to_string())])
    }

    #[tokio::test]
    async fn test_by_path_proxies_to_owning_backend() {
        let backend = TestBackend::json(r#"{"account":"prod"}"#).await;
        let dispatcher = test_dispatcher_with_routes(vec![("prod", &backend)], Vec::new());

        let response = by_path(
            &dispatcher,
            &vars("account", "prod"),
            "account",
            &get("/credentials/prod?expand=true"),
            RouteMap::Cloud,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), br#"{"account":"prod"}"#);

        // The backend saw the original path and query.
        let seen = backend.last_request().unwrap();
        assert_eq!(seen.uri, "/credentials/prod?expand=true");
        assert_eq!(seen.method, Method::GET);
    }

    #[tokio::test]
    async fn test_by_path_unknown_account_is_unroutable() {
        let dispatcher = test_dispatcher_with_routes(Vec::new(), Vec::new());

        let result = by_path(
            &dispatcher,
            &vars("account", "ghost"),
            "account",
            &get("/credentials/ghost"),
            RouteMap::Cloud,
        )
        .await;

        assert!(matches!(result, Err(GatewayError::NoRouteForAccount(a)) if a == "ghost"));
    }

    #[tokio::test]
    async fn test_artifact_map_is_separate_from_cloud_map() {
        let backend = TestBackend::json("[]").await;
        let dispatcher = test_dispatcher_with_routes(Vec::new(), vec![("art", &backend)]);

        let response = by_path(
            &dispatcher,
            &vars("account", "art"),
            "account",
            &get("/artifacts/account/art/names"),
            RouteMap::Artifact,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let result = by_path(
            &dispatcher,
            &vars("account", "art"),
            "account",
            &get("/credentials/art"),
            RouteMap::Cloud,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_by_query_routes_when_param_present() {
        let backend = TestBackend::json("[]").await;
        let dispatcher = test_dispatcher_with_routes(vec![("docker", &backend)], Vec::new());

        let response = by_query(
            &dispatcher,
            "account",
            &get("/dockerRegistry/images/find?account=docker&q=nginx"),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_by_query_without_param_fans_out() {
        let b1 = TestBackend::json("[1]").await;
        let b2 = TestBackend::json("[2]").await;
        let dispatcher =
            test_dispatcher_with_routes(vec![("a", &b1), ("b", &b2)], Vec::new());

        let response = by_query(&dispatcher, "account", &get("/dockerRegistry/images/find"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let items: Vec<i64> = serde_json::from_slice(response.body().as_ref()).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_forwarded() {
        let backend = TestBackend::respond(StatusCode::FORBIDDEN, r#"{"error":"denied"}"#).await;
        let dispatcher = test_dispatcher_with_routes(vec![("prod", &backend)], Vec::new());

        let response = by_path(
            &dispatcher,
            &vars("account", "prod"),
            "account",
            &get("/credentials/prod"),
            RouteMap::Cloud,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body().as_ref(), br#"{"error":"denied"}"#);
        assert_eq!(
            response.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_becomes_503() {
        let backend = TestBackend::json("{}").await;
        let dispatcher = test_dispatcher_with_routes(vec![("prod", &backend)], Vec::new());
        // Swap in a dead route for the same account name.
        let dead = fleet::accounts::RoutingSnapshot {
            cloud_routes: std::collections::HashMap::from([(
                "prod".to_string(),
                BackendRef {
                    url: "http://127.0.0.1:1".to_string(),
                    priority: 0,
                    token: None,
                },
            )]),
            ..Default::default()
        };
        dispatcher.accounts.publish(dead);

        let response = by_path(
            &dispatcher,
            &vars("account", "prod"),
            "account",
            &get("/credentials/prod"),
            RouteMap::Cloud,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
