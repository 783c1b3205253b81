//! Body-routed dispatch: mutation endpoints whose target backend is named
//! inside the JSON request body rather than the URL.
//!
//! Every account referenced by one request is expected to live on the same
//! backend. Requests crossing backends are an operator error the system
//! tolerates by picking one arbitrarily, with a warning.

use crate::account_route::forward_upstream;
use crate::errors::{GatewayError, Result};
use crate::service::{Dispatcher, request_uri};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use fleet::backend::BackendRef;
use hyper::{Request, Response};
use serde::Deserialize;
use shared::http::combine_url;
use std::collections::{BTreeSet, HashMap};

/// Parse helper exposing only the fields that can name an account. The
/// precedence is `account`, then `credentials`, then `artifactAccount`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountSelector {
    #[serde(default)]
    account: String,
    #[serde(default)]
    credentials: String,
    #[serde(default)]
    artifact_account: String,
}

impl AccountSelector {
    fn account_name(&self) -> Option<&str> {
        [&self.account, &self.credentials, &self.artifact_account]
            .into_iter()
            .find(|name| !name.is_empty())
            .map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactFetchRequest {
    #[serde(default)]
    artifact_account: String,
}

/// Cloud operations: the body is a JSON array of single-key objects, each
/// key naming an operation type whose value may reference an account. All
/// referenced accounts resolve through the cloud map; the original body is
/// forwarded untouched to the chosen backend.
pub async fn cloud_ops(dispatcher: &Dispatcher, request: &Request<Bytes>) -> Result<Response<Bytes>> {
    let operations: Vec<HashMap<String, AccountSelector>> =
        serde_json::from_slice(request.body())
            .map_err(|e| GatewayError::RequestBodyError(e.to_string()))?;

    let mut account_names: BTreeSet<&str> = BTreeSet::new();
    let mut targets: HashMap<String, BackendRef> = HashMap::new();

    for (idx, operation) in operations.iter().enumerate() {
        for (operation_type, selector) in operation {
            let Some(account_name) = selector.account_name() else {
                tracing::debug!(
                    index = idx,
                    operation_type = %operation_type,
                    "No account or credentials in operation"
                );
                continue;
            };
            account_names.insert(account_name);
            match dispatcher.accounts.find_cloud_route(account_name) {
                Some(target) => {
                    targets.insert(target.url.clone(), target);
                }
                None => tracing::warn!(account = account_name, "Account has no route"),
            }
        }
    }

    tracing::debug!(
        request = %BASE64.encode(request.body()),
        headers = ?shared::http::simplify_headers_for_logging(request.headers()),
        "Cloud operation request"
    );

    if targets.len() > 1 {
        tracing::warn!(
            accounts = ?account_names,
            "Multiple routes found for accounts in one request; trying one at random"
        );
    }

    // Which of several targets wins is deliberately arbitrary.
    let Some(target) = targets.into_values().next() else {
        let names: Vec<&str> = account_names.into_iter().collect();
        return Err(GatewayError::NoRouteForAccount(names.join(", ")));
    };
    send_body(dispatcher, &target, request).await
}

/// Artifact fetch: a single JSON object naming the artifact account,
/// resolved through the artifact map.
pub async fn artifact_fetch(
    dispatcher: &Dispatcher,
    request: &Request<Bytes>,
) -> Result<Response<Bytes>> {
    let fetch: ArtifactFetchRequest = serde_json::from_slice(request.body())
        .map_err(|e| GatewayError::RequestBodyError(e.to_string()))?;

    if fetch.artifact_account.is_empty() {
        return Err(GatewayError::RequestBodyError(
            "no artifact account in request".to_string(),
        ));
    }

    let target = dispatcher
        .accounts
        .find_artifact_route(&fetch.artifact_account)
        .ok_or(GatewayError::NoRouteForAccount(fetch.artifact_account))?;
    send_body(dispatcher, &target, request).await
}

/// Cache updates: a single JSON object naming the account, resolved through
/// the cloud map.
pub async fn cache_post(dispatcher: &Dispatcher, request: &Request<Bytes>) -> Result<Response<Bytes>> {
    let selector: AccountSelector = serde_json::from_slice(request.body())
        .map_err(|e| GatewayError::RequestBodyError(e.to_string()))?;

    let account_name = selector
        .account_name()
        .ok_or_else(|| GatewayError::RequestBodyError("no account in request".to_string()))?;

    let target = dispatcher
        .accounts
        .find_cloud_route(account_name)
        .ok_or_else(|| GatewayError::NoRouteForAccount(account_name.to_string()))?;
    send_body(dispatcher, &target, request).await
}

async fn send_body(
    dispatcher: &Dispatcher,
    target: &BackendRef,
    request: &Request<Bytes>,
) -> Result<Response<Bytes>> {
    let target_url = combine_url(&target.url, request_uri(request));
    let result = dispatcher
        .client
        .send(
            request.method().clone(),
            &target_url,
            target.token.as_deref(),
            request.headers(),
            request.body().clone(),
        )
        .await;

    if let Ok(upstream) = &result {
        tracing::debug!(
            target = %target_url,
            status = upstream.status.as_u16(),
            response = %BASE64.encode(&upstream.body),
            "Body-routed response"
        );
    }

    Ok(forward_upstream(&target_url, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{TestBackend, test_dispatcher_with_routes};
    use hyper::{Method, StatusCode};

    fn post(path: &str, body: &'static str) -> Request<Bytes> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap()
    }

    fn put(path: &str, body: &'static str) -> Request<Bytes> {
        Request::builder()
            .method(Method::PUT)
            .uri(path)
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_cloud_ops_routes_by_body_account() {
        let backend = TestBackend::json(r#"{"id":"42"}"#).await;
        let dispatcher = test_dispatcher_with_routes(vec![("x", &backend)], Vec::new());

        let request = post("/kubernetes/ops", r#"[{"deployManifest":{"account":"x"}}]"#);
        let response = cloud_ops(&dispatcher, &request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), br#"{"id":"42"}"#);

        let seen = backend.last_request().unwrap();
        assert_eq!(seen.method, Method::POST);
        assert_eq!(seen.uri, "/kubernetes/ops");
        assert_eq!(
            seen.body.as_ref(),
            br#"[{"deployManifest":{"account":"x"}}]"#
        );
    }

    #[tokio::test]
    async fn test_cloud_ops_unknown_account_makes_no_backend_call() {
        let backend = TestBackend::json("{}").await;
        let dispatcher = test_dispatcher_with_routes(vec![("x", &backend)], Vec::new());

        let request = post("/kubernetes/ops", r#"[{"deployManifest":{"account":"y"}}]"#);
        let result = cloud_ops(&dispatcher, &request).await;

        assert!(matches!(result, Err(GatewayError::NoRouteForAccount(_))));
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_cloud_ops_credentials_field_names_the_account() {
        let backend = TestBackend::json("{}").await;
        let dispatcher = test_dispatcher_with_routes(vec![("x", &backend)], Vec::new());

        let request = post("/aws/ops", r#"[{"resizeServerGroup":{"credentials":"x"}}]"#);
        let response = cloud_ops(&dispatcher, &request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_cloud_ops_crossing_backends_picks_one() {
        let b1 = TestBackend::json("{}").await;
        let b2 = TestBackend::json("{}").await;
        let dispatcher = test_dispatcher_with_routes(vec![("x", &b1), ("y", &b2)], Vec::new());

        let request = post(
            "/kubernetes/ops",
            r#"[{"deployManifest":{"account":"x"}},{"deployManifest":{"account":"y"}}]"#,
        );
        let response = cloud_ops(&dispatcher, &request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(b1.request_count() + b2.request_count(), 1);
    }

    #[tokio::test]
    async fn test_cloud_ops_unparseable_body() {
        let dispatcher = test_dispatcher_with_routes(Vec::new(), Vec::new());

        let request = post("/kubernetes/ops", "not json");
        let result = cloud_ops(&dispatcher, &request).await;

        assert!(matches!(result, Err(GatewayError::RequestBodyError(_))));
    }

    #[tokio::test]
    async fn test_artifact_fetch_resolves_artifact_map() {
        let backend = TestBackend::json(r#""artifact-bytes""#).await;
        let dispatcher = test_dispatcher_with_routes(Vec::new(), vec![("art", &backend)]);

        let request = put("/artifacts/fetch", r#"{"artifactAccount":"art","reference":"r"}"#);
        let response = artifact_fetch(&dispatcher, &request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let seen = backend.last_request().unwrap();
        assert_eq!(seen.method, Method::PUT);
    }

    #[tokio::test]
    async fn test_artifact_fetch_without_account() {
        let dispatcher = test_dispatcher_with_routes(Vec::new(), Vec::new());

        let request = put("/artifacts/fetch", r#"{"reference":"r"}"#);
        let result = artifact_fetch(&dispatcher, &request).await;

        assert!(matches!(result, Err(GatewayError::RequestBodyError(_))));
    }

    #[tokio::test]
    async fn test_cache_post_routes_single_object_body() {
        let backend = TestBackend::json("{}").await;
        let dispatcher = test_dispatcher_with_routes(vec![("x", &backend)], Vec::new());

        let request = post("/cache/kubernetes/manifest", r#"{"account":"x"}"#);
        let response = cache_post(&dispatcher, &request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(backend.last_request().unwrap().uri, "/cache/kubernetes/manifest");
    }
}
