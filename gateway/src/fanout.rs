//! Scatter/gather dispatch: one outbound request per healthy backend, with
//! a merge strategy over the results.
//!
//! Per-contributor failures (transport errors, unexpected statuses,
//! unparseable bodies) are logged and excluded; they never fail the whole
//! request. Merges run in completion order, which is deliberately
//! unspecified. The response is emitted only after every contributor has
//! reported; dropping the request cancels any still-running children.

use crate::errors::Result;
use crate::metrics_defs::UPSTREAM_REQUEST_DURATION;
use crate::service::{Dispatcher, json_response, request_uri};
use bytes::Bytes;
use fleet::backend::BackendRef;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shared::client::{BackendClient, UpstreamResponse};
use shared::http::combine_url;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::task::JoinSet;

// Counter for 1% metric sampling.
static UPSTREAM_REQUEST_COUNT: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    pub enabled: bool,
}

/// Fans a GET out to all healthy backends and concatenates the JSON array
/// responses. With a dedup key, objects are kept once per distinct value of
/// that field; objects missing the field are dropped.
pub async fn fetch_list(
    dispatcher: &Dispatcher,
    request: &Request<Bytes>,
    dedup_key: Option<&'static str>,
) -> Result<Response<Bytes>> {
    let results = scatter(dispatcher, request, fetch_list_from_one).await;

    let mut merged: Vec<JsonValue> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for data in results {
        match dedup_key {
            None => merged.extend(data),
            Some(key) => {
                for item in data {
                    let Some(item_key) = string_key(&item, key) else {
                        continue;
                    };
                    if seen.insert(item_key) {
                        merged.push(item);
                    }
                }
            }
        }
    }

    json_response(&merged)
}

/// Fans out and merges JSON object responses by key union; on duplicate
/// keys the later completer wins.
pub async fn fetch_map(dispatcher: &Dispatcher, request: &Request<Bytes>) -> Result<Response<Bytes>> {
    let results = scatter(dispatcher, request, fetch_map_from_one).await;

    let mut merged = serde_json::Map::new();
    for data in results {
        merged.extend(data);
    }

    json_response(&merged)
}

/// Fans out and OR-merges feature flag lists: a flag is enabled iff any
/// backend reports it enabled. Each name appears once.
pub async fn fetch_features(
    dispatcher: &Dispatcher,
    request: &Request<Bytes>,
) -> Result<Response<Bytes>> {
    let results = scatter(dispatcher, request, fetch_features_from_one).await;

    let mut flags: HashMap<String, bool> = HashMap::new();
    for data in results {
        for flag in data {
            let enabled = flags.entry(flag.name).or_insert(false);
            *enabled = *enabled || flag.enabled;
        }
    }

    let merged: Vec<FeatureFlag> = flags
        .into_iter()
        .map(|(name, enabled)| FeatureFlag { name, enabled })
        .collect();
    json_response(&merged)
}

/// Fans out and returns the first non-empty response body; 404s count as
/// empty. All contributors empty or failed yields 404.
pub async fn broadcast(
    dispatcher: &Dispatcher,
    request: &Request<Bytes>,
) -> Result<Response<Bytes>> {
    let results = scatter(dispatcher, request, fetch_singleton_from_one).await;

    let winner = results
        .into_iter()
        .flatten()
        .find(|body: &Bytes| !body.is_empty());

    match winner {
        Some(body) => {
            let mut response = Response::new(body);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok(response)
        }
        None => {
            let mut response = Response::new(Bytes::new());
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

/// Spawns one fetch per healthy backend and collects the successful results
/// in completion order. `fetch` decides what a success is per strategy.
async fn scatter<T, F, Fut>(
    dispatcher: &Dispatcher,
    request: &Request<Bytes>,
    fetch: F,
) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(BackendClient, String, BackendRef, HeaderMap) -> Fut,
    Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
{
    let targets = dispatcher.accounts.healthy_backends();
    let uri = request_uri(request);

    let mut join_set = JoinSet::new();
    for target in targets {
        let url = combine_url(&target.url, uri);
        join_set.spawn(fetch(
            dispatcher.client.clone(),
            url,
            target,
            request.headers().clone(),
        ));
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(data)) => results.push(data),
            Ok(Err(reason)) => tracing::warn!("{reason}"),
            Err(e) => tracing::error!("Fan-out task panicked: {e}"),
        }
    }
    results
}

async fn fetch_list_from_one(
    client: BackendClient,
    url: String,
    target: BackendRef,
    headers: HeaderMap,
) -> std::result::Result<Vec<JsonValue>, String> {
    let response = timed_get(&client, &url, &target, &headers).await?;

    if response.status == StatusCode::NOT_FOUND {
        return Ok(Vec::new());
    }
    if !response.status_ok() {
        return Err(format!("{url} status {}", response.status.as_u16()));
    }
    serde_json::from_slice(&response.body).map_err(|e| format!("{url} returned junk: {e}"))
}

async fn fetch_map_from_one(
    client: BackendClient,
    url: String,
    target: BackendRef,
    headers: HeaderMap,
) -> std::result::Result<serde_json::Map<String, JsonValue>, String> {
    let response = timed_get(&client, &url, &target, &headers).await?;

    if response.status == StatusCode::NOT_FOUND {
        return Ok(serde_json::Map::new());
    }
    if !response.status_ok() {
        return Err(format!("{url} status {}", response.status.as_u16()));
    }
    serde_json::from_slice(&response.body).map_err(|e| format!("{url} returned junk: {e}"))
}

async fn fetch_features_from_one(
    client: BackendClient,
    url: String,
    target: BackendRef,
    headers: HeaderMap,
) -> std::result::Result<Vec<FeatureFlag>, String> {
    let response = timed_get(&client, &url, &target, &headers).await?;

    if !response.status_ok() {
        return Err(format!("{url} status {}", response.status.as_u16()));
    }
    serde_json::from_slice(&response.body).map_err(|e| format!("{url} returned junk: {e}"))
}

// 404 means "this backend has no content for the path", which is not an
// error in broadcast mode.
async fn fetch_singleton_from_one(
    client: BackendClient,
    url: String,
    target: BackendRef,
    headers: HeaderMap,
) -> std::result::Result<Option<Bytes>, String> {
    let response = timed_get(&client, &url, &target, &headers).await?;

    if response.status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !response.status_ok() {
        return Err(format!("{url} status {}", response.status.as_u16()));
    }
    Ok(Some(response.body))
}

async fn timed_get(
    client: &BackendClient,
    url: &str,
    target: &BackendRef,
    headers: &HeaderMap,
) -> std::result::Result<UpstreamResponse, String> {
    let started = Instant::now();
    let result = client.get(url, target.token.as_deref(), headers).await;

    if UPSTREAM_REQUEST_COUNT
        .fetch_add(1, Ordering::Relaxed)
        .is_multiple_of(100)
    {
        let status = match &result {
            Ok(response) => response.status.as_u16().to_string(),
            Err(_) => "error".to_string(),
        };
        metrics::histogram!(UPSTREAM_REQUEST_DURATION, "status" => status)
            .record(started.elapsed().as_secs_f64());
    }

    result.map_err(|e| e.to_string())
}

fn string_key(item: &JsonValue, key: &str) -> Option<String> {
    let value = item.as_object()?.get(key)?.as_str()?;
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
