//! Catch-all handlers for paths no specific route claims.
//!
//! Unknown GETs are safe to serve from any backend, since read endpoints
//! not scoped to an account behave identically fleet-wide. Unknown
//! mutations are refused outright: routing a write to an arbitrary shard
//! could land it on a backend that does not own the data.

use crate::account_route::forward_upstream;
use crate::errors::{GatewayError, Result};
use crate::service::{Dispatcher, request_uri};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use shared::http::{combine_url, make_error_response, simplify_headers_for_logging};
use std::collections::HashMap;

#[derive(Debug, Serialize)]
struct TraceHttp {
    #[serde(skip_serializing_if = "String::is_empty")]
    uri: String,
    headers: HashMap<String, Vec<String>>,
    body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
}

#[derive(Debug, Serialize)]
struct TraceRecord {
    method: String,
    request: TraceHttp,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<TraceHttp>,
}

fn log_trace(record: &TraceRecord, message: &'static str) {
    if let Ok(json) = serde_json::to_string(record) {
        tracing::info!(trace = %json, "{message}");
    }
}

/// Proxies an unmatched GET to the first healthy backend, recording the
/// full exchange.
pub async fn proxy(dispatcher: &Dispatcher, request: &Request<Bytes>) -> Result<Response<Bytes>> {
    let targets = dispatcher.accounts.healthy_backends();
    let Some(target) = targets.first() else {
        return Err(GatewayError::NoHealthyBackends);
    };

    let target_url = combine_url(&target.url, request_uri(request));
    let token = target.token.as_deref();
    let result = if request.body().is_empty() {
        dispatcher
            .client
            .get(&target_url, token, request.headers())
            .await
    } else {
        dispatcher
            .client
            .send(
                request.method().clone(),
                &target_url,
                token,
                request.headers(),
                request.body().clone(),
            )
            .await
    };

    let record = TraceRecord {
        method: request.method().to_string(),
        request: TraceHttp {
            uri: request_uri(request).to_string(),
            headers: simplify_headers_for_logging(request.headers()),
            body: BASE64.encode(request.body()),
            status_code: None,
        },
        response: result.as_ref().ok().map(|upstream| TraceHttp {
            uri: target_url.clone(),
            headers: simplify_headers_for_logging(&upstream.headers),
            body: BASE64.encode(&upstream.body),
            status_code: Some(upstream.status.as_u16()),
        }),
    };
    log_trace(&record, "Proxied unmatched GET");

    Ok(forward_upstream(&target_url, result))
}

/// Refuses an unmatched mutation after recording what it looked like. No
/// backend is contacted.
pub fn fail_and_log(request: &Request<Bytes>) -> Result<Response<Bytes>> {
    let record = TraceRecord {
        method: request.method().to_string(),
        request: TraceHttp {
            uri: request_uri(request).to_string(),
            headers: simplify_headers_for_logging(request.headers()),
            body: BASE64.encode(request.body()),
            status_code: None,
        },
        response: None,
    };
    log_trace(&record, "Refusing unmatched mutation");

    Ok(make_error_response(StatusCode::SERVICE_UNAVAILABLE))
}
