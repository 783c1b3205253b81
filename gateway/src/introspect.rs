//! Diagnostic endpoints: the tracked account lists, the route maps, and
//! the aggregate health document.

use crate::errors::Result;
use crate::service::{Dispatcher, json_response, json_response_with_status};
use bytes::Bytes;
use fleet::backend::{BackendRef, TrackedAccount};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountsResponse {
    accounts: Vec<TrackedAccount>,
    artifact_accounts: Vec<TrackedAccount>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountRoutesResponse {
    accounts: HashMap<String, BackendRef>,
    artifact_accounts: HashMap<String, BackendRef>,
}

pub fn accounts(dispatcher: &Dispatcher) -> Result<Response<Bytes>> {
    json_response(&AccountsResponse {
        accounts: dispatcher.accounts.cloud_accounts(),
        artifact_accounts: dispatcher.accounts.artifact_accounts(),
    })
}

pub fn account_routes(dispatcher: &Dispatcher) -> Result<Response<Bytes>> {
    json_response(&AccountRoutesResponse {
        accounts: dispatcher.accounts.cloud_routes(),
        artifact_accounts: dispatcher.accounts.artifact_routes(),
    })
}

/// The health document, served with 200 when every required check passes
/// and 418 otherwise.
pub fn health(dispatcher: &Dispatcher) -> Result<Response<Bytes>> {
    let document = dispatcher.health.document();
    let status = if document.healthy {
        StatusCode::OK
    } else {
        StatusCode::IM_A_TEAPOT
    };
    json_response_with_status(&document, status)
}
