//! Test helpers: throwaway backends and pre-routed dispatchers.

use crate::service::Dispatcher;
use bytes::Bytes;
use fleet::accounts::{AccountRouter, RoutingSnapshot};
use fleet::backend::BackendRef;
use fleet::health::HealthSupervisor;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use shared::client::{BackendClient, ClientConfig};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A single-purpose backend that records every request it receives and
/// answers with a fixed status and body.
pub struct TestBackend {
    port: u16,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl TestBackend {
    pub async fn respond(status: StatusCode, reply: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                let recorded = recorded.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let recorded = recorded.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body_bytes = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();
                            recorded.lock().unwrap().push(RecordedRequest {
                                method: parts.method,
                                uri: parts.uri.to_string(),
                                headers: parts.headers,
                                body: body_bytes,
                            });

                            let mut response =
                                Response::new(Full::new(Bytes::from_static(reply.as_bytes())));
                            *response.status_mut() = status;
                            response.headers_mut().insert(
                                CONTENT_TYPE,
                                HeaderValue::from_static("application/json"),
                            );
                            Ok::<_, Infallible>(response)
                        }
                    });

                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        Self { port, requests }
    }

    pub async fn json(body: &'static str) -> Self {
        Self::respond(StatusCode::OK, body).await
    }

    pub async fn status(status: StatusCode) -> Self {
        Self::respond(status, "").await
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn backend_ref(&self) -> BackendRef {
        BackendRef {
            url: self.url(),
            priority: 0,
            token: None,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

/// A dispatcher whose routing table maps `account<i>` to the i-th backend.
pub fn test_dispatcher(backends: Vec<&TestBackend>) -> Dispatcher {
    let routes: Vec<(String, &TestBackend)> = backends
        .into_iter()
        .enumerate()
        .map(|(i, b)| (format!("account{i}"), b))
        .collect();
    test_dispatcher_with_routes(
        routes.iter().map(|(n, b)| (n.as_str(), *b)).collect(),
        Vec::new(),
    )
}

/// A dispatcher with explicit cloud and artifact account routes.
pub fn test_dispatcher_with_routes(
    cloud: Vec<(&str, &TestBackend)>,
    artifact: Vec<(&str, &TestBackend)>,
) -> Dispatcher {
    let accounts = AccountRouter::new();
    accounts.publish(RoutingSnapshot {
        cloud_routes: route_map(cloud),
        artifact_routes: route_map(artifact),
        ..Default::default()
    });

    Dispatcher {
        client: BackendClient::new(&ClientConfig {
            client_timeout: 5,
            ..ClientConfig::default()
        }),
        accounts,
        health: HealthSupervisor::new(15),
    }
}

fn route_map(routes: Vec<(&str, &TestBackend)>) -> HashMap<String, BackendRef> {
    routes
        .into_iter()
        .map(|(name, backend)| (name.to_string(), backend.backend_ref()))
        .collect()
}
