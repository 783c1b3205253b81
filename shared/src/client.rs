//! Outbound HTTP client for talking to clouddriver backends.
//!
//! One shared client configuration covers every outbound call the service
//! makes: request handlers proxying on behalf of a caller, the account
//! refresh loop, and health probes. The client buffers response bodies in
//! full, never follows redirects, and never negotiates compressed transfer
//! encodings; redirect responses and upstream error statuses are returned
//! to the caller as data, not errors.

use crate::http::copy_headers;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;

/// Timeouts and connection limits for the shared outbound client.
///
/// The dial timeout applies to establishing the TCP connection; the client
/// timeout bounds the whole request/response cycle including body
/// collection. The TLS-handshake and response-header limits are folded
/// into the overall deadline (certificate plumbing terminates upstream of
/// this service, so the connector speaks plain HTTP).
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub dial_timeout: u64,
    pub client_timeout: u64,
    pub tls_handshake_timeout: u64,
    pub response_header_timeout: u64,
    pub max_idle_connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout: 15,
            client_timeout: 60,
            tls_handshake_timeout: 15,
            response_header_timeout: 15,
            max_idle_connections: 5,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("request to {0} failed: {1}")]
    Transport(String, String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("reading response body from {0} failed: {1}")]
    Read(String, String),

    #[error("invalid outbound request for {0}: {1}")]
    InvalidRequest(String, String),
}

/// A fully buffered upstream response. Non-2xx statuses are not an error at
/// this layer; callers decide what to forward.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn status_ok(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Clone)]
pub struct BackendClient {
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl BackendClient {
    pub fn new(config: &ClientConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.dial_timeout)));
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_connections)
            .build(connector);

        Self {
            client,
            request_timeout: Duration::from_secs(config.client_timeout),
        }
    }

    /// Issues a GET to `url`, forwarding `inbound_headers` minus the ignored
    /// set and injecting `Authorization: Bearer <token>` when a token is
    /// present.
    pub async fn get(
        &self,
        url: &str,
        token: Option<&str>,
        inbound_headers: &HeaderMap,
    ) -> Result<UpstreamResponse, ClientError> {
        self.request(Method::GET, url, token, inbound_headers, None)
            .await
    }

    /// Issues a request carrying a JSON body; sets the content type the
    /// backends expect.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        token: Option<&str>,
        inbound_headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, ClientError> {
        self.request(method, url, token, inbound_headers, Some(body))
            .await
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        token: Option<&str>,
        inbound_headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<UpstreamResponse, ClientError> {
        let mut request = Request::builder()
            .method(method)
            .uri(url)
            .body(Full::new(body.clone().unwrap_or_default()))
            .map_err(|e| ClientError::InvalidRequest(url.to_string(), e.to_string()))?;

        let headers = request.headers_mut();
        copy_headers(headers, inbound_headers);
        // Caller credentials never reach a backend; the only Authorization a
        // backend sees is its own bearer token.
        headers.remove(AUTHORIZATION);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if body.is_some() {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=UTF-8"),
            );
        }
        if let Some(token) = token
            && !token.is_empty()
        {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::InvalidRequest(url.to_string(), e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        // One deadline for the whole exchange, body collection included.
        let response = timeout(self.request_timeout, async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ClientError::Transport(url.to_string(), e.to_string()))?;

            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| ClientError::Read(url.to_string(), e.to_string()))?;

            Ok(UpstreamResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        })
        .await
        .map_err(|_| ClientError::Timeout(url.to_string()))??;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    // Echo server: request headers become response headers, request body
    // becomes response body.
    async fn echo_handler(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_else(|_| Bytes::new());

        let mut response = Response::new(Full::new(body_bytes));
        *response.headers_mut() = parts.headers;
        Ok(response)
    }

    async fn start_echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = hyper_util::rt::TokioIo::new(stream);

                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service_fn(echo_handler))
                        .await;
                });
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        port
    }

    fn test_client() -> BackendClient {
        BackendClient::new(&ClientConfig {
            client_timeout: 5,
            ..ClientConfig::default()
        })
    }

    #[tokio::test]
    async fn test_get_shapes_headers() {
        let port = start_echo_server().await;
        let client = test_client();

        let mut inbound = HeaderMap::new();
        inbound.insert("x-spinnaker-user", HeaderValue::from_static("someone"));
        inbound.insert("accept-encoding", HeaderValue::from_static("gzip"));
        inbound.insert("user-agent", HeaderValue::from_static("curl"));
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller-token"));

        let response = client
            .get(
                &format!("http://127.0.0.1:{port}/credentials"),
                Some("sekrit"),
                &inbound,
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        // Echoed request headers: forwarded, injected, and stripped ones.
        assert_eq!(
            response.headers.get("x-spinnaker-user"),
            Some(&HeaderValue::from_static("someone"))
        );
        assert_eq!(
            response.headers.get(ACCEPT),
            Some(&HeaderValue::from_static("application/json"))
        );
        // The caller's own Authorization is replaced by the backend token.
        assert_eq!(
            response.headers.get(AUTHORIZATION),
            Some(&HeaderValue::from_static("Bearer sekrit"))
        );
        assert!(response.headers.get("accept-encoding").is_none());
    }

    #[tokio::test]
    async fn test_send_carries_body_and_content_type() {
        let port = start_echo_server().await;
        let client = test_client();

        let response = client
            .send(
                Method::POST,
                &format!("http://127.0.0.1:{port}/kubernetes/ops"),
                None,
                &HeaderMap::new(),
                Bytes::from_static(b"[{\"deployManifest\":{\"account\":\"x\"}}]"),
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.body.as_ref(),
            b"[{\"deployManifest\":{\"account\":\"x\"}}]"
        );
        assert_eq!(
            response.headers.get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json; charset=UTF-8"))
        );
        assert!(response.headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let client = test_client();

        let result = client
            .get("http://127.0.0.1:1/credentials", None, &HeaderMap::new())
            .await;

        assert!(matches!(result, Err(ClientError::Transport(_, _))));
    }
}
