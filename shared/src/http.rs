use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap,
    HeaderName, USER_AGENT,
};
use hyper::StatusCode;
use hyper::body::Body;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

pub async fn run_http_service<S, B, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let service_arc = Arc::new(service);

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            let _ = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await;
        });
    }
}

// Headers that are never forwarded between the client side and the backend
// side; the outbound client re-sets the ones it needs itself.
static IGNORED_HEADERS: &[HeaderName] = &[
    ACCEPT_ENCODING,
    CONNECTION,
    CONTENT_LENGTH,
    CONTENT_TYPE,
    USER_AGENT,
];

fn is_ignored(name: &HeaderName) -> bool {
    IGNORED_HEADERS.contains(name)
}

/// Copies `src` into `dst`, skipping the ignored set. Multi-valued headers
/// keep all of their values.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src.iter() {
        if is_ignored(name) {
            continue;
        }
        dst.append(name, value.clone());
    }
}

/// Reduces a header map to the entries worth recording in a trace log line:
/// `x-*` headers plus the content encoding and type.
pub fn simplify_headers_for_logging(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut ret: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers.iter() {
        let wanted =
            name.as_str().starts_with("x-") || *name == CONTENT_ENCODING || *name == CONTENT_TYPE;
        if !wanted {
            continue;
        }
        ret.entry(name.to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    ret
}

/// Joins a base URL and a request path with exactly one `/` between them.
///
/// An empty path is treated as `/`; a missing leading slash is added; a
/// single trailing slash on the base is stripped.
pub fn combine_url(base: &str, path: &str) -> String {
    let mut uri = if path.is_empty() { "/" } else { path }.to_string();
    if !uri.starts_with('/') {
        uri.insert(0, '/');
    }
    let base = base.strip_suffix('/').unwrap_or(base);
    format!("{base}{uri}")
}

/// Creates an error response with the status message as body.
pub fn make_error_response(status_code: StatusCode) -> Response<Bytes> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(Bytes::from(message));
    *response.status_mut() = status_code;
    response
}
