pub mod account_route;
pub mod errors;
pub mod fallback;
pub mod fanout;
pub mod introspect;
pub mod metrics_defs;
pub mod ops;
pub mod router;
pub mod service;

#[cfg(test)]
mod testutils;

use crate::errors::GatewayError;
use crate::router::Router;
use crate::service::{Dispatcher, GatewayService};
use shared::http::run_http_service;

/// Serves the aggregator surface until the listener fails.
pub async fn run(listen_port: u16, dispatcher: Dispatcher) -> Result<(), GatewayError> {
    let service = GatewayService::new(Router::with_default_routes(), dispatcher);
    run_http_service("0.0.0.0", listen_port, service).await
}
