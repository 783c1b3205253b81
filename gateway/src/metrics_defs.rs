//! Metric names emitted by the gateway crate.

/// Histogram: duration of one fan-out upstream request, tagged with
/// `status`. Sampled at 1%.
pub const UPSTREAM_REQUEST_DURATION: &str = "gateway.upstream_request.duration";
