//! Metric names emitted by the fleet crate.

/// Histogram: wall time of one full account refresh, tagged with `status`.
pub const ACCOUNT_REFRESH_DURATION: &str = "fleet.account_refresh.duration";

/// Histogram: accounts published by a refresh, tagged with `kind`
/// (`cloud` or `artifact`).
pub const ACCOUNT_REFRESH_ACCOUNTS: &str = "fleet.account_refresh.accounts";
