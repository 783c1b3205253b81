//! The router surface: a method + path-pattern table binding each endpoint
//! to a dispatch kind.
//!
//! Patterns are segment-wise: a literal segment must match exactly, a
//! `{var}` segment captures the path segment under that name, and a prefix
//! route matches any path that starts with the pattern's segments. The
//! first matching route wins; requests matching nothing fall back to the
//! catch-all proxy for GET, or the mutation guard for everything else.

use hyper::Method;
use std::collections::HashMap;

/// The dispatch strategies a route may bind to.
#[derive(Clone, Debug, PartialEq)]
pub enum HandlerKind {
    /// Fan out, merge JSON arrays; `dedup_key` drops duplicate objects by
    /// the named string field.
    FetchList { dedup_key: Option<&'static str> },
    /// Fan out, merge JSON objects by last-writer-wins key union.
    FetchMap,
    /// Fan out, OR-merge `{name, enabled}` feature flags.
    FetchFeatures,
    /// Fan out, return the first non-empty response body.
    Broadcast,
    /// Route to one backend by the account name in the named path variable.
    AccountPath { var: &'static str },
    /// As `AccountPath`, resolved through the artifact map.
    ArtifactPath { var: &'static str },
    /// Route by the account name in the named query parameter; without the
    /// parameter this degrades to a plain list fan-out.
    AccountQuery { param: &'static str },
    /// Route by the accounts named inside a JSON array request body.
    CloudOps,
    /// Route by the `artifactAccount` field of the request body.
    ArtifactFetch,
    /// Route by the account named inside a single-object request body.
    CachePost,
    /// Introspection: tracked account lists.
    Accounts,
    /// Introspection: route maps.
    AccountRoutes,
    /// Aggregate health document.
    Health,
    /// Catch-all GET: proxy to any healthy backend.
    FallbackProxy,
    /// Catch-all for mutations: log and refuse.
    FallbackFail,
}

pub type PathVars = HashMap<&'static str, String>;

#[derive(Clone, Copy, Debug, PartialEq)]
enum MatchKind {
    Exact,
    Prefix,
}

struct Route {
    method: Method,
    pattern: &'static str,
    match_kind: MatchKind,
    kind: HandlerKind,
}

pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// The clouddriver endpoint table. Order matters where an exact route
    /// shares its head with a prefix route.
    pub fn with_default_routes() -> Self {
        use HandlerKind::*;
        use MatchKind::{Exact, Prefix};

        let get = Method::GET;
        let mut routes = Vec::new();
        let mut add = |method: &Method, pattern, match_kind, kind| {
            routes.push(Route {
                method: method.clone(),
                pattern,
                match_kind,
                kind,
            });
        };

        add(&get, "/health", Exact, Health);
        add(&get, "/applications", Exact, FetchList { dedup_key: None });
        add(&get, "/applications/{name}/clusters", Exact, FetchMap);
        add(&get, "/applications/{name}/loadBalancers", Exact, FetchList { dedup_key: None });
        add(&get, "/applications/{name}/serverGroupManagers", Exact, FetchList { dedup_key: None });
        add(&get, "/applications/{name}/serverGroups", Exact, FetchList { dedup_key: None });
        add(&get, "/artifacts/credentials", Exact, FetchList { dedup_key: Some("name") });
        add(&Method::PUT, "/artifacts/fetch", Exact, ArtifactFetch);
        add(&get, "/artifacts/account/{account}/names", Exact, ArtifactPath { var: "account" });
        add(&get, "/artifacts/account/{account}/versions", Exact, ArtifactPath { var: "account" });
        add(&get, "/aws/images/find", Exact, FetchList { dedup_key: None });
        add(&Method::POST, "/aws/ops", Exact, CloudOps);
        add(&Method::POST, "/cache", Prefix, CachePost);
        add(&get, "/credentials", Exact, FetchList { dedup_key: Some("name") });
        add(&get, "/credentials/{account}", Exact, AccountPath { var: "account" });
        add(&get, "/dockerRegistry/images/find", Exact, AccountQuery { param: "account" });
        add(&get, "/features/stages", Exact, FetchFeatures);
        add(&get, "/instanceTypes", Exact, FetchList { dedup_key: None });
        add(&get, "/keyPairs", Exact, FetchList { dedup_key: None });
        add(&Method::POST, "/kubernetes/ops", Exact, CloudOps);
        add(&get, "/securityGroups", Exact, FetchMap);
        add(&get, "/subnets/aws", Exact, FetchList { dedup_key: None });
        add(&get, "/applications/{name}/clusters/{account}", Prefix, AccountPath { var: "account" });
        add(&get, "/applications/{name}/loadBalancers/{account}", Prefix, AccountPath { var: "account" });
        add(&get, "/applications/{name}/serverGroups/{account}", Prefix, AccountPath { var: "account" });
        add(&get, "/instances/{account}", Prefix, AccountPath { var: "account" });
        add(&get, "/manifests/{account}", Prefix, AccountPath { var: "account" });
        add(&get, "/networks/aws", Exact, FetchList { dedup_key: None });
        add(&get, "/securityGroups/{account}", Prefix, AccountPath { var: "account" });
        add(&get, "/serverGroups/{account}", Prefix, AccountPath { var: "account" });
        add(&get, "/task", Prefix, Broadcast);
        add(&get, "/_internal/accountRoutes", Exact, AccountRoutes);
        add(&get, "/_internal/accounts", Exact, Accounts);

        Self { routes }
    }

    #[cfg(test)]
    fn with_routes(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Resolves a request to its dispatch kind and captured path variables.
    pub fn resolve(&self, method: &Method, path: &str) -> (HandlerKind, PathVars) {
        for route in &self.routes {
            if route.method != *method {
                continue;
            }
            if let Some(vars) = match_pattern(route.pattern, route.match_kind, path) {
                return (route.kind.clone(), vars);
            }
        }

        // Unknown GETs are safe to hand to any backend; unknown mutations
        // must never be routed arbitrarily.
        if *method == Method::GET {
            (HandlerKind::FallbackProxy, PathVars::new())
        } else {
            (HandlerKind::FallbackFail, PathVars::new())
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn match_pattern(pattern: &'static str, match_kind: MatchKind, path: &str) -> Option<PathVars> {
    let pattern_segments = segments(pattern);
    let path_segments = segments(path);

    let length_ok = match match_kind {
        MatchKind::Exact => path_segments.len() == pattern_segments.len(),
        MatchKind::Prefix => path_segments.len() >= pattern_segments.len(),
    };
    if !length_ok {
        return None;
    }

    let mut vars = PathVars::new();
    for (expected, actual) in pattern_segments.iter().zip(&path_segments) {
        if let Some(var) = expected.strip_prefix('{').and_then(|v| v.strip_suffix('}')) {
            vars.insert(var, (*actual).to_string());
        } else if expected != actual {
            return None;
        }
    }
    Some(vars)
}
