//! Endpoint ownership matrix.
//!
//! A static, ordered table saying which transport may reach each HTTP
//! route and which auth model the route requires. Lookups are pure and
//! lock-free.
//!
//! Route patterns are `"METHOD /path"`, matched segment by segment:
//! literal segments match exactly, `:name` and `*` match one segment, and
//! a trailing `**` matches whatever remains (including nothing). A method
//! of `*` matches any method. First match in declaration order wins.

use serde::{Deserialize, Serialize};

use crate::state::RuntimeState;

/// Which path a request may arrive on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// The loopback listener only.
    Local,
    /// Through the reverse tunnel only.
    Tunnel,
    /// Either.
    Any,
}

impl Transport {
    /// Whether a route declared with `self` accepts requests that came in
    /// over `inbound`. An inbound of `Any` must satisfy both paths.
    pub fn admits(self, inbound: Transport) -> bool {
        match (self, inbound) {
            (Transport::Any, _) => true,
            (declared, Transport::Any) => declared == Transport::Any,
            (declared, inbound) => declared == inbound,
        }
    }
}

/// Which authentication check the HTTP layer must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthModel {
    /// Signed request from the server owner.
    Owner,
    /// Signed request from a registered builder.
    Builder,
    /// No signature; the request must be local.
    LocalOnly,
    /// No authentication.
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndpointSpec {
    pub route_pattern: &'static str,
    pub transport: Transport,
    pub auth_model: AuthModel,
}

const fn spec(route_pattern: &'static str, transport: Transport, auth_model: AuthModel) -> EndpointSpec {
    EndpointSpec {
        route_pattern,
        transport,
        auth_model,
    }
}

/// Applied to any route the table does not list.
pub const DEFAULT_SPEC: EndpointSpec = spec("* /**", Transport::Local, AuthModel::Owner);

/// The matrix, most specific first.
pub const ENDPOINT_MATRIX: &[EndpointSpec] = &[
    spec("GET /health", Transport::Any, AuthModel::Public),
    spec("POST /v1/data/:scope", Transport::Local, AuthModel::LocalOnly),
    spec("GET /v1/data/:scope/versions", Transport::Any, AuthModel::Builder),
    spec("GET /v1/data/:scope", Transport::Any, AuthModel::Builder),
    spec("GET /v1/data", Transport::Any, AuthModel::Builder),
    spec("DELETE /v1/data/:scope", Transport::Any, AuthModel::Owner),
    spec("POST /v1/grants/verify", Transport::Any, AuthModel::Public),
    spec("* /v1/grants/**", Transport::Any, AuthModel::Owner),
    spec("* /v1/access-logs/**", Transport::Any, AuthModel::Owner),
    spec("* /v1/sync/**", Transport::Any, AuthModel::Owner),
    spec("* /ui/**", Transport::Local, AuthModel::LocalOnly),
];

/// Look up the spec for `route` (`"METHOD /path"` or `"/path"`).
pub fn resolve(route: &str) -> &'static EndpointSpec {
    ENDPOINT_MATRIX
        .iter()
        .find(|entry| route_matches(entry.route_pattern, route))
        .unwrap_or(&DEFAULT_SPEC)
}

/// Why [`check`] refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AccessDenied {
    #[error("this endpoint is only accessible locally")]
    LocalOnly,

    #[error("this endpoint is only accessible through the tunnel")]
    TunnelOnly,

    #[error("the tunnel is not active")]
    TunnelInactive,

    #[error("server is {state}")]
    Unavailable { state: RuntimeState },
}

/// Decide whether a request may proceed given how it arrived and what mode
/// the daemon is in. Returns the auth model the caller must then enforce.
pub fn check(
    route: &str,
    inbound: Transport,
    state: RuntimeState,
) -> Result<AuthModel, AccessDenied> {
    let spec = resolve(route);

    if !spec.transport.admits(inbound) {
        return Err(match inbound {
            Transport::Local => AccessDenied::TunnelOnly,
            _ => AccessDenied::LocalOnly,
        });
    }
    if inbound != Transport::Local && state != RuntimeState::Tunneled {
        return Err(AccessDenied::TunnelInactive);
    }
    if spec.auth_model != AuthModel::Public && !state.is_serving() {
        return Err(AccessDenied::Unavailable { state });
    }

    Ok(spec.auth_model)
}

/// Match a single route against a pattern.
pub fn route_matches(pattern: &str, route: &str) -> bool {
    let (pattern_method, pattern_path) = split_route(pattern);
    let (route_method, route_path) = split_route(route);

    let method_ok = match (pattern_method, route_method) {
        (None | Some("*"), _) | (_, None) => true,
        (Some(p), Some(r)) => p.eq_ignore_ascii_case(r),
    };
    method_ok && path_matches(pattern_path, route_path)
}

fn split_route(route: &str) -> (Option<&str>, &str) {
    let route = route.trim();
    match route.split_once(char::is_whitespace) {
        Some((method, path)) if !method.starts_with('/') => (Some(method), path.trim_start()),
        _ => (None, route),
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|s| !s.is_empty())
}

fn path_matches(pattern: &str, path: &str) -> bool {
    let mut pattern = segments(pattern).peekable();
    let mut path = segments(path);

    while let Some(expected) = pattern.next() {
        if expected == "**" && pattern.peek().is_none() {
            return true;
        }
        let Some(actual) = path.next() else {
            return false;
        };
        let wildcard = expected == "*" || expected.starts_with(':');
        if !wildcard && expected != actual {
            return false;
        }
    }
    path.next().is_none()
}
