//! Per-request decision for paths in front of the admin SPA.
//!
//! `decide` is a pure function of the path, the query and whether the request carries a valid
//! session. A session only reaches protected content after passing the bridge page once, and
//! the bridge hands back a one-shot marker, so every navigation settles after at most two
//! redirects (login, then bridge).

use auth::config::{query_param, GatePaths, BRIDGE_MARKER_PARAM, RETURN_TO_PARAM};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathClass {
    Login,
    Bridge,
    ProtectedContent,
    Unprotected,
}

pub fn classify(paths: &GatePaths, path: &str) -> PathClass {
    if paths.is_login(path) {
        PathClass::Login
    } else if paths.is_bridge(path) {
        PathClass::Bridge
    } else if paths.is_protected(path) {
        PathClass::ProtectedContent
    } else {
        PathClass::Unprotected
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    /// `arrived_via_bridge` is set by the one-shot marker or by the bridged cookie of this session.
    HasSession { arrived_via_bridge: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    RedirectToLogin { return_to: Option<String> },
    RedirectToBridge { return_to: String },
}

#[derive(Clone, Copy, Debug)]
pub struct GateRequest<'a> {
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub session: SessionState,
}

pub fn decide(paths: &GatePaths, req: &GateRequest) -> Decision {
    match (classify(paths, req.path), req.session) {
        (PathClass::Unprotected | PathClass::Login, _) => Decision::Allow,
        (PathClass::Bridge, SessionState::HasSession { .. }) => Decision::Allow,
        (PathClass::Bridge, SessionState::NoSession) => Decision::RedirectToLogin {
            return_to: req
                .query
                .and_then(|query| query_param(query, RETURN_TO_PARAM)),
        },
        (PathClass::ProtectedContent, SessionState::NoSession) => Decision::RedirectToLogin {
            return_to: Some(return_target(req.path, req.query)),
        },
        (
            PathClass::ProtectedContent,
            SessionState::HasSession {
                arrived_via_bridge: true,
            },
        ) => Decision::Allow,
        (
            PathClass::ProtectedContent,
            SessionState::HasSession {
                arrived_via_bridge: false,
            },
        ) => Decision::RedirectToBridge {
            return_to: return_target(req.path, req.query),
        },
    }
}

fn is_marker(pair: &str) -> bool {
    pair.split_once('=').map_or(pair, |(key, _)| key) == BRIDGE_MARKER_PARAM
}

pub fn has_bridge_marker(query: Option<&str>) -> bool {
    query.is_some_and(|query| query.split('&').any(is_marker))
}

/// The query without the marker, other pairs left byte for byte. `None` when nothing remains.
pub fn strip_bridge_marker(query: Option<&str>) -> Option<String> {
    let kept: Vec<&str> = query?
        .split('&')
        .filter(|pair| !pair.is_empty() && !is_marker(pair))
        .collect();
    (!kept.is_empty()).then(|| kept.join("&"))
}

/// Where the browser should end up once the redirect chain settles.
pub fn return_target(path: &str, query: Option<&str>) -> String {
    match strip_bridge_marker(query) {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    }
}
