use auth::{
    config::{is_under, GatewayConfig},
    cookies::{bridged_cookie, current_session, is_bridged, strip_cookies, GATEWAY_COOKIES},
    data_model::{Credential, Session},
};
use http::{
    header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, COOKIE, HOST, LOCATION, SET_COOKIE},
    request::Parts,
    StatusCode, Uri,
};
use pingora::{
    http::{RequestHeader, ResponseHeader},
    prelude::{HttpPeer, ProxyHttp, Session as EdgeSession},
    Error, ErrorType,
};
use std::{sync::Arc, time::SystemTime};

use super::gatekeeper::{
    classify, decide, has_bridge_marker, return_target, Decision, GateRequest, PathClass,
    SessionState,
};

/// Connection-management headers plus anything that would override the injected credential.
pub static STRIPPED_REQUEST_HEADERS: [&str; 9] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
    "authorization",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Route {
    /// oauth endpoints, the credential endpoint and the two entry pages
    AuthService,
    /// the site itself, including the SPA bundle under the protected prefix
    #[default]
    Content,
    /// the admin api the SPA talks to
    Upstream,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgeAction {
    Respond(StatusCode),
    Redirect(String),
    Forward {
        route: Route,
        credential: Option<Credential>,
        /// set when this request carried the bridge marker; the marker is removed and
        /// the session is remembered as bridged
        bridged: Option<Session>,
    },
}

/// Decides what the edge does with one request. Pure apart from reading `now`.
pub fn plan(config: &GatewayConfig, parts: &Parts, now: SystemTime) -> EdgeAction {
    let paths = &config.paths;
    let path = parts.uri.path();
    let query = parts.uri.query();
    let session = current_session(&parts.headers, &config.session_codec, now).ok();

    if paths.is_proxy(path) {
        return match session {
            Some(session) => EdgeAction::Forward {
                route: Route::Upstream,
                credential: Some(session.credential),
                bridged: None,
            },
            None => EdgeAction::Respond(StatusCode::UNAUTHORIZED),
        };
    }
    if is_under(path, "/oauth") || is_under(path, "/auth") {
        return forward(Route::AuthService);
    }

    let class = classify(paths, path);
    if class == PathClass::Unprotected {
        return forward(Route::Content);
    }

    let marker = has_bridge_marker(query);
    let session_state = match &session {
        Some(session) => SessionState::HasSession {
            arrived_via_bridge: marker || is_bridged(&parts.headers, session),
        },
        None => SessionState::NoSession,
    };
    let decision = decide(
        paths,
        &GateRequest {
            path,
            query,
            session: session_state,
        },
    );
    tracing::debug!(path, ?class, ?session_state, ?decision, "gatekeeper");

    match decision {
        Decision::Allow => match class {
            PathClass::Login | PathClass::Bridge => forward(Route::AuthService),
            _ => EdgeAction::Forward {
                route: Route::Content,
                credential: None,
                bridged: session.filter(|_| marker),
            },
        },
        Decision::RedirectToLogin { return_to } => {
            EdgeAction::Redirect(paths.login_location(return_to.as_deref(), None))
        }
        Decision::RedirectToBridge { return_to } => {
            EdgeAction::Redirect(paths.bridge_location(&return_to))
        }
    }
}

fn forward(route: Route) -> EdgeAction {
    EdgeAction::Forward {
        route,
        credential: None,
        bridged: None,
    }
}

fn internal(context: &'static str, err: impl std::fmt::Display) -> Box<Error> {
    Error::explain(ErrorType::InternalError, format!("{context}: {err}"))
}

/// Moves the path from under the proxy prefix onto the upstream base path, keeping the query.
pub fn upstream_uri(config: &GatewayConfig, uri: &Uri) -> pingora::Result<Uri> {
    let prefix = config.paths.proxy_prefix.trim_end_matches('/');
    let rest = uri.path().strip_prefix(prefix).unwrap_or(uri.path());
    let rest = if rest.is_empty() { "/" } else { rest };
    let target = match uri.query() {
        Some(query) => format!("{}{rest}?{query}", config.upstream.base_path),
        None => format!("{}{rest}", config.upstream.base_path),
    };
    Uri::try_from(target).map_err(|err| internal("upstream uri", err))
}

/// Rewrites a SPA api call for the upstream: new target, stripped headers and gateway
/// cookies, upstream `host` and the session's bearer credential. The body is untouched.
pub fn prepare_upstream_request(
    upstream_request: &mut RequestHeader,
    config: &GatewayConfig,
    credential: &Credential,
) -> pingora::Result<()> {
    let uri = upstream_uri(config, &upstream_request.as_ref().uri)?;
    upstream_request.set_uri(uri);

    let cookies = upstream_request
        .as_ref()
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join("; ");
    for name in STRIPPED_REQUEST_HEADERS.iter().chain([&"cookie"]) {
        upstream_request.remove_header(*name);
    }
    if let Some(kept) = strip_cookies(&cookies, &GATEWAY_COOKIES) {
        upstream_request.insert_header(COOKIE, kept)?;
    }

    upstream_request.insert_header(HOST, config.upstream.host_header())?;
    upstream_request.insert_header(AUTHORIZATION, format!("Bearer {}", credential.as_str()))?;
    Ok(())
}

/// Drops the one-shot bridge marker from a content request.
pub fn strip_marker_from_request(upstream_request: &mut RequestHeader) -> pingora::Result<()> {
    let uri = &upstream_request.as_ref().uri;
    let target = return_target(uri.path(), uri.query());
    let uri = Uri::try_from(target).map_err(|err| internal("content uri", err))?;
    upstream_request.set_uri(uri);
    Ok(())
}

async fn respond(
    session: &mut EdgeSession,
    status: StatusCode,
    location: Option<String>,
) -> pingora::Result<()> {
    let mut resp = ResponseHeader::build(status, Some(4))?;
    if let Some(location) = location {
        resp.insert_header(LOCATION, location)?;
    }
    resp.insert_header(CACHE_CONTROL, "no-store")?;
    resp.insert_header(CONTENT_LENGTH, "0")?;
    session.write_response_header(Box::new(resp), true).await
}

async fn resolve(addr: &str) -> pingora::Result<std::net::SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        // answered as a bad gateway, same as an unreachable upstream
        .ok_or_else(|| {
            Error::explain(
                ErrorType::HTTPStatus(502),
                format!("could not resolve {addr}"),
            )
        })
}

#[derive(Clone, Debug, Default)]
pub struct ReqContext {
    route: Route,
    credential: Option<Credential>,
    bridged: Option<Session>,
}

impl ReqContext {
    /// Rewrites the outgoing request for the route chosen in `request_filter`.
    pub fn prepare_request(
        &self,
        upstream_request: &mut RequestHeader,
        config: &GatewayConfig,
    ) -> pingora::Result<()> {
        match (self.route, &self.credential) {
            (Route::Upstream, Some(credential)) => {
                prepare_upstream_request(upstream_request, config, credential)
            }
            // never forward an api call without the injected credential
            (Route::Upstream, None) => Err(Error::new_str("upstream route without credential")),
            (Route::Content, _) if self.bridged.is_some() => {
                strip_marker_from_request(upstream_request)
            }
            _ => Ok(()),
        }
    }
}

pub struct EdgeProxy {
    config: Arc<GatewayConfig>,
}

impl EdgeProxy {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl ProxyHttp for EdgeProxy {
    type CTX = ReqContext;
    fn new_ctx(&self) -> Self::CTX {
        ReqContext::default()
    }

    #[tracing::instrument(skip_all, err)]
    async fn request_filter(
        &self,
        session: &mut EdgeSession,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<bool> {
        let action = plan(&self.config, session.req_header().as_ref(), SystemTime::now());
        match action {
            EdgeAction::Respond(status) => {
                respond(session, status, None).await?;
                Ok(true)
            }
            EdgeAction::Redirect(location) => {
                respond(session, StatusCode::FOUND, Some(location)).await?;
                Ok(true)
            }
            EdgeAction::Forward {
                route,
                credential,
                bridged,
            } => {
                *ctx = ReqContext {
                    route,
                    credential,
                    bridged,
                };
                Ok(false)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut EdgeSession,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<Box<HttpPeer>> {
        let peer = match ctx.route {
            Route::AuthService => {
                HttpPeer::new(resolve(&self.config.auth_server_addr).await?, false, String::new())
            }
            Route::Content => HttpPeer::new(
                resolve(&self.config.content_server_addr).await?,
                false,
                String::new(),
            ),
            Route::Upstream => {
                let upstream = &self.config.upstream;
                let addr = resolve(&format!("{}:{}", upstream.host, upstream.port)).await?;
                let mut peer = HttpPeer::new(addr, upstream.tls, upstream.host.clone());
                peer.options.connection_timeout = Some(self.config.upstream_timeout);
                peer.options.total_connection_timeout = Some(self.config.upstream_timeout);
                peer.options.read_timeout = Some(self.config.upstream_timeout);
                peer.options.write_timeout = Some(self.config.upstream_timeout);
                peer
            }
        };
        Ok(Box::new(peer))
    }

    #[tracing::instrument(skip_all, err)]
    async fn upstream_request_filter(
        &self,
        _session: &mut EdgeSession,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        ctx.prepare_request(upstream_request, &self.config)
    }

    #[tracing::instrument(skip_all, err)]
    async fn response_filter(
        &self,
        _session: &mut EdgeSession,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        if let Some(session) = &ctx.bridged {
            let cookie = bridged_cookie(session, self.config.session_ttl, self.config.secure_cookies);
            upstream_response.append_header(SET_COOKIE, cookie.to_string())?;
        }
        Ok(())
    }
}
