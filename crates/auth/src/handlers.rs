use axum::{
    extract::{Query, State},
    http::{
        header::{CACHE_CONTROL, SET_COOKIE},
        HeaderMap, HeaderName,
    },
    response::{AppendHeaders, Html, IntoResponse, Redirect, Response},
    Json,
};
use cookie::Cookie;
use serde::Deserialize;
use std::time::SystemTime;
use subtle::ConstantTimeEq;

use super::{
    config::GatewayConfig,
    cookies::{
        clear_nonce_cookie, clear_session_cookies, cookie_value, current_session, nonce_cookie,
        session_cookies, OAUTH_NONCE_COOKIE,
    },
    data_model::{AuthError, BridgeProjection, Credential, OAuthState, Session},
    oauth_state_db::OAuthStateDb,
    pages,
    server_state::AuthServerState,
};

#[derive(Debug, Default, Deserialize)]
pub struct ReturnToParams {
    pub return_to: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginPageParams {
    pub error: Option<String>,
    pub return_to: Option<String>,
}

#[derive(Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// set by the provider when the user denied access or the request was invalid
    pub error: Option<String>,
}

fn set_cookies<'a>(
    cookies: impl IntoIterator<Item = Cookie<'a>>,
) -> AppendHeaders<Vec<(HeaderName, String)>> {
    AppendHeaders(
        cookies
            .into_iter()
            .map(|cookie| (SET_COOKIE, cookie.to_string()))
            .collect(),
    )
}

/// Sends the browser back to the login page with the error's code. Never includes provider output.
fn login_redirect(config: &GatewayConfig, err: &AuthError, return_to: Option<&str>) -> Response {
    match err {
        AuthError::Encoding(_) | AuthError::StateStore(_) | AuthError::Render(_) => {
            tracing::error!(code = err.error_code(), "{err}")
        }
        _ => tracing::warn!(code = err.error_code(), "{err}"),
    }
    (
        set_cookies([clear_nonce_cookie()]),
        Redirect::to(
            &config
                .paths
                .login_location(return_to, Some(err.error_code())),
        ),
    )
        .into_response()
}

/// Starts a login: stores a fresh state, pins its nonce to this browser and hands off to the provider.
#[tracing::instrument(skip_all)]
pub async fn oauth_login<StateDb: OAuthStateDb>(
    State(state): State<AuthServerState<StateDb>>,
    Query(params): Query<ReturnToParams>,
) -> Response {
    let config = &state.config;
    let return_to = config
        .paths
        .sanitize_return_to(params.return_to.as_deref());
    let oauth_state = OAuthState::issue(
        config.oauth_state_ttl,
        Some(return_to.clone()),
        SystemTime::now(),
    );
    if let Err(err) = state.state_db.issue(&oauth_state).await {
        return login_redirect(
            config,
            &AuthError::StateStore(err.to_string()),
            Some(&return_to),
        );
    }
    (
        set_cookies([nonce_cookie(
            &oauth_state.nonce,
            config.oauth_state_ttl,
            config.secure_cookies,
        )]),
        Redirect::to(&config.authorize_url(&oauth_state.nonce)),
    )
        .into_response()
}

/// Runs the callback checks in order. The state check happens before any provider call,
/// and the stored state is consumed whether or not the rest succeeds.
pub async fn complete_exchange<StateDb: OAuthStateDb>(
    state: &AuthServerState<StateDb>,
    params: &CallbackParams,
    headers: &HeaderMap,
    now: SystemTime,
) -> Result<(Session, String), AuthError> {
    let config = &state.config;
    let nonce = params
        .state
        .as_deref()
        .filter(|nonce| !nonce.is_empty())
        .ok_or(AuthError::CsrfMismatch)?;
    let pinned = cookie_value(headers, OAUTH_NONCE_COOKIE).ok_or(AuthError::CsrfMismatch)?;
    if nonce.as_bytes().ct_ne(pinned.as_bytes()).into() {
        return Err(AuthError::CsrfMismatch);
    }
    let pending = state
        .state_db
        .consume(nonce)
        .await
        .map_err(|err| AuthError::StateStore(err.to_string()))?
        .filter(|pending| pending.nonce == nonce && pending.is_live_at(now))
        .ok_or(AuthError::CsrfMismatch)?;

    if let Some(error) = &params.error {
        tracing::warn!(provider_error = %error, "provider reported an error on callback");
        return Err(AuthError::UpstreamExchangeFailed);
    }
    let code = params
        .code
        .as_deref()
        .filter(|code| !code.is_empty())
        .ok_or(AuthError::MissingCode)?;

    let token = state.provider.exchange_code(code).await.map_err(|err| {
        tracing::warn!("token exchange: {err}");
        AuthError::UpstreamExchangeFailed
    })?;
    let identity = state.provider.fetch_identity(&token).await.map_err(|err| {
        tracing::warn!("identity fetch: {err}");
        AuthError::IdentityFetchFailed
    })?;

    let session = Session::issue(
        Credential::new(token.0),
        identity.subject,
        now,
        config.session_ttl,
    )?;
    let return_to = config
        .paths
        .sanitize_return_to(pending.return_to.as_deref());
    tracing::info!(subject = %session.subject, "session issued");
    Ok((session, return_to))
}

#[tracing::instrument(skip_all)]
pub async fn oauth_callback<StateDb: OAuthStateDb>(
    State(state): State<AuthServerState<StateDb>>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let config = &state.config;
    let issued = async {
        let (session, return_to) =
            complete_exchange(&state, &params, &headers, SystemTime::now()).await?;
        let encoded = config.session_codec.encode(&session)?;
        Ok::<_, AuthError>((encoded, return_to))
    }
    .await;

    match issued {
        Ok((encoded, return_to)) => {
            let [session, status] =
                session_cookies(encoded, config.session_ttl, config.secure_cookies);
            let [.., bridged] = clear_session_cookies();
            (
                set_cookies([session, status, bridged, clear_nonce_cookie()]),
                Redirect::to(&config.paths.bridge_location(&return_to)),
            )
                .into_response()
        }
        Err(err) => login_redirect(config, &err, None),
    }
}

/// The only place the raw credential is handed to page script.
#[tracing::instrument(skip_all)]
pub async fn current_credential<StateDb: OAuthStateDb>(
    State(state): State<AuthServerState<StateDb>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthError> {
    let session = current_session(&headers, &state.config.session_codec, SystemTime::now())?;
    Ok((
        [(CACHE_CONTROL, "no-store")],
        Json(BridgeProjection::new(&session, &state.config.application_id)),
    ))
}

#[tracing::instrument(skip_all)]
pub async fn logout<StateDb: OAuthStateDb>(
    State(state): State<AuthServerState<StateDb>>,
) -> Response {
    let mut cookies = clear_session_cookies().to_vec();
    cookies.push(clear_nonce_cookie());
    (
        set_cookies(cookies),
        Redirect::to(&state.config.paths.login_location(None, None)),
    )
        .into_response()
}

pub async fn login_page<StateDb: OAuthStateDb>(
    State(state): State<AuthServerState<StateDb>>,
    Query(params): Query<LoginPageParams>,
) -> Result<Html<String>, AuthError> {
    Ok(Html(pages::login_page(
        &state.config.paths,
        params.error.as_deref(),
        params.return_to.as_deref(),
    )?))
}

pub async fn bridge_page<StateDb: OAuthStateDb>(
    State(state): State<AuthServerState<StateDb>>,
    Query(params): Query<ReturnToParams>,
) -> Result<impl IntoResponse, AuthError> {
    let page = pages::bridge_page(
        &state.config.paths,
        &state.config.client_storage_key,
        params.return_to.as_deref(),
    )?;
    Ok(([(CACHE_CONTROL, "no-store")], Html(page)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cookies::{SESSION_COOKIE, SESSION_STATUS_COOKIE},
        data_model::{Identity, DEFAULT_OAUTH_STATE_TTL},
        oauth_state_db::MemoryStateDb,
        provider_client::{MockIdentityProvider, ProviderError, ProviderToken},
        server::router,
    };
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;

    fn test_state(provider: MockIdentityProvider) -> AuthServerState<MemoryStateDb> {
        AuthServerState::new(
            Arc::new(GatewayConfig::new_test()),
            MemoryStateDb::new(),
            Arc::new(provider),
        )
    }

    fn succeeding_provider() -> MockIdentityProvider {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_exchange_code()
            .times(1)
            .returning(|_| Ok(ProviderToken("gho_token".into())));
        provider.expect_fetch_identity().times(1).returning(|_| {
            Ok(Identity {
                subject: "octocat".into(),
            })
        });
        provider
    }

    fn silent_provider() -> MockIdentityProvider {
        let mut provider = MockIdentityProvider::new();
        provider.expect_exchange_code().times(0);
        provider.expect_fetch_identity().times(0);
        provider
    }

    async fn pending_state(state: &AuthServerState<MemoryStateDb>, created_at: SystemTime) -> String {
        let oauth_state = OAuthState::issue(
            DEFAULT_OAUTH_STATE_TTL,
            Some("/admin/posts".into()),
            created_at,
        );
        state.state_db.issue(&oauth_state).await.unwrap();
        oauth_state.nonce
    }

    async fn get(
        state: AuthServerState<MemoryStateDb>,
        uri: &str,
        cookie: Option<&str>,
    ) -> Response {
        let mut req = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        router(state)
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn location(resp: &Response) -> &str {
        resp.headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    fn set_cookie(resp: &Response, name: &str) -> Option<Cookie<'static>> {
        resp.headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| Cookie::parse(value.to_str().ok()?.to_string()).ok())
            .find(|cookie| cookie.name() == name)
    }

    #[tokio::test]
    async fn login_start_pins_nonce_and_redirects_to_provider() {
        let state = test_state(silent_provider());
        let resp = get(state.clone(), "/oauth/login?return_to=%2Fadmin%2Fposts", None).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);

        let nonce = set_cookie(&resp, OAUTH_NONCE_COOKIE).unwrap();
        assert_eq!(nonce.http_only(), Some(true));
        let authorize = reqwest::Url::parse(location(&resp)).unwrap();
        assert!(authorize
            .as_str()
            .starts_with("https://github.com/login/oauth/authorize?"));
        let state_param = authorize
            .query_pairs()
            .find(|(key, _)| key == "state")
            .map(|(_, value)| value.into_owned())
            .unwrap();
        assert_eq!(state_param, nonce.value());

        let stored = state.state_db.consume(nonce.value()).await.unwrap().unwrap();
        assert_eq!(stored.return_to.as_deref(), Some("/admin/posts"));
    }

    #[tokio::test]
    async fn callback_issues_session_and_redirects_to_bridge() {
        let state = test_state(succeeding_provider());
        let nonce = pending_state(&state, SystemTime::now()).await;
        let resp = get(
            state.clone(),
            &format!("/oauth/callback?code=abc&state={nonce}"),
            Some(&format!("oauth-nonce={nonce}")),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/admin-bridge?return_to=%2Fadmin%2Fposts");

        let session_cookie = set_cookie(&resp, SESSION_COOKIE).unwrap();
        assert_eq!(session_cookie.http_only(), Some(true));
        let session = state
            .config
            .session_codec
            .decode(session_cookie.value())
            .unwrap();
        assert_eq!(session.credential.as_str(), "gho_token");
        assert_eq!(session.subject, "octocat");

        let status = set_cookie(&resp, SESSION_STATUS_COOKIE).unwrap();
        assert_eq!(status.value(), "true");
        assert_ne!(status.http_only(), Some(true));
        assert_eq!(
            set_cookie(&resp, OAUTH_NONCE_COOKIE).unwrap().max_age(),
            Some(time::Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn oversized_session_lifetime_fails_without_panicking() {
        let mut config = GatewayConfig::new_test();
        config.session_ttl = Duration::from_secs(i64::MAX as u64);
        let state = AuthServerState::new(
            Arc::new(config),
            MemoryStateDb::new(),
            Arc::new(succeeding_provider()),
        );
        let nonce = pending_state(&state, SystemTime::now()).await;
        let resp = get(
            state,
            &format!("/oauth/callback?code=abc&state={nonce}"),
            Some(&format!("oauth-nonce={nonce}")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/login?error=internal_error");
        assert!(set_cookie(&resp, SESSION_COOKIE).is_none());
    }

    #[tokio::test]
    async fn callback_without_state_never_calls_provider() {
        let state = test_state(silent_provider());
        pending_state(&state, SystemTime::now()).await;
        let resp = get(state, "/oauth/callback?code=abc", None).await;
        assert_eq!(location(&resp), "/login?error=oauth_state_mismatch");
        assert!(set_cookie(&resp, SESSION_COOKIE).is_none());
    }

    #[tokio::test]
    async fn callback_with_foreign_nonce_cookie_is_rejected() {
        let state = test_state(silent_provider());
        let nonce = pending_state(&state, SystemTime::now()).await;
        let resp = get(
            state,
            &format!("/oauth/callback?code=abc&state={nonce}"),
            Some("oauth-nonce=someone-else"),
        )
        .await;
        assert_eq!(location(&resp), "/login?error=oauth_state_mismatch");
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_rejected() {
        let state = test_state(silent_provider());
        let resp = get(
            state,
            "/oauth/callback?code=abc&state=forged",
            Some("oauth-nonce=forged"),
        )
        .await;
        assert_eq!(location(&resp), "/login?error=oauth_state_mismatch");
    }

    #[tokio::test]
    async fn expired_state_is_rejected() {
        let state = test_state(silent_provider());
        let nonce = pending_state(&state, SystemTime::now() - Duration::from_secs(60 * 10)).await;
        let resp = get(
            state,
            &format!("/oauth/callback?code=abc&state={nonce}"),
            Some(&format!("oauth-nonce={nonce}")),
        )
        .await;
        assert_eq!(location(&resp), "/login?error=oauth_state_mismatch");
    }

    #[tokio::test]
    async fn replayed_callback_fails_after_first_use() {
        let state = test_state(succeeding_provider());
        let nonce = pending_state(&state, SystemTime::now()).await;
        let uri = format!("/oauth/callback?code=abc&state={nonce}");
        let cookie = format!("oauth-nonce={nonce}");

        let first = get(state.clone(), &uri, Some(&cookie)).await;
        assert!(location(&first).starts_with("/admin-bridge"));
        let second = get(state, &uri, Some(&cookie)).await;
        assert_eq!(location(&second), "/login?error=oauth_state_mismatch");
    }

    #[tokio::test]
    async fn missing_code_is_reported() {
        let state = test_state(silent_provider());
        let nonce = pending_state(&state, SystemTime::now()).await;
        let resp = get(
            state,
            &format!("/oauth/callback?state={nonce}"),
            Some(&format!("oauth-nonce={nonce}")),
        )
        .await;
        assert_eq!(location(&resp), "/login?error=code_missing");
    }

    #[tokio::test]
    async fn provider_error_param_skips_token_exchange() {
        let state = test_state(silent_provider());
        let nonce = pending_state(&state, SystemTime::now()).await;
        let resp = get(
            state,
            &format!("/oauth/callback?error=access_denied&state={nonce}"),
            Some(&format!("oauth-nonce={nonce}")),
        )
        .await;
        assert_eq!(location(&resp), "/login?error=token_exchange_failed");
    }

    #[tokio::test]
    async fn refused_exchange_does_not_leak_provider_response() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_exchange_code()
            .times(1)
            .returning(|_| Err(ProviderError::Refused("bad_verification_code".into())));
        provider.expect_fetch_identity().times(0);
        let state = test_state(provider);
        let nonce = pending_state(&state, SystemTime::now()).await;
        let resp = get(
            state,
            &format!("/oauth/callback?code=stale&state={nonce}"),
            Some(&format!("oauth-nonce={nonce}")),
        )
        .await;
        assert_eq!(location(&resp), "/login?error=token_exchange_failed");
        assert!(set_cookie(&resp, SESSION_COOKIE).is_none());
    }

    #[tokio::test]
    async fn identity_failure_is_reported() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_exchange_code()
            .times(1)
            .returning(|_| Ok(ProviderToken("gho_token".into())));
        provider
            .expect_fetch_identity()
            .times(1)
            .returning(|_| Err(ProviderError::MissingSubject));
        let state = test_state(provider);
        let nonce = pending_state(&state, SystemTime::now()).await;
        let resp = get(
            state,
            &format!("/oauth/callback?code=abc&state={nonce}"),
            Some(&format!("oauth-nonce={nonce}")),
        )
        .await;
        assert_eq!(location(&resp), "/login?error=identity_fetch_failed");
    }

    #[tokio::test]
    async fn concurrent_callbacks_consume_the_state_once() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_exchange_code()
            .times(1)
            .returning(|_| Ok(ProviderToken("gho_token".into())));
        provider.expect_fetch_identity().times(1).returning(|_| {
            Ok(Identity {
                subject: "octocat".into(),
            })
        });
        let state = test_state(provider);
        let nonce = pending_state(&state, SystemTime::now()).await;
        let params = CallbackParams {
            code: Some("abc".into()),
            state: Some(nonce.clone()),
            error: None,
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("oauth-nonce={nonce}").parse().unwrap(),
        );
        let now = SystemTime::now();
        let (first, second) = tokio::join!(
            complete_exchange(&state, &params, &headers, now),
            complete_exchange(&state, &params, &headers, now),
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(AuthError::CsrfMismatch))));
    }

    async fn session_cookie_for(state: &AuthServerState<MemoryStateDb>, issued_at: SystemTime) -> String {
        let session = Session::issue(
            Credential::new("gho_token"),
            "octocat",
            issued_at,
            state.config.session_ttl,
        )
        .unwrap();
        format!("session={}", state.config.session_codec.encode(&session).unwrap())
    }

    #[tokio::test]
    async fn current_credential_requires_a_session() {
        let state = test_state(silent_provider());
        let resp = get(state, "/auth/current-credential", None).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Unauthenticated");
    }

    #[tokio::test]
    async fn current_credential_refuses_expired_session() {
        let state = test_state(silent_provider());
        let cookie = session_cookie_for(
            &state,
            SystemTime::now() - state.config.session_ttl - Duration::from_secs(1),
        )
        .await;
        let resp = get(state, "/auth/current-credential", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn current_credential_returns_projection() {
        let state = test_state(silent_provider());
        let cookie = session_cookie_for(&state, SystemTime::now()).await;
        let resp = get(state, "/auth/current-credential", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CACHE_CONTROL).unwrap(), "no-store");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let projection: BridgeProjection = serde_json::from_slice(&body).unwrap();
        assert_eq!(projection.token, "gho_token");
        assert_eq!(projection.client_id, "client-1");
    }

    #[tokio::test]
    async fn logout_clears_every_gateway_cookie() {
        let state = test_state(silent_provider());
        let req = Request::builder()
            .method("POST")
            .uri("/auth/logout")
            .body(Body::empty())
            .unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(location(&resp), "/login");
        for name in [SESSION_COOKIE, SESSION_STATUS_COOKIE, OAUTH_NONCE_COOKIE] {
            assert_eq!(
                set_cookie(&resp, name).unwrap().max_age(),
                Some(time::Duration::ZERO),
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn entry_pages_render() {
        let state = test_state(silent_provider());
        let resp = get(state.clone(), "/login?error=session_expired", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("Your session has expired"));

        let resp = get(state, "/admin-bridge?return_to=%2Fadmin%2F", None).await;
        assert_eq!(resp.headers().get(CACHE_CONTROL).unwrap(), "no-store");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("data-storage-key=\"tinacms-auth\""));
    }
}
