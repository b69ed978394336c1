use axum::{
    routing::{get, post},
    Router,
};
use std::error::Error;
use tokio::net::TcpListener;

use super::{handlers::*, oauth_state_db::OAuthStateDb, server_state::AuthServerState};

/// Every route the auth service answers. The edge proxy forwards `/oauth/*`, `/auth/*`
/// and the two entry pages here.
pub fn router<StateDb: OAuthStateDb>(state: AuthServerState<StateDb>) -> Router {
    let login = state.config.paths.login.clone();
    let bridge = state.config.paths.bridge.clone();
    Router::new()
        .route("/oauth/login", get(oauth_login::<StateDb>))
        .route("/oauth/callback", get(oauth_callback::<StateDb>))
        .route(
            "/auth/current-credential",
            get(current_credential::<StateDb>),
        )
        .route(
            "/auth/logout",
            post(logout::<StateDb>).get(logout::<StateDb>),
        )
        .route(&login, get(login_page::<StateDb>))
        .route(&bridge, get(bridge_page::<StateDb>))
        .with_state(state)
}

/// Runs the auth service on `auth_server_addr` until the listener fails.
#[tracing::instrument(skip_all, err)]
pub async fn server<StateDb: OAuthStateDb>(
    state: AuthServerState<StateDb>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = state.config.auth_server_addr.clone();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("auth service listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
