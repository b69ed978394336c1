//! The two HTML entry points the browser passes through on its way into the admin SPA.
//!
//! Both pages are tera templates named `*.html`, so every interpolated value is HTML-escaped.
//! The bridge script takes its values from `data-` attributes and contains no interpolation.

use tera::{Context, Tera};

use super::config::{with_bridge_marker, with_query, GatePaths, RETURN_TO_PARAM};

pub static CURRENT_CREDENTIAL_PATH: &str = "/auth/current-credential";
pub static LOGIN_START_PATH: &str = "/oauth/login";

static LOGIN_TEMPLATE: &str = "login.html";
static BRIDGE_TEMPLATE: &str = "bridge.html";

lazy_static::lazy_static! {
    pub static ref TEMPLATES: Tera = {
        let mut tera = Tera::default();
        if let Err(err) = tera.add_raw_templates([
            (LOGIN_TEMPLATE, include_str!("../templates/login.html")),
            (BRIDGE_TEMPLATE, include_str!("../templates/bridge.html")),
        ]) {
            tracing::error!("parsing page templates: {err}");
            ::std::process::exit(1);
        }
        tera
    };
}

fn error_message(code: &str) -> &'static str {
    match code {
        "oauth_state_mismatch" => {
            "Your sign-in attempt expired or was started in another window. Please try again."
        }
        "code_missing" => "The identity provider did not return an authorization code.",
        "token_exchange_failed" => "Sign-in with the identity provider failed.",
        "identity_fetch_failed" => "Your account could not be read from the identity provider.",
        "session_expired" => "Your session has expired. Please sign in again.",
        "session_absent" => "Please sign in to continue.",
        _ => "Something went wrong. Please try again.",
    }
}

pub fn login_page(
    paths: &GatePaths,
    error: Option<&str>,
    return_to: Option<&str>,
) -> tera::Result<String> {
    let mut context = Context::new();
    context.insert(
        "sign_in",
        &with_query(
            LOGIN_START_PATH,
            &[(RETURN_TO_PARAM, paths.sanitize_return_to(return_to))],
        ),
    );
    // the code itself is never rendered
    context.insert("error", &error.map(error_message));
    TEMPLATES.render(LOGIN_TEMPLATE, &context)
}

/// Copies the session credential into the storage slot the SPA reads, then enters the SPA once.
pub fn bridge_page(
    paths: &GatePaths,
    storage_key: &str,
    return_to: Option<&str>,
) -> tera::Result<String> {
    let mut context = Context::new();
    context.insert("storage_key", storage_key);
    context.insert("endpoint", CURRENT_CREDENTIAL_PATH);
    context.insert(
        "target",
        &with_bridge_marker(&paths.sanitize_return_to(return_to)),
    );
    context.insert(
        "login",
        &paths.login_location(return_to, Some("session_expired")),
    );
    TEMPLATES.render(BRIDGE_TEMPLATE, &context)
}
