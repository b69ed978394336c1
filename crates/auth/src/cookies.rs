use cookie::{Cookie, SameSite};
use http::HeaderMap;
use std::time::{Duration, SystemTime};

use super::{
    data_model::{AuthError, Session},
    session_codec::SessionCodec,
};

/// HttpOnly, carries the signed session.
pub static SESSION_COOKIE: &str = "session";
/// Readable by page scripts, only says a session cookie was issued.
pub static SESSION_STATUS_COOKIE: &str = "session-status";
pub static OAUTH_NONCE_COOKIE: &str = "oauth-nonce";
/// Remembers which session already went through the bridge page.
pub static BRIDGED_COOKIE: &str = "session-bridged";

/// Cookies only the gateway reads. Never forwarded to the upstream api.
pub static GATEWAY_COOKIES: [&str; 4] = [
    SESSION_COOKIE,
    SESSION_STATUS_COOKIE,
    OAUTH_NONCE_COOKIE,
    BRIDGED_COOKIE,
];

fn max_age(ttl: Duration) -> time::Duration {
    time::Duration::seconds(ttl.as_secs().min(i64::MAX as u64) as i64)
}

fn removal(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, ""))
        .path("/")
        .max_age(time::Duration::ZERO)
        .build()
}

/// Last value of cookie `name` across every `cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let mut value = None;
    for cookie_header in headers.get_all(http::header::COOKIE) {
        if let Ok(cookie_str) = cookie_header.to_str() {
            for cookie in cookie_str.split(';') {
                if let Ok(parsed_cookie) = Cookie::parse(cookie.trim()) {
                    if parsed_cookie.name() == name {
                        value = Some(parsed_cookie.value().to_string());
                    }
                }
            }
        }
    }
    value
}

/// Drops `names` from a `cookie` header value. `None` when nothing is left.
pub fn strip_cookies(cookie_str: &str, names: &[&str]) -> Option<String> {
    let mut cookies_to_keep = Vec::new();
    for cookie in cookie_str.split(';') {
        let cookie = cookie.trim();
        if cookie.is_empty() {
            continue;
        }
        match Cookie::parse(cookie) {
            Ok(parsed_cookie) if names.contains(&parsed_cookie.name()) => {}
            _ => cookies_to_keep.push(cookie),
        }
    }
    (!cookies_to_keep.is_empty()).then(|| cookies_to_keep.join("; "))
}

pub fn session_cookies(encoded: String, ttl: Duration, secure: bool) -> [Cookie<'static>; 2] {
    let session = Cookie::build((SESSION_COOKIE, encoded))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(max_age(ttl))
        .build();
    let status = Cookie::build((SESSION_STATUS_COOKIE, "true"))
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(max_age(ttl))
        .build();
    [session, status]
}

pub fn clear_session_cookies() -> [Cookie<'static>; 3] {
    [
        removal(SESSION_COOKIE),
        removal(SESSION_STATUS_COOKIE),
        removal(BRIDGED_COOKIE),
    ]
}

pub fn nonce_cookie(nonce: &str, ttl: Duration, secure: bool) -> Cookie<'static> {
    Cookie::build((OAUTH_NONCE_COOKIE, nonce.to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(max_age(ttl))
        .build()
}

pub fn clear_nonce_cookie() -> Cookie<'static> {
    removal(OAUTH_NONCE_COOKIE)
}

pub fn bridged_cookie(session: &Session, ttl: Duration, secure: bool) -> Cookie<'static> {
    Cookie::build((BRIDGED_COOKIE, session.issued_at_secs().to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(max_age(ttl))
        .build()
}

/// True when the bridged marker cookie belongs to this particular session.
pub fn is_bridged(headers: &HeaderMap, session: &Session) -> bool {
    cookie_value(headers, BRIDGED_COOKIE)
        .is_some_and(|value| value == session.issued_at_secs().to_string())
}

/// The request's session, distinguishing "none or unreadable" from "expired".
pub fn current_session(
    headers: &HeaderMap,
    codec: &SessionCodec,
    now: SystemTime,
) -> Result<Session, AuthError> {
    let session = cookie_value(headers, SESSION_COOKIE)
        .and_then(|value| codec.decode(&value))
        .ok_or(AuthError::SessionAbsent)?;
    if !session.is_valid_at(now) {
        return Err(AuthError::SessionExpired);
    }
    Ok(session)
}
