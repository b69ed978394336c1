use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 7);
pub const DEFAULT_OAUTH_STATE_TTL: Duration = Duration::from_secs(60 * 5);

/// Opaque bearer value the upstream admin service accepts.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// never print the bearer value
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// A successful login with a bounded lifetime. Never mutated, only re-issued or dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub credential: Credential,
    pub issued_at: SystemTime,
    pub expires_at: SystemTime,
    /// Identity label reported by the external provider.
    pub subject: String,
}

impl Session {
    pub fn issue(
        credential: Credential,
        subject: impl Into<String>,
        issued_at: SystemTime,
        ttl: Duration,
    ) -> Result<Self, EncodingError> {
        Ok(Self {
            credential,
            issued_at,
            expires_at: issued_at
                .checked_add(ttl)
                .ok_or(EncodingError::ExpiryOutOfRange)?,
            subject: subject.into(),
        })
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now < self.expires_at && !self.credential.is_empty()
    }

    /// Seconds since the epoch the session was issued at, used to tie the bridge marker to one session.
    pub fn issued_at_secs(&self) -> u64 {
        self.issued_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    pub fn expires_at_millis(&self) -> u64 {
        self.expires_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Anti-forgery state for one login attempt. Consumed exactly once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub nonce: String,
    pub created_at: SystemTime,
    pub ttl: Duration,
    /// Protected path to land on once the session is bridged.
    pub return_to: Option<String>,
}

impl OAuthState {
    pub fn issue(ttl: Duration, return_to: Option<String>, now: SystemTime) -> Self {
        Self {
            nonce: Uuid::new_v4().simple().to_string(),
            created_at: now,
            ttl,
            return_to,
        }
    }

    pub fn is_live_at(&self, now: SystemTime) -> bool {
        self.created_at
            .checked_add(self.ttl)
            .is_some_and(|deadline| now < deadline)
    }
}

/// What the identity provider told us about the person logging in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

/// The client-storage shape the admin SPA reads its auth from.
/// Derived from a [`Session`], never authoritative.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeProjection {
    pub token: String,
    pub client_id: String,
    pub expires_at_in_ms: u64,
}

impl BridgeProjection {
    pub fn new(session: &Session, client_id: &str) -> Self {
        Self {
            token: session.credential.as_str().to_string(),
            client_id: client_id.to_string(),
            expires_at_in_ms: session.expires_at_millis(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("session credential is empty")]
    EmptyCredential,
    #[error("session expiry is out of range")]
    ExpiryOutOfRange,
    #[error("session serialization failed: {0}")]
    Serialize(#[from] bincode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("oauth state is missing, expired, already consumed or does not match")]
    CsrfMismatch,
    #[error("authorization code missing from callback")]
    MissingCode,
    #[error("token exchange with the identity provider failed")]
    UpstreamExchangeFailed,
    #[error("identity lookup with the identity provider failed")]
    IdentityFetchFailed,
    #[error("session expired")]
    SessionExpired,
    #[error("no session")]
    SessionAbsent,
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("oauth state store: {0}")]
    StateStore(String),
    #[error("rendering page: {0}")]
    Render(#[from] tera::Error),
}

impl AuthError {
    /// Stable code carried to the login page in the `error` query parameter.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CsrfMismatch => "oauth_state_mismatch",
            Self::MissingCode => "code_missing",
            Self::UpstreamExchangeFailed => "token_exchange_failed",
            Self::IdentityFetchFailed => "identity_fetch_failed",
            Self::SessionExpired => "session_expired",
            Self::SessionAbsent => "session_absent",
            Self::Encoding(_) | Self::StateStore(_) | Self::Render(_) => "internal_error",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::SessionExpired | Self::SessionAbsent => {
                (StatusCode::UNAUTHORIZED, "Unauthenticated").into_response()
            }
            // browser flows redirect to the login page before reaching this
            Self::CsrfMismatch
            | Self::MissingCode
            | Self::UpstreamExchangeFailed
            | Self::IdentityFetchFailed => {
                (StatusCode::BAD_REQUEST, self.error_code()).into_response()
            }
            Self::Encoding(_) | Self::StateStore(_) | Self::Render(_) => {
                tracing::error!(error = %self, "auth internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}
