use rand::RngCore;
use reqwest::Url;
use serde::Deserialize;
use std::{fmt, time::Duration};

use super::{
    data_model::{DEFAULT_OAUTH_STATE_TTL, DEFAULT_SESSION_TTL},
    session_codec::SessionCodec,
};

pub static DEFAULT_CONFIG_PATH: &str = "Gateway.toml";
pub static CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";
/// Query parameter the bridge page appends when it hands the browser back to protected content.
pub static BRIDGE_MARKER_PARAM: &str = "from_bridge";
pub static RETURN_TO_PARAM: &str = "return_to";

const MIN_SIGNING_KEY_LEN: usize = 32;
/// Upper bound for every configured lifetime and timeout.
pub const MAX_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("{field} is not a valid url: {message}")]
    InvalidUrl { field: &'static str, message: String },
    #[error("session signing key: {0}")]
    InvalidSigningKey(String),
    #[error("path layout: {0}")]
    InvalidPaths(String),
    #[error("{field} must be between 1 second and 365 days, got {secs} seconds")]
    InvalidTtl { field: &'static str, secs: u64 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStoreKind {
    #[default]
    Redis,
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatePaths {
    /// Everything at or below this path is admin SPA content.
    pub protected_prefix: String,
    pub login: String,
    pub bridge: String,
    pub proxy_prefix: String,
}

impl Default for GatePaths {
    fn default() -> Self {
        Self {
            protected_prefix: "/admin".into(),
            login: "/login".into(),
            bridge: "/admin-bridge".into(),
            proxy_prefix: "/proxy".into(),
        }
    }
}

/// True when `path` is `prefix` itself or a path segment below it, so `/admin` covers
/// `/admin/index.html` but not `/admin-login`.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl GatePaths {
    pub fn is_protected(&self, path: &str) -> bool {
        is_under(path, &self.protected_prefix)
    }
    pub fn is_login(&self, path: &str) -> bool {
        path == self.login
    }
    pub fn is_bridge(&self, path: &str) -> bool {
        path == self.bridge
    }
    pub fn is_proxy(&self, path: &str) -> bool {
        is_under(path, &self.proxy_prefix)
    }

    /// Where an authenticated navigation ends when nothing better is known.
    pub fn content_root(&self) -> String {
        format!("{}/", self.protected_prefix.trim_end_matches('/'))
    }

    /// Only same-origin paths under the protected prefix survive; everything else becomes the content root.
    pub fn sanitize_return_to(&self, return_to: Option<&str>) -> String {
        match return_to {
            Some(target)
                if target.starts_with('/')
                    && !target.starts_with("//")
                    && !target.contains('\\')
                    && !target.chars().any(char::is_control) =>
            {
                let path = target.split('?').next().unwrap_or_default();
                if self.is_protected(path) && !path.split('/').any(is_dot_segment) {
                    target.to_string()
                } else {
                    self.content_root()
                }
            }
            _ => self.content_root(),
        }
    }

    pub fn login_location(&self, return_to: Option<&str>, error: Option<&str>) -> String {
        let mut pairs = Vec::new();
        if let Some(error) = error {
            pairs.push(("error", error.to_string()));
        }
        if let Some(target) = return_to {
            pairs.push((RETURN_TO_PARAM, self.sanitize_return_to(Some(target))));
        }
        with_query(&self.login, &pairs)
    }

    pub fn bridge_location(&self, return_to: &str) -> String {
        with_query(
            &self.bridge,
            &[(RETURN_TO_PARAM, self.sanitize_return_to(Some(return_to)))],
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("protected_prefix", &self.protected_prefix),
            ("login", &self.login),
            ("bridge", &self.bridge),
            ("proxy_prefix", &self.proxy_prefix),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidPaths(format!(
                    "{name} must start with '/'"
                )));
            }
        }
        if self.is_protected(&self.login) || self.is_protected(&self.bridge) {
            return Err(ConfigError::InvalidPaths(
                "login and bridge must live outside the protected prefix".into(),
            ));
        }
        if self.protected_prefix.trim_end_matches('/').is_empty() {
            return Err(ConfigError::InvalidPaths(
                "protected_prefix cannot be the site root".into(),
            ));
        }
        Ok(())
    }
}

// Browsers resolve these before the request leaves, percent-encoded dots included.
fn is_dot_segment(segment: &str) -> bool {
    [".", "..", "%2e", ".%2e", "%2e.", "%2e%2e"]
        .iter()
        .any(|dots| segment.eq_ignore_ascii_case(dots))
}

/// Appends `pairs` form-encoded to a site-relative path.
pub fn with_query(path: &str, pairs: &[(&str, String)]) -> String {
    if pairs.is_empty() {
        return path.to_string();
    }
    // the host is never rendered, it only lets Url do the encoding
    let Ok(mut url) = Url::parse("http://gateway.invalid/") else {
        return path.to_string();
    };
    url.set_path(path);
    url.query_pairs_mut()
        .extend_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str())));
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Form-decoded value of `name` in a raw query string.
pub fn query_param(query: &str, name: &str) -> Option<String> {
    let mut url = Url::parse("http://gateway.invalid/").ok()?;
    url.set_query(Some(query));
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Adds the one-shot bridge marker to a site-relative target.
pub fn with_bridge_marker(target: &str) -> String {
    let separator = if target.contains('?') { '&' } else { '?' };
    format!("{target}{separator}{BRIDGE_MARKER_PARAM}=1")
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct OAuthDeserialize {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub identity_url: String,
    pub scope: String,
}

impl Default for OAuthDeserialize {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            authorize_url: "https://github.com/login/oauth/authorize".into(),
            token_url: "https://github.com/login/oauth/access_token".into(),
            identity_url: "https://api.github.com/user".into(),
            scope: "read:user user:email".into(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct GatewayConfigDeserialize {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_auth_server_addr")]
    pub auth_server_addr: String,
    /// serves the SPA bundle and the public site
    pub content_server_addr: String,
    pub public_base_url: String,
    pub upstream_api_base: String,
    /// identifier the SPA expects next to its token, e.g. the CMS client id
    pub application_id: String,
    #[serde(default = "default_client_storage_key")]
    pub client_storage_key: String,
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,
    #[serde(default)]
    pub oauth_state_ttl_secs: Option<u64>,
    #[serde(default)]
    pub provider_timeout_secs: Option<u64>,
    #[serde(default)]
    pub upstream_timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub secure_cookies: bool,
    /// hex encoded, at least 32 bytes
    #[serde(default)]
    pub session_signing_key: Option<String>,
    #[serde(default)]
    pub state_store: StateStoreKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub paths: GatePaths,
    #[serde(default)]
    pub oauth: OAuthDeserialize,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".into()
}
fn default_auth_server_addr() -> String {
    "127.0.0.1:3100".into()
}
fn default_client_storage_key() -> String {
    "tinacms-auth".into()
}
fn default_true() -> bool {
    true
}
fn default_redis_url() -> String {
    "redis://127.0.0.1/".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl GatewayConfigDeserialize {
    /// Secrets and deployment specific urls may come from the environment instead of the file.
    pub fn apply_env(&mut self) {
        let overrides: [(&str, &mut String); 5] = [
            ("OAUTH_CLIENT_ID", &mut self.oauth.client_id),
            ("OAUTH_CLIENT_SECRET", &mut self.oauth.client_secret),
            ("UPSTREAM_API_BASE", &mut self.upstream_api_base),
            ("PUBLIC_BASE_URL", &mut self.public_base_url),
            ("APPLICATION_ID", &mut self.application_id),
        ];
        for (var, field) in overrides {
            if let Ok(value) = std::env::var(var) {
                *field = value;
            }
        }
        if let Ok(key) = std::env::var("SESSION_SIGNING_KEY") {
            self.session_signing_key = Some(key);
        }
    }
}

/// Where the reverse proxy sends SPA api calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// path prefix of the api base, without a trailing slash
    pub base_path: String,
}

impl UpstreamTarget {
    fn from_url(url: &Url) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidUrl {
            field: "upstream_api_base",
            message: message.to_string(),
        };
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        Ok(Self {
            host: host.to_string(),
            port,
            tls,
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// Value for the `host` header sent upstream.
    pub fn host_header(&self) -> String {
        match (self.tls, self.port) {
            (true, 443) | (false, 80) => self.host.clone(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

#[derive(Clone)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: Url,
    pub token_url: Url,
    pub identity_url: Url,
    pub scope: String,
}

impl fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("client_id", &self.client_id)
            .field("authorize_url", &self.authorize_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("identity_url", &self.identity_url.as_str())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub auth_server_addr: String,
    pub content_server_addr: String,
    pub public_base_url: Url,
    pub upstream: UpstreamTarget,
    pub application_id: String,
    pub client_storage_key: String,
    pub session_ttl: Duration,
    pub oauth_state_ttl: Duration,
    pub provider_timeout: Duration,
    pub upstream_timeout: Duration,
    pub secure_cookies: bool,
    pub state_store: StateStoreKind,
    pub redis_url: String,
    pub log_level: String,
    pub paths: GatePaths,
    pub oauth: OAuthProviderConfig,
    pub session_codec: SessionCodec,
    /// set when no signing key was configured and one was generated for this process
    pub ephemeral_signing_key: bool,
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|err| ConfigError::InvalidUrl {
        field,
        message: err.to_string(),
    })
}

impl GatewayConfig {
    pub fn new(other: GatewayConfigDeserialize) -> Result<GatewayConfig, ConfigError> {
        other.paths.validate()?;
        let upstream_url = parse_url("upstream_api_base", &other.upstream_api_base)?;

        let (signing_key, ephemeral_signing_key) = match other.session_signing_key.as_deref() {
            Some(hex_key) => {
                let key = hex::decode(hex_key.trim())
                    .map_err(|err| ConfigError::InvalidSigningKey(err.to_string()))?;
                if key.len() < MIN_SIGNING_KEY_LEN {
                    return Err(ConfigError::InvalidSigningKey(format!(
                        "must be at least {MIN_SIGNING_KEY_LEN} bytes"
                    )));
                }
                (key, false)
            }
            None => {
                let mut key = vec![0u8; MIN_SIGNING_KEY_LEN];
                rand::rngs::OsRng.fill_bytes(&mut key);
                (key, true)
            }
        };

        let secs = |field: &'static str, value: Option<u64>, default: Duration| match value {
            None => Ok(default),
            Some(secs) if secs > 0 && secs <= MAX_TTL.as_secs() => Ok(Duration::from_secs(secs)),
            Some(secs) => Err(ConfigError::InvalidTtl { field, secs }),
        };

        Ok(GatewayConfig {
            listen_addr: other.listen_addr,
            auth_server_addr: other.auth_server_addr,
            content_server_addr: other.content_server_addr,
            public_base_url: parse_url("public_base_url", &other.public_base_url)?,
            upstream: UpstreamTarget::from_url(&upstream_url)?,
            application_id: other.application_id,
            client_storage_key: other.client_storage_key,
            session_ttl: secs("session_ttl_secs", other.session_ttl_secs, DEFAULT_SESSION_TTL)?,
            oauth_state_ttl: secs(
                "oauth_state_ttl_secs",
                other.oauth_state_ttl_secs,
                DEFAULT_OAUTH_STATE_TTL,
            )?,
            provider_timeout: secs(
                "provider_timeout_secs",
                other.provider_timeout_secs,
                Duration::from_secs(10),
            )?,
            upstream_timeout: secs(
                "upstream_timeout_secs",
                other.upstream_timeout_secs,
                Duration::from_secs(10),
            )?,
            secure_cookies: other.secure_cookies,
            state_store: other.state_store,
            redis_url: other.redis_url,
            log_level: other.log_level,
            paths: other.paths,
            oauth: OAuthProviderConfig {
                client_id: other.oauth.client_id,
                client_secret: other.oauth.client_secret,
                authorize_url: parse_url("oauth.authorize_url", &other.oauth.authorize_url)?,
                token_url: parse_url("oauth.token_url", &other.oauth.token_url)?,
                identity_url: parse_url("oauth.identity_url", &other.oauth.identity_url)?,
                scope: other.oauth.scope,
            },
            session_codec: SessionCodec::new(signing_key),
            ephemeral_signing_key,
        })
    }

    /// Parses a config file body without consulting the environment.
    pub fn from_toml_str(contents: &str) -> Result<GatewayConfig, ConfigError> {
        let raw: GatewayConfigDeserialize = toml::from_str(contents)?;
        Self::new(raw)
    }

    /// Reads `$GATEWAY_CONFIG` (or `Gateway.toml`) and applies environment overrides.
    pub fn load() -> Result<GatewayConfig, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mut raw: GatewayConfigDeserialize = toml::from_str(&contents)?;
        raw.apply_env();
        Self::new(raw)
    }

    pub fn callback_url(&self) -> String {
        let mut url = self.public_base_url.clone();
        url.set_path("/oauth/callback");
        url.set_query(None);
        url.to_string()
    }

    pub fn authorize_url(&self, nonce: &str) -> String {
        let mut url = self.oauth.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.oauth.client_id)
            .append_pair("redirect_uri", &self.callback_url())
            .append_pair("scope", &self.oauth.scope)
            .append_pair("state", nonce);
        url.to_string()
    }

    #[cfg(test)]
    pub fn new_test() -> Self {
        Self::from_toml_str(TEST_CONFIG).expect("test config to be valid")
    }
}

#[cfg(test)]
pub const TEST_CONFIG: &str = r#"
content_server_addr = "127.0.0.1:3000"
public_base_url = "https://cms.example.com"
upstream_api_base = "https://content.example.io"
application_id = "client-1"
secure_cookies = false
state_store = "memory"
session_signing_key = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"

[oauth]
client_id = "gh-client"
client_secret = "gh-secret"
"#;
