use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

use super::{config::GatewayConfig, data_model::Identity};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}")]
    Status { status: StatusCode },
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_path_to_error::Error<serde_json::Error>),
    #[error("provider refused the code: {0}")]
    Refused(String),
    #[error("response carried no access token")]
    MissingToken,
    #[error("identity response carried no subject")]
    MissingSubject,
}

/// Access token handed out by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderToken(pub String);

impl fmt::Debug for ProviderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderToken(..)")
    }
}

#[mockall::automock]
#[async_trait]
pub trait IdentityProvider: fmt::Debug + Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, ProviderError>;
    async fn fetch_identity(&self, token: &ProviderToken) -> Result<Identity, ProviderError>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
}

// GitHub answers refused codes with 200 and an `error` field.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct IdentityResponse {
    login: Option<String>,
    sub: Option<String>,
    id: Option<serde_json::Value>,
}

impl IdentityResponse {
    fn subject(self) -> Option<String> {
        self.login
            .or(self.sub)
            .or_else(|| match self.id? {
                serde_json::Value::String(id) => Some(id),
                serde_json::Value::Number(id) => Some(id.to_string()),
                _ => None,
            })
            .filter(|subject| !subject.is_empty())
    }
}

/// OAuth 2 authorization-code client for a GitHub-style provider.
#[derive(Clone, Debug)]
pub struct OAuthHttpProvider {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: reqwest::Url,
    identity_url: reqwest::Url,
    redirect_uri: String,
}

impl OAuthHttpProvider {
    pub fn new(config: &GatewayConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.provider_timeout)
            .user_agent("Slipper-Gate")
            .build()?;
        Ok(Self {
            client,
            client_id: config.oauth.client_id.clone(),
            client_secret: config.oauth.client_secret.clone(),
            token_url: config.oauth.token_url.clone(),
            identity_url: config.oauth.identity_url.clone(),
            redirect_uri: config.callback_url(),
        })
    }
}

async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ProviderError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(ProviderError::Status { status });
    }
    let body = resp.bytes().await?;
    let deserializer = &mut serde_json::Deserializer::from_slice(&body);
    Ok(serde_path_to_error::deserialize(deserializer)?)
}

#[async_trait]
impl IdentityProvider for OAuthHttpProvider {
    #[tracing::instrument(skip_all, err)]
    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, ProviderError> {
        let resp = self
            .client
            .post(self.token_url.clone())
            .header(header::ACCEPT, "application/json")
            .json(&TokenRequest {
                client_id: &self.client_id,
                client_secret: &self.client_secret,
                code,
                redirect_uri: &self.redirect_uri,
            })
            .send()
            .await?;
        let token: TokenResponse = parse_json(resp).await?;
        if let Some(error) = token.error {
            return Err(ProviderError::Refused(error));
        }
        token
            .access_token
            .filter(|token| !token.is_empty())
            .map(ProviderToken)
            .ok_or(ProviderError::MissingToken)
    }

    #[tracing::instrument(skip_all, err)]
    async fn fetch_identity(&self, token: &ProviderToken) -> Result<Identity, ProviderError> {
        let resp = self
            .client
            .get(self.identity_url.clone())
            .header(header::ACCEPT, "application/json")
            .bearer_auth(&token.0)
            .send()
            .await?;
        let identity: IdentityResponse = parse_json(resp).await?;
        identity
            .subject()
            .map(|subject| Identity { subject })
            .ok_or(ProviderError::MissingSubject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(json: serde_json::Value) -> Option<String> {
        serde_json::from_value::<IdentityResponse>(json).unwrap().subject()
    }

    #[test]
    fn subject_prefers_login_then_sub_then_id() {
        assert_eq!(
            identity(serde_json::json!({"login": "octocat", "id": 1})),
            Some("octocat".into())
        );
        assert_eq!(identity(serde_json::json!({"sub": "abc"})), Some("abc".into()));
        assert_eq!(identity(serde_json::json!({"id": 583231})), Some("583231".into()));
        assert_eq!(identity(serde_json::json!({"login": ""})), None);
        assert_eq!(identity(serde_json::json!({})), None);
    }

    #[test]
    fn refused_token_response_parses() {
        let resp: TokenResponse = serde_json::from_value(serde_json::json!({
            "error": "bad_verification_code",
            "error_description": "The code passed is incorrect or expired."
        }))
        .unwrap();
        assert_eq!(resp.error.as_deref(), Some("bad_verification_code"));
        assert!(resp.access_token.is_none());
    }

    #[test]
    fn provider_token_debug_is_redacted() {
        assert_eq!(format!("{:?}", ProviderToken("gho_x".into())), "ProviderToken(..)");
    }

    #[tokio::test]
    async fn unreachable_provider_is_an_http_error() {
        let mut config = GatewayConfig::new_test();
        config.oauth.token_url = reqwest::Url::parse("http://127.0.0.1:9/token").unwrap();
        let provider = OAuthHttpProvider::new(&config).unwrap();
        assert!(matches!(
            provider.exchange_code("code").await,
            Err(ProviderError::Http(_))
        ));
    }
}
