//! OAuth2 authorization-code flow with PKCE against a GitLab instance.
//!
//! The flow is split in two halves: [`authorize_url`] produces the browser
//! URL for a fresh [`PkceChallenge`], and [`OAuthClient`] trades either the
//! returned code or a stored refresh token for a new token pair.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::client::{build_http_error, http_client_builder};
use crate::config::{normalize_host, GitlabConfig};
use crate::error::{GitlabError, Result};

pub const DEFAULT_SCOPE: &str = "read_api";
pub const DEFAULT_STATE: &str = "gitlab-tray";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost/gitlab-tray/callback";

/// Fixed OAuth application parameters shared by every login attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthSettings {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
}

impl OAuthSettings {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            state: DEFAULT_STATE.to_string(),
        }
    }

    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = uri.into();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }
}

/// Verifier/challenge pair for a single login attempt.
///
/// The challenge is always derived from the verifier it is stored with, so a
/// pair can never be mismatched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PkceChallenge {
    verifier: String,
    challenge: String,
}

impl PkceChallenge {
    /// Generates a fresh pair from 32 random bytes.
    pub fn generate() -> Self {
        let entropy: [u8; 32] = rand::random();
        Self::from_verifier(URL_SAFE_NO_PAD.encode(entropy))
    }

    pub fn from_verifier(verifier: impl Into<String>) -> Self {
        let verifier = verifier.into();
        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(digest);
        Self {
            verifier,
            challenge,
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

/// Builds the `GET /oauth/authorize` URL the user is sent to.
pub fn authorize_url(host: &str, settings: &OAuthSettings, pkce: &PkceChallenge) -> Result<Url> {
    let base = format!("{}/oauth/authorize", normalize_host(host));
    let mut url = Url::parse(&base).map_err(|err| GitlabError::InvalidUrl(err.to_string()))?;
    url.query_pairs_mut()
        .append_pair("client_id", &settings.client_id)
        .append_pair("redirect_uri", &settings.redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("state", &settings.state)
        .append_pair("scope", &settings.scope)
        .append_pair("code_challenge", pkce.challenge())
        .append_pair("code_challenge_method", "S256");
    Ok(url)
}

/// Extracts the authorization code from a redirect URL.
///
/// Anything after the code (`&state=...`, fragments) is discarded.
pub fn extract_code(redirect: &str) -> Option<String> {
    if let Ok(url) = Url::parse(redirect) {
        if let Some((_, code)) = url.query_pairs().find(|(key, _)| key == "code") {
            let code = code.trim().to_string();
            return (!code.is_empty()).then_some(code);
        }
        return None;
    }

    let (_, rest) = redirect.split_once("code=")?;
    let code = rest
        .split(['&', '#'])
        .next()
        .map(str::trim)
        .unwrap_or_default();
    (!code.is_empty()).then(|| code.to_string())
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenResponse {
    /// Returns the token pair only when both tokens are present and non-empty.
    pub fn into_pair(self) -> Option<TokenPair> {
        let access_token = self.access_token.filter(|value| !value.trim().is_empty())?;
        let refresh_token = self.refresh_token.filter(|value| !value.trim().is_empty())?;
        Some(TokenPair {
            access_token,
            refresh_token,
        })
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    grant_type: &'a str,
    redirect_uri: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_verifier: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

/// Talks to `POST /oauth/token` on one host.
#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    token_url: String,
    settings: OAuthSettings,
}

impl OAuthClient {
    /// `config.token` is ignored; only host, certificate and timeouts apply.
    pub fn new(config: &GitlabConfig, settings: OAuthSettings) -> Result<Self> {
        let http = http_client_builder(config)?
            .build()
            .map_err(|err| GitlabError::Other(err.to_string()))?;
        Ok(Self {
            http,
            token_url: format!("{}/oauth/token", config.host),
            settings,
        })
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenResponse> {
        debug!("exchanging authorization code");
        self.request_token(&TokenRequest {
            client_id: &self.settings.client_id,
            grant_type: "authorization_code",
            redirect_uri: &self.settings.redirect_uri,
            code: Some(code),
            code_verifier: Some(verifier),
            refresh_token: None,
        })
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        debug!("refreshing access token");
        self.request_token(&TokenRequest {
            client_id: &self.settings.client_id,
            grant_type: "refresh_token",
            redirect_uri: &self.settings.redirect_uri,
            code: None,
            code_verifier: None,
            refresh_token: Some(refresh_token),
        })
        .await
    }

    async fn request_token(&self, payload: &TokenRequest<'_>) -> Result<TokenResponse> {
        let response = self.http.post(&self.token_url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            response.json::<TokenResponse>().await.map_err(GitlabError::from)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(build_http_error(status, &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[test]
    fn challenge_is_sha256_of_verifier() {
        // RFC 7636 appendix B
        let pkce = PkceChallenge::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(pkce.challenge(), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn generated_pairs_are_unique_and_unpadded() {
        let first = PkceChallenge::generate();
        let second = PkceChallenge::generate();
        assert_ne!(first.verifier(), second.verifier());
        assert_eq!(first.verifier().len(), 43);
        assert!(!first.challenge().contains('='));
        assert_eq!(
            PkceChallenge::from_verifier(first.verifier()).challenge(),
            first.challenge()
        );
    }

    #[test]
    fn authorize_url_carries_every_parameter() {
        let settings = OAuthSettings::new("client-1");
        let pkce = PkceChallenge::from_verifier("Vxyz");
        let url = authorize_url("https://gitlab.example.com/", &settings, &pkce).unwrap();

        assert_eq!(url.path(), "/oauth/authorize");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let get = |name: &str| {
            pairs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(get("client_id").as_deref(), Some("client-1"));
        assert_eq!(get("redirect_uri").as_deref(), Some(DEFAULT_REDIRECT_URI));
        assert_eq!(get("response_type").as_deref(), Some("code"));
        assert_eq!(get("state").as_deref(), Some(DEFAULT_STATE));
        assert_eq!(get("scope").as_deref(), Some(DEFAULT_SCOPE));
        assert_eq!(get("code_challenge").as_deref(), Some(pkce.challenge()));
        assert_eq!(get("code_challenge_method").as_deref(), Some("S256"));
    }

    #[test]
    fn extract_code_drops_trailing_state() {
        assert_eq!(
            extract_code("http://localhost/gitlab-tray/callback?code=abc123&state=gitlab-tray").as_deref(),
            Some("abc123")
        );
        assert_eq!(extract_code("?code=abc123&state=x").as_deref(), Some("abc123"));
        assert_eq!(extract_code("http://localhost/callback?error=access_denied"), None);
        assert_eq!(extract_code("http://localhost/callback?code="), None);
    }

    #[test]
    fn token_pair_requires_both_tokens() {
        assert!(TokenResponse::default().into_pair().is_none());
        let partial = TokenResponse {
            access_token: Some("AT".into()),
            ..TokenResponse::default()
        };
        assert!(partial.into_pair().is_none());
    }

    #[tokio::test]
    async fn exchange_code_posts_verifier_as_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::PartialJson(json!({
                "client_id": "client-1",
                "code": "abc123",
                "grant_type": "authorization_code",
                "redirect_uri": DEFAULT_REDIRECT_URI,
                "code_verifier": "Vxyz",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"AT1","refresh_token":"RT1","token_type":"Bearer"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = OAuthClient::new(
            &GitlabConfig::new("", server.url()),
            OAuthSettings::new("client-1"),
        )
        .unwrap();
        let pair = client
            .exchange_code("abc123", "Vxyz")
            .await
            .unwrap()
            .into_pair()
            .unwrap();

        assert_eq!(pair.access_token, "AT1");
        assert_eq!(pair.refresh_token, "RT1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_refresh_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let client = OAuthClient::new(
            &GitlabConfig::new("", server.url()),
            OAuthSettings::new("client-1"),
        )
        .unwrap();
        let err = client.refresh("RTold").await.unwrap_err();
        assert!(matches!(err, GitlabError::Http { .. }));
    }
}
