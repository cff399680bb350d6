//! Google OAuth for the Gmail read-only scope: token file persistence,
//! refresh, and the browser authorization-code flow with PKCE.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use inbox_core::{AdapterError, MailAuthorizer};

use crate::pkce::{self, urlencoded};

pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
pub const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh this long before the recorded expiry.
const EXPIRY_BUFFER_MS: i64 = 60_000;
/// Pending authorizations older than this are discarded.
const PENDING_TTL: Duration = Duration::from_secs(600);

/// OAuth client registration, as downloaded from the Google console.
#[derive(Clone, Debug)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub auth_url: String,
    pub token_url: String,
}

#[derive(Deserialize)]
struct CredentialsFile {
    installed: Option<CredentialsEntry>,
    web: Option<CredentialsEntry>,
}

#[derive(Deserialize)]
struct CredentialsEntry {
    client_id: String,
    client_secret: Option<String>,
    auth_uri: Option<String>,
    token_uri: Option<String>,
}

impl ClientCredentials {
    pub fn load(path: &Path) -> Result<Self, AdapterError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AdapterError::Decode(format!("read {}: {e}", path.display())))?;
        let file: CredentialsFile = serde_json::from_str(&raw)
            .map_err(|e| AdapterError::Decode(format!("parse {}: {e}", path.display())))?;
        let entry = file
            .installed
            .or(file.web)
            .ok_or_else(|| AdapterError::Decode("credentials file has no installed or web client".into()))?;
        Ok(Self {
            client_id: entry.client_id,
            client_secret: entry.client_secret.map(SecretString::from),
            auth_url: entry.auth_uri.unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            token_url: entry.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
        })
    }
}

#[derive(Clone, Debug)]
pub struct GoogleAuthConfig {
    /// `None` when no client credentials file is available; stored tokens
    /// still work until they need a refresh.
    pub client: Option<ClientCredentials>,
    pub token_path: PathBuf,
    pub redirect_url: String,
    pub scopes: Vec<String>,
}

impl GoogleAuthConfig {
    /// Build from file paths. A missing credentials file is logged, not fatal.
    pub fn from_paths(credentials_path: &Path, token_path: PathBuf, redirect_url: String) -> Self {
        let client = match ClientCredentials::load(credentials_path) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(path = %credentials_path.display(), error = %e, "oauth client credentials unavailable");
                None
            }
        };
        Self {
            client,
            token_path,
            redirect_url,
            scopes: vec![GMAIL_READONLY_SCOPE.to_string()],
        }
    }
}

/// Persisted token. Also reads the `token`/`expiry` fields written by
/// Google's own client libraries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Epoch millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing)]
    expiry: Option<DateTime<Utc>>,
}

impl StoredToken {
    fn expires_at_ms(&self) -> Option<i64> {
        self.expires_at.or(self.expiry.map(|e| e.timestamp_millis()))
    }

    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        self.expires_at_ms()
            .is_some_and(|exp| exp - now_ms < EXPIRY_BUFFER_MS)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_stored(self, previous_refresh: Option<String>) -> StoredToken {
        StoredToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self
                .expires_in
                .map(|secs| Utc::now().timestamp_millis() + secs * 1000),
            expiry: None,
        }
    }
}

fn load_token(path: &Path) -> Option<StoredToken> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(token) => Some(token),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable token file");
            None
        }
    }
}

fn save_token(path: &Path, token: &StoredToken) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(token)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

struct PendingAuth {
    verifier: String,
    created: Instant,
}

/// Gmail credential holder. Tokens are loaded lazily from disk and
/// refreshed on demand; every change is written back.
pub struct GoogleAuth {
    config: GoogleAuthConfig,
    http: reqwest::Client,
    token: tokio::sync::Mutex<Option<StoredToken>>,
    pending: parking_lot::Mutex<HashMap<String, PendingAuth>>,
}

impl GoogleAuth {
    pub fn new(config: GoogleAuthConfig, http: reqwest::Client) -> Self {
        let token = load_token(&config.token_path);
        info!(
            token_path = %config.token_path.display(),
            has_token = token.is_some(),
            has_client = config.client.is_some(),
            "google auth initialized"
        );
        Self {
            config,
            http,
            token: tokio::sync::Mutex::new(token),
            pending: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// A valid access token, refreshing it first if it is about to expire.
    #[instrument(skip_all)]
    pub async fn access_token(&self) -> Result<SecretString, AdapterError> {
        let mut guard = self.token.lock().await;
        let Some(current) = guard.as_ref() else {
            return Err(AdapterError::AuthRequired);
        };
        if !current.needs_refresh(Utc::now().timestamp_millis()) {
            return Ok(SecretString::from(current.access_token.clone()));
        }

        let Some(refresh) = current.refresh_token.clone() else {
            debug!("token expired without refresh token");
            return Err(AdapterError::AuthRequired);
        };
        let refreshed = self.refresh(&refresh).await?;
        self.persist(&refreshed);
        let access = SecretString::from(refreshed.access_token.clone());
        *guard = Some(refreshed);
        Ok(access)
    }

    fn client(&self) -> Result<&ClientCredentials, AdapterError> {
        self.config
            .client
            .as_ref()
            .ok_or_else(|| AdapterError::Decode("oauth client credentials are not configured".into()))
    }

    fn persist(&self, token: &StoredToken) {
        if let Err(e) = save_token(&self.config.token_path, token) {
            warn!(path = %self.config.token_path.display(), error = %e, "failed to save token");
        }
    }

    async fn post_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AdapterError> {
        let client = self.client()?;
        let mut form = form.to_vec();
        form.push(("client_id", &client.client_id));
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.expose_secret()));
        }
        let resp = self
            .http
            .post(&client.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, "token endpoint rejected request");
            // invalid_grant and friends mean the user has to authorize again.
            return Err(if (400..500).contains(&status) {
                AdapterError::AuthRequired
            } else {
                AdapterError::Api { status, body }
            });
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::Decode(format!("token response: {e}")))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<StoredToken, AdapterError> {
        if self.config.client.is_none() {
            return Err(AdapterError::AuthRequired);
        }
        let resp = self
            .post_token(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await?;
        info!("access token refreshed");
        Ok(resp.into_stored(Some(refresh_token.to_string())))
    }

    fn prune_pending(pending: &mut HashMap<String, PendingAuth>) {
        pending.retain(|_, p| p.created.elapsed() < PENDING_TTL);
    }
}

#[async_trait]
impl MailAuthorizer for GoogleAuth {
    async fn is_authenticated(&self) -> bool {
        self.access_token().await.is_ok()
    }

    async fn authorization_url(&self) -> Result<String, AdapterError> {
        let client = self.client()?;
        let pair = pkce::generate_pkce();
        let state = pkce::generate_state();
        let url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256&access_type=offline&prompt=consent",
            client.auth_url,
            urlencoded(&client.client_id),
            urlencoded(&self.config.redirect_url),
            urlencoded(&self.config.scopes.join(" ")),
            state,
            pair.challenge,
        );
        let mut pending = self.pending.lock();
        Self::prune_pending(&mut pending);
        let _ = pending.insert(
            state,
            PendingAuth {
                verifier: pair.verifier,
                created: Instant::now(),
            },
        );
        Ok(url)
    }

    #[instrument(skip_all)]
    async fn complete(&self, state: &str, code: &str) -> Result<(), AdapterError> {
        let verifier = {
            let mut pending = self.pending.lock();
            Self::prune_pending(&mut pending);
            pending.remove(state).map(|p| p.verifier)
        };
        let Some(verifier) = verifier else {
            return Err(AdapterError::Api {
                status: 400,
                body: "unknown or expired authorization state".into(),
            });
        };

        let resp = self
            .post_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.config.redirect_url),
                ("code_verifier", &verifier),
            ])
            .await?;
        let mut guard = self.token.lock().await;
        let previous = guard.as_ref().and_then(|t| t.refresh_token.clone());
        let token = resp.into_stored(previous);
        self.persist(&token);
        *guard = Some(token);
        info!("gmail authorization completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(dir: &Path, token_url: Option<String>) -> GoogleAuthConfig {
        GoogleAuthConfig {
            client: token_url.map(|token_url| ClientCredentials {
                client_id: "cid".into(),
                client_secret: Some(SecretString::from("csecret")),
                auth_url: DEFAULT_AUTH_URL.into(),
                token_url,
            }),
            token_path: dir.join("token.json"),
            redirect_url: "http://localhost:8000/auth/callback".into(),
            scopes: vec![GMAIL_READONLY_SCOPE.into()],
        }
    }

    fn write_token(dir: &Path, json: serde_json::Value) {
        std::fs::write(dir.join("token.json"), json.to_string()).unwrap();
    }

    #[tokio::test]
    async fn missing_token_requires_auth() {
        let dir = tempfile::tempdir().unwrap();
        let auth = GoogleAuth::new(config(dir.path(), None), reqwest::Client::new());
        assert!(!auth.is_authenticated().await);
        assert_eq!(auth.access_token().await.unwrap_err(), AdapterError::AuthRequired);
    }

    #[tokio::test]
    async fn fresh_token_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let far = Utc::now().timestamp_millis() + 3_600_000;
        write_token(dir.path(), serde_json::json!({"access_token": "at", "expires_at": far}));
        let auth = GoogleAuth::new(config(dir.path(), None), reqwest::Client::new());
        assert_eq!(auth.access_token().await.unwrap().expose_secret(), "at");
    }

    #[tokio::test]
    async fn google_library_token_format_is_read() {
        let dir = tempfile::tempdir().unwrap();
        write_token(
            dir.path(),
            serde_json::json!({"token": "lib", "refresh_token": "r", "expiry": "2999-01-01T00:00:00.000000Z"}),
        );
        let auth = GoogleAuth::new(config(dir.path(), None), reqwest::Client::new());
        assert_eq!(auth.access_token().await.unwrap().expose_secret(), "lib");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_saved() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new", "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_token(
            dir.path(),
            serde_json::json!({"access_token": "old", "refresh_token": "r1", "expires_at": 1}),
        );
        let auth = GoogleAuth::new(
            config(dir.path(), Some(format!("{}/token", server.uri()))),
            reqwest::Client::new(),
        );
        assert_eq!(auth.access_token().await.unwrap().expose_secret(), "new");
        // Second call uses the cached refreshed token.
        assert_eq!(auth.access_token().await.unwrap().expose_secret(), "new");

        let saved = load_token(&dir.path().join("token.json")).unwrap();
        assert_eq!(saved.access_token, "new");
        assert_eq!(saved.refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn revoked_refresh_token_requires_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        write_token(
            dir.path(),
            serde_json::json!({"access_token": "old", "refresh_token": "r1", "expires_at": 1}),
        );
        let auth = GoogleAuth::new(
            config(dir.path(), Some(format!("{}/token", server.uri()))),
            reqwest::Client::new(),
        );
        assert_eq!(auth.access_token().await.unwrap_err(), AdapterError::AuthRequired);
    }

    #[tokio::test]
    async fn authorization_flow_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "granted", "refresh_token": "rt", "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let auth = GoogleAuth::new(
            config(dir.path(), Some(format!("{}/token", server.uri()))),
            reqwest::Client::new(),
        );
        let url = auth.authorization_url().await.unwrap();
        assert!(url.starts_with(DEFAULT_AUTH_URL));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("gmail.readonly"));
        let state = url
            .split('&')
            .find_map(|kv| kv.strip_prefix("state="))
            .unwrap()
            .to_string();

        assert!(auth.complete("wrong-state", "abc").await.is_err());
        auth.complete(&state, "abc").await.unwrap();
        assert!(auth.is_authenticated().await);
        // A state is single-use.
        assert!(auth.complete(&state, "abc").await.is_err());
        assert!(dir.path().join("token.json").exists());
    }

    #[tokio::test]
    async fn authorization_url_needs_client_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let auth = GoogleAuth::new(config(dir.path(), None), reqwest::Client::new());
        assert!(matches!(auth.authorization_url().await, Err(AdapterError::Decode(_))));
    }

    #[test]
    fn credentials_file_installed_client() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("credentials.json");
        std::fs::write(
            &p,
            r#"{"installed": {"client_id": "id1", "client_secret": "s", "token_uri": "https://t.example/token"}}"#,
        )
        .unwrap();
        let creds = ClientCredentials::load(&p).unwrap();
        assert_eq!(creds.client_id, "id1");
        assert_eq!(creds.token_url, "https://t.example/token");
        assert_eq!(creds.auth_url, DEFAULT_AUTH_URL);
    }
}
