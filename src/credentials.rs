//! Bearer-token acquisition for upstream calls.
//!
//! [`CredentialCache`] keeps one token for the whole process and refreshes it
//! under a lock, so concurrent requests that find it expired share a single
//! call to the identity provider.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Tokens are treated as stale well before the provider's one-hour lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(55 * 60);

/// Upper bound on one identity-provider round trip.
pub const DEFAULT_TOKEN_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const ASSERTION_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read credential file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid credential file {path}: {message}")]
    InvalidKey { path: PathBuf, message: String },

    #[error("unsupported credential type {0:?}")]
    Unsupported(String),

    #[error("failed to sign token assertion: {0}")]
    Signing(String),

    #[error("identity provider request failed: {0}")]
    Transport(String),

    #[error("identity provider returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Anything that can mint a fresh bearer token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn describe(&self) -> &'static str;

    async fn fetch(&self) -> Result<String, CredentialError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: Option<String>,
    expires_at: Instant,
}

impl CachedToken {
    fn empty() -> Self {
        Self {
            value: None,
            expires_at: Instant::now(),
        }
    }

    fn valid_value(&self, now: Instant) -> Option<&str> {
        self.value.as_deref().filter(|_| now < self.expires_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenStatus {
    pub source: String,
    pub has_token: bool,
    pub valid: bool,
    pub expires_in_secs: Option<u64>,
}

pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    ttl: Duration,
    fetch_timeout: Duration,
    cached: Mutex<CachedToken>,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn TokenSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            fetch_timeout: DEFAULT_TOKEN_FETCH_TIMEOUT,
            cached: Mutex::new(CachedToken::empty()),
        }
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Returns the cached token, refreshing it first if it is missing or stale.
    ///
    /// A failed or timed-out refresh leaves the cache as it was. The lock is
    /// held for at most `fetch_timeout` while refreshing.
    pub async fn get_token(&self) -> Result<String, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.valid_value(Instant::now()) {
            tracing::debug!(source = self.source.describe(), "reusing cached access token");
            return Ok(token.to_string());
        }

        tracing::debug!(source = self.source.describe(), "refreshing access token");
        let fetched = match tokio::time::timeout(self.fetch_timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(CredentialError::Transport(format!(
                "token refresh timed out after {:?}",
                self.fetch_timeout
            ))),
        };
        let token = fetched.map_err(|err| {
            tracing::error!(source = self.source.describe(), error = %err, "access token refresh failed");
            err
        })?;

        *cached = CachedToken {
            value: Some(token.clone()),
            expires_at: Instant::now() + self.ttl,
        };
        Ok(token)
    }

    pub async fn status(&self) -> TokenStatus {
        let cached = self.cached.lock().await;
        let now = Instant::now();
        let valid = cached.valid_value(now).is_some();
        TokenStatus {
            source: self.source.describe().to_string(),
            has_token: cached.value.is_some(),
            valid,
            expires_in_secs: valid.then(|| cached.expires_at.duration_since(now).as_secs()),
        }
    }
}

/// A fixed token, e.g. from `gcloud auth print-access-token`.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    fn describe(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self) -> Result<String, CredentialError> {
        Ok(self.token.clone())
    }
}

/// Fields of a Google credential JSON file; which ones are required depends on
/// `type`.
#[derive(Debug, Deserialize)]
struct CredentialFile {
    #[serde(rename = "type")]
    kind: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    client_email: Option<String>,
    private_key: Option<String>,
    private_key_id: Option<String>,
    token_uri: Option<String>,
}

impl CredentialFile {
    fn token_uri(&mut self) -> String {
        self.token_uri
            .take()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| GOOGLE_TOKEN_URI.to_string())
    }
}

fn invalid_key(path: &Path, message: impl Into<String>) -> CredentialError {
    CredentialError::InvalidKey {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn require(path: &Path, field: Option<String>, name: &str) -> Result<String, CredentialError> {
    field
        .filter(|v| !v.is_empty())
        .ok_or_else(|| invalid_key(path, format!("missing field {name}")))
}

/// Loads the credential file at `path` (as named by
/// `GOOGLE_APPLICATION_CREDENTIALS`) and picks the source for its `type`.
pub async fn from_credentials_file(
    path: &Path,
    client: Client,
) -> Result<Arc<dyn TokenSource>, CredentialError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    from_credentials_json(path, &raw, client)
}

fn from_credentials_json(
    path: &Path,
    raw: &[u8],
    client: Client,
) -> Result<Arc<dyn TokenSource>, CredentialError> {
    let file: CredentialFile =
        serde_json::from_slice(raw).map_err(|e| invalid_key(path, e.to_string()))?;

    match file.kind.as_str() {
        "service_account" => Ok(Arc::new(ServiceAccountTokenSource::from_file_fields(
            path, file, client,
        )?)),
        "authorized_user" => Ok(Arc::new(AuthorizedUserTokenSource::from_file_fields(
            path, file, client,
        )?)),
        _ => Err(CredentialError::Unsupported(file.kind)),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Signs an RS256 JWT with a service-account key and trades it for an access
/// token (the JWT-bearer grant).
pub struct ServiceAccountTokenSource {
    client: Client,
    token_uri: String,
    client_email: String,
    key_id: Option<String>,
    signing_key: EncodingKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

impl ServiceAccountTokenSource {
    fn from_file_fields(
        path: &Path,
        mut file: CredentialFile,
        client: Client,
    ) -> Result<Self, CredentialError> {
        let token_uri = file.token_uri();
        let client_email = require(path, file.client_email, "client_email")?;
        let private_key = require(path, file.private_key, "private_key")?;
        let signing_key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .map_err(|e| invalid_key(path, format!("private_key: {e}")))?;

        Ok(Self {
            client,
            token_uri,
            client_email,
            key_id: file.private_key_id.filter(|v| !v.is_empty()),
            signing_key,
        })
    }

    fn assertion(&self) -> Result<String, CredentialError> {
        let iat = jsonwebtoken::get_current_timestamp();
        let claims = AssertionClaims {
            iss: self.client_email.clone(),
            scope: CLOUD_PLATFORM_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|e| CredentialError::Signing(e.to_string()))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    fn describe(&self) -> &'static str {
        "service_account"
    }

    async fn fetch(&self) -> Result<String, CredentialError> {
        let assertion = self.assertion()?;
        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        let response = self
            .client
            .post(&self.token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;
        parse_token_response(response).await
    }
}

/// Exchanges an `authorized_user` refresh token (as written by
/// `gcloud auth application-default login`) for access tokens.
pub struct AuthorizedUserTokenSource {
    client: Client,
    token_uri: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

impl AuthorizedUserTokenSource {
    fn from_file_fields(
        path: &Path,
        mut file: CredentialFile,
        client: Client,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            client,
            token_uri: file.token_uri(),
            client_id: require(path, file.client_id, "client_id")?,
            client_secret: require(path, file.client_secret, "client_secret")?,
            refresh_token: require(path, file.refresh_token, "refresh_token")?,
        })
    }
}

#[async_trait]
impl TokenSource for AuthorizedUserTokenSource {
    fn describe(&self) -> &'static str {
        "authorized_user"
    }

    async fn fetch(&self) -> Result<String, CredentialError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
            ("scope", CLOUD_PLATFORM_SCOPE),
        ];
        let response = self
            .client
            .post(&self.token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;
        parse_token_response(response).await
    }
}

/// Asks the GCE/GKE metadata server for the attached service account's token.
pub struct MetadataServerTokenSource {
    client: Client,
    url: String,
}

impl MetadataServerTokenSource {
    pub fn new(client: Client) -> Self {
        Self::with_url(client, METADATA_TOKEN_URL)
    }

    pub fn with_url(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenSource for MetadataServerTokenSource {
    fn describe(&self) -> &'static str {
        "metadata_server"
    }

    async fn fetch(&self) -> Result<String, CredentialError> {
        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .query(&[("scopes", CLOUD_PLATFORM_SCOPE)])
            .send()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;
        parse_token_response(response).await
    }
}

async fn parse_token_response(response: reqwest::Response) -> Result<String, CredentialError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CredentialError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| CredentialError::Transport(e.to_string()))?;
    Ok(token.access_token)
}

/// Which token source to build at startup.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenSourceConfig {
    Static(String),
    /// A Google credential JSON file: `service_account` or `authorized_user`.
    CredentialsFile(PathBuf),
    MetadataServer,
}

impl fmt::Debug for TokenSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("Static(<redacted>)"),
            Self::CredentialsFile(path) => f.debug_tuple("CredentialsFile").field(path).finish(),
            Self::MetadataServer => f.write_str("MetadataServer"),
        }
    }
}

impl TokenSourceConfig {
    pub async fn build(&self, client: Client) -> Result<Arc<dyn TokenSource>, CredentialError> {
        Ok(match self {
            Self::Static(token) => Arc::new(StaticTokenSource::new(token.clone())),
            Self::CredentialsFile(path) => from_credentials_file(path, client).await?,
            Self::MetadataServer => Arc::new(MetadataServerTokenSource::new(client)),
        })
    }
}
