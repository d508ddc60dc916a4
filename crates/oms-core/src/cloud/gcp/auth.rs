//! OAuth access tokens for the Google Cloud REST APIs.
//!
//! Credentials come from the file named by `GOOGLE_APPLICATION_CREDENTIALS`,
//! falling back to the gcloud application-default credentials file. Both
//! service-account keys (JWT bearer grant) and authorized-user files
//! (refresh-token grant) are supported.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cloud::{ProvisionError, ProvisionResult};

pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default)]
        private_key_id: Option<String>,
        #[serde(default)]
        token_uri: Option<String>,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

#[derive(Clone)]
enum Credentials {
    File(CredentialsFile),
    /// Pre-minted token, mostly useful against emulators
    Static(String),
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at - Duration::seconds(60) > Utc::now()
    }
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// Caching access-token provider.
pub struct TokenSource {
    credentials: Credentials,
    cached: Mutex<Option<AccessToken>>,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.credentials {
            Credentials::File(CredentialsFile::ServiceAccount { client_email, .. }) => {
                client_email.as_str()
            }
            Credentials::File(CredentialsFile::AuthorizedUser { .. }) => "authorized_user",
            Credentials::Static(_) => "static",
        };
        f.debug_struct("TokenSource").field("credentials", &kind).finish()
    }
}

impl TokenSource {
    /// Resolve credentials the way the gcloud SDK does.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = match std::env::var_os(CREDENTIALS_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => well_known_adc_path().with_context(|| {
                format!("{CREDENTIALS_ENV} is not set and no application-default credentials were found")
            })?,
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file: {}", path.display()))?;
        let file: CredentialsFile = serde_json::from_str(&content)
            .with_context(|| format!("Unsupported credentials file: {}", path.display()))?;
        Ok(Self {
            credentials: Credentials::File(file),
            cached: Mutex::new(None),
        })
    }

    pub fn from_static(token: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::Static(token.into()),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self, http: &reqwest::Client) -> ProvisionResult<String> {
        let file = match &self.credentials {
            Credentials::Static(token) => return Ok(token.clone()),
            Credentials::File(file) => file,
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.is_fresh()
        {
            return Ok(token.value.clone());
        }

        let response = match file {
            CredentialsFile::ServiceAccount {
                client_email,
                private_key,
                private_key_id,
                token_uri,
            } => {
                let token_uri = token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
                let assertion =
                    sign_assertion(client_email, private_key, private_key_id.clone(), token_uri)?;
                http.post(token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
                    .send()
                    .await
            }
            CredentialsFile::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            } => {
                http.post(DEFAULT_TOKEN_URI)
                    .form(&[
                        ("grant_type", "refresh_token"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("refresh_token", refresh_token.as_str()),
                    ])
                    .send()
                    .await
            }
        }
        .map_err(|e| ProvisionError::Unavailable(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Auth(format!(
                "token endpoint returned HTTP {status}: {body}"
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProvisionError::Auth(format!("malformed token response: {e}")))?;

        debug!(expires_in = token.expires_in, "obtained access token");
        let value = token.access_token.clone();
        *cached = Some(AccessToken {
            value: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        });
        Ok(value)
    }
}

fn sign_assertion(
    client_email: &str,
    private_key: &str,
    private_key_id: Option<String>,
    token_uri: &str,
) -> ProvisionResult<String> {
    let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
        .map_err(|e| ProvisionError::Auth(format!("invalid service account key: {e}")))?;
    let mut header = Header::new(Algorithm::RS256);
    header.kid = private_key_id;
    let iat = Utc::now().timestamp();
    let claims = JwtClaims {
        iss: client_email,
        scope: CLOUD_PLATFORM_SCOPE,
        aud: token_uri,
        iat,
        exp: iat + 3600,
    };
    jsonwebtoken::encode(&header, &claims, &key)
        .map_err(|e| ProvisionError::Auth(format!("failed to sign token request: {e}")))
}

fn well_known_adc_path() -> Option<PathBuf> {
    let path = dirs::home_dir()?
        .join(".config")
        .join("gcloud")
        .join("application_default_credentials.json");
    path.exists().then_some(path)
}
