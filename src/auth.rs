use gcp_auth::{CustomServiceAccount, TokenProvider};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::imagen_api::{ImagenError, Result};

pub const CREDENTIALS_ENV_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Source of OAuth bearer tokens for Vertex AI requests
#[derive(Clone)]
pub enum Credentials {
    /// Service account key file; gcp_auth caches and refreshes the tokens
    ServiceAccount(Arc<CustomServiceAccount>),
    /// Pre-minted token, e.g. from `gcloud auth print-access-token`
    AccessToken(String),
}

impl Credentials {
    /// Load a service account key and verify it by minting one token.
    pub async fn from_key_file<P: AsRef<Path>>(key_path: P) -> Result<Self> {
        let key_path = key_path.as_ref();
        if !key_path.exists() {
            return Err(ImagenError::Authentication(format!(
                "Service account key file not found: {}",
                key_path.display()
            )));
        }

        let account = CustomServiceAccount::from_file(key_path).map_err(|e| {
            ImagenError::Authentication(format!(
                "Failed to load service account key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        let credentials = Credentials::ServiceAccount(Arc::new(account));
        credentials.access_token().await?;
        info!("Google Cloud authentication successful");
        Ok(credentials)
    }

    /// Load the key file named by `GOOGLE_APPLICATION_CREDENTIALS`.
    pub async fn from_env() -> Result<Self> {
        let path = credentials_path_from(std::env::var_os(CREDENTIALS_ENV_VAR))?;
        debug!("Using credentials from {}: {}", CREDENTIALS_ENV_VAR, path.display());
        Self::from_key_file(path).await
    }

    pub fn from_access_token(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let token = token.trim();
        if token.is_empty() {
            return Err(ImagenError::Authentication(
                "Access token is empty".to_string(),
            ));
        }
        Ok(Credentials::AccessToken(token.to_string()))
    }

    /// Bearer token for the cloud-platform scope
    pub async fn access_token(&self) -> Result<String> {
        match self {
            Credentials::ServiceAccount(account) => {
                let token = account
                    .token(&[CLOUD_PLATFORM_SCOPE])
                    .await
                    .map_err(|e| {
                        ImagenError::Authentication(format!("Failed to obtain access token: {}", e))
                    })?;
                Ok(token.as_str().to_string())
            }
            Credentials::AccessToken(token) => Ok(token.clone()),
        }
    }
}

// Tokens never end up in logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ServiceAccount(_) => f.write_str("Credentials::ServiceAccount(..)"),
            Credentials::AccessToken(_) => f.write_str("Credentials::AccessToken(..)"),
        }
    }
}

fn credentials_path_from(value: Option<OsString>) -> Result<PathBuf> {
    match value {
        Some(v) if !v.is_empty() => Ok(PathBuf::from(v)),
        _ => Err(ImagenError::Authentication(format!(
            "{} environment variable is not set",
            CREDENTIALS_ENV_VAR
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_credentials_path_from_env_value() {
        let path = credentials_path_from(Some(OsString::from("/keys/sa.json"))).unwrap();
        assert_eq!(path, PathBuf::from("/keys/sa.json"));

        let err = credentials_path_from(None).unwrap_err();
        assert!(err.is_auth_error());

        let err = credentials_path_from(Some(OsString::new())).unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_missing_key_file_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Credentials::from_key_file(dir.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(err.is_auth_error());
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_malformed_key_file_is_auth_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not a service account").unwrap();

        let err = Credentials::from_key_file(file.path()).await.unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_static_access_token() {
        let creds = Credentials::from_access_token("  ya29.token\n").unwrap();
        assert_eq!(creds.access_token().await.unwrap(), "ya29.token");
        assert!(Credentials::from_access_token("   ").unwrap_err().is_auth_error());
    }

    #[test]
    fn test_debug_hides_token() {
        let creds = Credentials::from_access_token("secret-token").unwrap();
        assert!(!format!("{:?}", creds).contains("secret-token"));
    }
}
