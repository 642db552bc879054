//! Authorization Controller (`spec.md` §4.G)
//!
//! Drives the browser-facing half of the grant: validate the redirect URI,
//! trial the supplied IMAP credentials against the provider, persist the
//! account, and issue a one-time authorization code. Step ordering is
//! grounded on `original_source/app/api/v3/connect.py`'s `process_authorization`:
//! redirect_uri shape, then provider allow-list, then a live login attempt,
//! only then does anything get written.

use uuid::Uuid;

use crate::auth_code::AuthCodeStore;
use crate::config::ServerConfig;
use crate::crypto::CredentialCipher;
use crate::db::Db;
use crate::errors::{AppError, AppResult};
use crate::imap;
use crate::models::{AuthorizationCode, Credentials, ProviderContext};

pub struct AuthorizationController {
    db: Db,
    config: ServerConfig,
    cipher: CredentialCipher,
    codes: AuthCodeStore,
}

/// Everything the browser form on `GET /auth` submits to `POST /process`.
pub struct AuthorizationRequest {
    pub application_id: Uuid,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub email: String,
    pub username: String,
    pub password: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
}

impl AuthorizationController {
    pub fn new(db: Db, config: ServerConfig, cipher: CredentialCipher, codes: AuthCodeStore) -> Self {
        Self {
            db,
            config,
            cipher,
            codes,
        }
    }

    /// Validate a redirect URI's shape: parseable, scheme `http` or `https`,
    /// non-empty host. Mirrors `_validate_redirect_uri` in `original_source`.
    pub fn validate_redirect_uri(redirect_uri: &str) -> AppResult<()> {
        let parsed = url::Url::parse(redirect_uri)
            .map_err(|e| AppError::InvalidRequest(format!("malformed redirect_uri: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(AppError::InvalidRequest(
                "redirect_uri must use http or https".to_owned(),
            ));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(AppError::InvalidRequest(
                "redirect_uri must include a non-empty host".to_owned(),
            ));
        }
        Ok(())
    }

    /// Handle a submitted authorization form.
    ///
    /// Order: validate the application exists, validate the redirect URI,
    /// check the IMAP host is allow-listed, trial-login against the
    /// provider, then (only on success) persist the account and mint a code.
    pub async fn process_authorization(&self, request: AuthorizationRequest) -> AppResult<AuthorizationCode> {
        self.db.get_application(request.application_id).await?;
        Self::validate_redirect_uri(&request.redirect_uri)?;

        if !self.config.is_allowed_provider(&request.imap_host) {
            return Err(AppError::UpstreamUnavailable(format!(
                "IMAP provider '{}' is not allow-listed",
                request.imap_host
            )));
        }

        let credentials = Credentials {
            username: request.username.clone(),
            password: secrecy::SecretString::new(request.password.clone().into()),
        };

        let session = imap::connect_authenticated(
            &request.imap_host,
            request.imap_port,
            &credentials,
            self.config.imap_timeout,
        )
        .await?;
        imap::logout(session, self.config.imap_timeout).await;

        let provider = ProviderContext {
            imap_host: request.imap_host,
            imap_port: request.imap_port,
            smtp_host: request.smtp_host,
            smtp_port: request.smtp_port,
        };
        let blob = self.cipher.encrypt(&credentials)?;
        let account = self
            .db
            .upsert_account(request.application_id, &request.email, &blob, &provider)
            .await?;

        self.codes
            .issue(
                request.application_id,
                account.id,
                &request.redirect_uri,
                request.scope,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_https_redirect_with_host() {
        assert!(AuthorizationController::validate_redirect_uri("https://client.example/cb").is_ok());
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(AuthorizationController::validate_redirect_uri("ftp://client.example/cb").is_err());
    }

    #[test]
    fn rejects_missing_host() {
        assert!(AuthorizationController::validate_redirect_uri("file:///etc/passwd").is_err());
    }

    #[test]
    fn rejects_unparseable_uri() {
        assert!(AuthorizationController::validate_redirect_uri("not a uri").is_err());
    }
}
