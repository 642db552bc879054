//! Authorization Code Store (`spec.md` §4.F)
//!
//! Issues, looks up, and atomically consumes short-lived authorization
//! codes binding `(application, account, redirect_uri)`. Single-use is
//! enforced at the database layer (`used_at IS NULL` in the `UPDATE ...
//! WHERE` clause), following `original_source/app/api/v3/connect.py`'s
//! `token_exchange` step ordering: look up, check validity, then consume.

use chrono::Utc;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::crypto::generate_authorization_code;
use crate::db::Db;
use crate::errors::{AppError, AppResult};
use crate::models::AuthorizationCode;

#[derive(Clone)]
pub struct AuthCodeStore {
    db: Db,
    ttl: std::time::Duration,
}

impl AuthCodeStore {
    pub fn new(db: Db, config: &ServerConfig) -> Self {
        Self {
            db,
            ttl: config.auth_code_ttl,
        }
    }

    /// Mint and persist a new code for `(application_id, account_id,
    /// redirect_uri)`. `scope` is stored verbatim and otherwise uninterpreted
    /// (`spec.md` §9 Open Question).
    pub async fn issue(
        &self,
        application_id: Uuid,
        account_id: Uuid,
        redirect_uri: &str,
        scope: Option<String>,
    ) -> AppResult<AuthorizationCode> {
        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(self.ttl)
                .map_err(|e| AppError::Internal(format!("invalid auth code ttl: {e}")))?;
        let code = AuthorizationCode {
            code: generate_authorization_code(),
            application_id,
            account_id,
            redirect_uri: redirect_uri.to_owned(),
            scope,
            issued_at,
            expires_at,
            used_at: None,
        };
        self.db.insert_authorization_code(&code).await?;
        Ok(code)
    }

    /// Look up a code without consuming it. Returns `InvalidGrant` if the
    /// code is unknown, used, or expired.
    pub async fn lookup_valid(&self, code: &str) -> AppResult<AuthorizationCode> {
        let found = self
            .db
            .find_authorization_code(code)
            .await?
            .ok_or_else(|| AppError::InvalidGrant("authorization code not found".to_owned()))?;
        if !found.is_valid_at(Utc::now()) {
            return Err(AppError::InvalidGrant(
                "authorization code is expired or already used".to_owned(),
            ));
        }
        Ok(found)
    }

    /// Atomically mark a code used. Returns `InvalidGrant` if another caller
    /// consumed it first — the race both `spec.md` §4.F and §8 call out.
    pub async fn consume(&self, code: &str) -> AppResult<()> {
        if self.db.consume_authorization_code(code).await? {
            Ok(())
        } else {
            Err(AppError::InvalidGrant(
                "authorization code was already used".to_owned(),
            ))
        }
    }
}
