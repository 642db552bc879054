//! SQLite persistence
//!
//! A single connection pool fronting every aggregate in `spec.md` §3.
//! Queries are issued through `sqlx`'s runtime API (`sqlx::query`/`query_as`
//! with `.bind()`), not the `query!` compile-time macros, following the
//! pattern in `pavlealeksic-flowDesk`'s CLI (`SqlitePool::connect` plus plain
//! `sqlx::query_as("...")` strings) — there is no live database available at
//! build time to check macro-bound queries against.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::{
    Account, AccountStatus, Application, AuthorizationCode, ConnectionHealthRecord,
    ProviderContext, UidTrackerEntry,
};

/// Shared handle to the bridge's SQLite database.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(database_url: &str, min_pool: u32, max_pool: u32) -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(min_pool)
            .max_connections(max_pool.max(min_pool).max(1))
            .connect(database_url)
            .await
            .map_err(|e| AppError::Internal(format!("database connection failed: {e}")))?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Create every table if absent. There is no migration framework —
    /// `spec.md` §1 scopes persistence engine and schema evolution out.
    async fn migrate(&self) -> AppResult<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                application_id TEXT NOT NULL,
                email TEXT NOT NULL,
                credential_blob BLOB NOT NULL,
                imap_host TEXT NOT NULL,
                imap_port INTEGER NOT NULL,
                smtp_host TEXT NOT NULL,
                smtp_port INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS authorization_codes (
                code TEXT PRIMARY KEY,
                application_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                redirect_uri TEXT NOT NULL,
                scope TEXT,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                used_at TEXT
            )",
            "CREATE TABLE IF NOT EXISTS uid_tracker_entries (
                account_id TEXT NOT NULL,
                folder TEXT NOT NULL,
                uidvalidity INTEGER NOT NULL,
                last_seen_uid INTEGER NOT NULL,
                PRIMARY KEY (account_id, folder)
            )",
            "CREATE TABLE IF NOT EXISTS connection_health (
                account_id TEXT PRIMARY KEY,
                last_success_at TEXT,
                last_failure_at TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS webhook_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                folder TEXT NOT NULL,
                uidvalidity INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::Internal(format!("schema migration failed: {e}")))?;
        }
        Ok(())
    }

    // -- applications ----------------------------------------------------

    /// Register a new application. The admin flow that calls this is out of
    /// scope (`spec.md` §3), but the insert itself is ordinary persistence
    /// plumbing every deployment and every test-seeded scenario needs.
    pub async fn create_application(&self, name: &str) -> AppResult<Application> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query("INSERT INTO applications (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(id.to_string())
            .bind(name)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("application insert failed: {e}")))?;
        self.get_application(id).await
    }

    pub async fn get_application(&self, id: Uuid) -> AppResult<Application> {
        let row = sqlx::query("SELECT id, name, created_at, updated_at FROM applications WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("application lookup failed: {e}")))?
            .ok_or_else(|| AppError::InvalidClient(format!("unknown application '{id}'")))?;
        application_from_row(&row)
    }

    // -- accounts ----------------------------------------------------------

    /// Upsert an account by (application_id, email). Credentials are
    /// re-encrypted on every re-authorization.
    pub async fn upsert_account(
        &self,
        application_id: Uuid,
        email: &str,
        credential_blob: &[u8],
        provider: &ProviderContext,
    ) -> AppResult<Account> {
        let existing = sqlx::query(
            "SELECT id, external_id, application_id, email, credential_blob, imap_host, imap_port, smtp_host, smtp_port, status, created_at, updated_at
             FROM accounts WHERE application_id = ? AND email = ?",
        )
        .bind(application_id.to_string())
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("account lookup failed: {e}")))?;

        let now = Utc::now();
        if let Some(row) = existing {
            let id: String = row.try_get("id").map_err(row_err)?;
            sqlx::query(
                "UPDATE accounts SET credential_blob = ?, imap_host = ?, imap_port = ?, smtp_host = ?, smtp_port = ?, status = ?, updated_at = ? WHERE id = ?",
            )
            .bind(credential_blob)
            .bind(&provider.imap_host)
            .bind(provider.imap_port)
            .bind(&provider.smtp_host)
            .bind(provider.smtp_port)
            .bind(AccountStatus::Pending.as_str())
            .bind(now.to_rfc3339())
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("account update failed: {e}")))?;
            return self.get_account_by_id(Uuid::parse_str(&id).map_err(uuid_err)?).await;
        }

        let id = Uuid::new_v4();
        let external_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO accounts (id, external_id, application_id, email, credential_blob, imap_host, imap_port, smtp_host, smtp_port, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(external_id.to_string())
        .bind(application_id.to_string())
        .bind(email)
        .bind(credential_blob)
        .bind(&provider.imap_host)
        .bind(provider.imap_port)
        .bind(&provider.smtp_host)
        .bind(provider.smtp_port)
        .bind(AccountStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("account insert failed: {e}")))?;

        self.get_account_by_id(id).await
    }

    pub async fn get_account_by_id(&self, id: Uuid) -> AppResult<Account> {
        let row = sqlx::query(
            "SELECT id, external_id, application_id, email, credential_blob, imap_host, imap_port, smtp_host, smtp_port, status, created_at, updated_at
             FROM accounts WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("account lookup failed: {e}")))?
        .ok_or_else(|| AppError::NotFound(format!("unknown account '{id}'")))?;
        account_from_row(&row)
    }

    pub async fn set_account_status(&self, id: Uuid, status: AccountStatus) -> AppResult<()> {
        sqlx::query("UPDATE accounts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("account status update failed: {e}")))?;
        Ok(())
    }

    /// Every account the IDLE Listener supervisor should keep running
    /// (`active` and not yet `failed`/`disabled`), read once at startup.
    pub async fn list_active_accounts(&self) -> AppResult<Vec<Account>> {
        let rows = sqlx::query(
            "SELECT id, external_id, application_id, email, credential_blob, imap_host, imap_port, smtp_host, smtp_port, status, created_at, updated_at
             FROM accounts WHERE status = 'active'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("active account scan failed: {e}")))?;
        rows.iter().map(account_from_row).collect()
    }

    // -- authorization codes ------------------------------------------------

    pub async fn insert_authorization_code(&self, code: &AuthorizationCode) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO authorization_codes (code, application_id, account_id, redirect_uri, scope, issued_at, expires_at, used_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&code.code)
        .bind(code.application_id.to_string())
        .bind(code.account_id.to_string())
        .bind(&code.redirect_uri)
        .bind(&code.scope)
        .bind(code.issued_at.to_rfc3339())
        .bind(code.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("authorization code insert failed: {e}")))?;
        Ok(())
    }

    pub async fn find_authorization_code(&self, code: &str) -> AppResult<Option<AuthorizationCode>> {
        let row = sqlx::query(
            "SELECT code, application_id, account_id, redirect_uri, scope, issued_at, expires_at, used_at
             FROM authorization_codes WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("authorization code lookup failed: {e}")))?;
        row.as_ref().map(authorization_code_from_row).transpose()
    }

    /// Atomically mark a code used, only if it is still unused. Returns
    /// `true` iff this call is the one that consumed it (`spec.md` §4.F:
    /// single-use, race-safe).
    pub async fn consume_authorization_code(&self, code: &str) -> AppResult<bool> {
        let result = sqlx::query("UPDATE authorization_codes SET used_at = ? WHERE code = ? AND used_at IS NULL")
            .bind(Utc::now().to_rfc3339())
            .bind(code)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("authorization code consume failed: {e}")))?;
        Ok(result.rows_affected() == 1)
    }

    // -- uid tracker ---------------------------------------------------------

    pub async fn load_uid_tracker(&self, account_id: Uuid, folder: &str) -> AppResult<Option<UidTrackerEntry>> {
        let row = sqlx::query(
            "SELECT account_id, folder, uidvalidity, last_seen_uid FROM uid_tracker_entries WHERE account_id = ? AND folder = ?",
        )
        .bind(account_id.to_string())
        .bind(folder)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("uid tracker lookup failed: {e}")))?;
        row.as_ref().map(uid_tracker_from_row).transpose()
    }

    /// Compare-and-set advance: resets `last_seen_uid` to `new_uid` if
    /// `uidvalidity` matches the stored one or there is no stored row yet;
    /// if the stored `uidvalidity` differs, the folder was renumbered and the
    /// new row replaces the old one starting from `new_uid` (`spec.md` §4.D).
    pub async fn advance_uid_tracker(
        &self,
        account_id: Uuid,
        folder: &str,
        uidvalidity: u32,
        new_uid: u32,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO uid_tracker_entries (account_id, folder, uidvalidity, last_seen_uid)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (account_id, folder) DO UPDATE SET
                uidvalidity = excluded.uidvalidity,
                last_seen_uid = CASE
                    WHEN uid_tracker_entries.uidvalidity = excluded.uidvalidity
                     AND uid_tracker_entries.last_seen_uid > excluded.last_seen_uid
                    THEN uid_tracker_entries.last_seen_uid
                    ELSE excluded.last_seen_uid
                END",
        )
        .bind(account_id.to_string())
        .bind(folder)
        .bind(uidvalidity)
        .bind(new_uid)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("uid tracker advance failed: {e}")))?;
        Ok(())
    }

    // -- connection health -----------------------------------------------

    pub async fn load_connection_health(&self, account_id: Uuid) -> AppResult<ConnectionHealthRecord> {
        let row = sqlx::query(
            "SELECT account_id, last_success_at, last_failure_at, consecutive_failures FROM connection_health WHERE account_id = ?",
        )
        .bind(account_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("connection health lookup failed: {e}")))?;
        match row {
            Some(row) => connection_health_from_row(&row),
            None => Ok(ConnectionHealthRecord {
                account_id,
                ..ConnectionHealthRecord::default()
            }),
        }
    }

    pub async fn record_connection_success(&self, account_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO connection_health (account_id, last_success_at, last_failure_at, consecutive_failures)
             VALUES (?, ?, NULL, 0)
             ON CONFLICT (account_id) DO UPDATE SET last_success_at = excluded.last_success_at, consecutive_failures = 0",
        )
        .bind(account_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("connection health success update failed: {e}")))?;
        Ok(())
    }

    pub async fn record_connection_failure(&self, account_id: Uuid) -> AppResult<u32> {
        sqlx::query(
            "INSERT INTO connection_health (account_id, last_success_at, last_failure_at, consecutive_failures)
             VALUES (?, NULL, ?, 1)
             ON CONFLICT (account_id) DO UPDATE SET last_failure_at = excluded.last_failure_at, consecutive_failures = connection_health.consecutive_failures + 1",
        )
        .bind(account_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("connection health failure update failed: {e}")))?;
        let health = self.load_connection_health(account_id).await?;
        Ok(health.consecutive_failures)
    }

    // -- webhook log -----------------------------------------------------

    /// Durably record a delivered (or pending) webhook payload before the
    /// caller is allowed to advance the UID tracker (`spec.md` §4.E ordering
    /// guarantee).
    pub async fn append_webhook_log(
        &self,
        account_id: Uuid,
        folder: &str,
        uidvalidity: u32,
        uid: u32,
        payload: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO webhook_log (account_id, folder, uidvalidity, uid, payload, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(account_id.to_string())
        .bind(folder)
        .bind(uidvalidity)
        .bind(uid)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("webhook log append failed: {e}")))?;
        Ok(())
    }
}

fn row_err(e: sqlx::Error) -> AppError {
    AppError::Internal(format!("row decode failed: {e}"))
}

fn uuid_err(e: uuid::Error) -> AppError {
    AppError::Internal(format!("stored uuid is malformed: {e}"))
}

fn parse_timestamp(raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("stored timestamp is malformed: {e}")))
}

fn application_from_row(row: &SqliteRow) -> AppResult<Application> {
    Ok(Application {
        id: Uuid::parse_str(&row.try_get::<String, _>("id").map_err(row_err)?).map_err(uuid_err)?,
        name: row.try_get("name").map_err(row_err)?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at").map_err(row_err)?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at").map_err(row_err)?)?,
    })
}

fn account_from_row(row: &SqliteRow) -> AppResult<Account> {
    let status_str: String = row.try_get("status").map_err(row_err)?;
    let status = AccountStatus::parse(&status_str)
        .ok_or_else(|| AppError::Internal(format!("stored account status is invalid: '{status_str}'")))?;
    Ok(Account {
        id: Uuid::parse_str(&row.try_get::<String, _>("id").map_err(row_err)?).map_err(uuid_err)?,
        external_id: Uuid::parse_str(&row.try_get::<String, _>("external_id").map_err(row_err)?)
            .map_err(uuid_err)?,
        application_id: Uuid::parse_str(&row.try_get::<String, _>("application_id").map_err(row_err)?)
            .map_err(uuid_err)?,
        email: row.try_get("email").map_err(row_err)?,
        credential_blob: row.try_get("credential_blob").map_err(row_err)?,
        provider: ProviderContext {
            imap_host: row.try_get("imap_host").map_err(row_err)?,
            imap_port: row.try_get::<i64, _>("imap_port").map_err(row_err)? as u16,
            smtp_host: row.try_get("smtp_host").map_err(row_err)?,
            smtp_port: row.try_get::<i64, _>("smtp_port").map_err(row_err)? as u16,
        },
        status,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at").map_err(row_err)?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at").map_err(row_err)?)?,
    })
}

fn authorization_code_from_row(row: &SqliteRow) -> AppResult<AuthorizationCode> {
    let used_at: Option<String> = row.try_get("used_at").map_err(row_err)?;
    Ok(AuthorizationCode {
        code: row.try_get("code").map_err(row_err)?,
        application_id: Uuid::parse_str(&row.try_get::<String, _>("application_id").map_err(row_err)?)
            .map_err(uuid_err)?,
        account_id: Uuid::parse_str(&row.try_get::<String, _>("account_id").map_err(row_err)?)
            .map_err(uuid_err)?,
        redirect_uri: row.try_get("redirect_uri").map_err(row_err)?,
        scope: row.try_get("scope").map_err(row_err)?,
        issued_at: parse_timestamp(&row.try_get::<String, _>("issued_at").map_err(row_err)?)?,
        expires_at: parse_timestamp(&row.try_get::<String, _>("expires_at").map_err(row_err)?)?,
        used_at: used_at.map(|s| parse_timestamp(&s)).transpose()?,
    })
}

fn uid_tracker_from_row(row: &SqliteRow) -> AppResult<UidTrackerEntry> {
    Ok(UidTrackerEntry {
        account_id: Uuid::parse_str(&row.try_get::<String, _>("account_id").map_err(row_err)?)
            .map_err(uuid_err)?,
        folder: row.try_get("folder").map_err(row_err)?,
        uidvalidity: row.try_get::<i64, _>("uidvalidity").map_err(row_err)? as u32,
        last_seen_uid: row.try_get::<i64, _>("last_seen_uid").map_err(row_err)? as u32,
    })
}

fn connection_health_from_row(row: &SqliteRow) -> AppResult<ConnectionHealthRecord> {
    let last_success_at: Option<String> = row.try_get("last_success_at").map_err(row_err)?;
    let last_failure_at: Option<String> = row.try_get("last_failure_at").map_err(row_err)?;
    Ok(ConnectionHealthRecord {
        account_id: Uuid::parse_str(&row.try_get::<String, _>("account_id").map_err(row_err)?)
            .map_err(uuid_err)?,
        last_success_at: last_success_at.map(|s| parse_timestamp(&s)).transpose()?,
        last_failure_at: last_failure_at.map(|s| parse_timestamp(&s)).transpose()?,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures").map_err(row_err)? as u32,
    })
}
