//! Data model — dataclass-style aggregates
//!
//! Plain product types for every aggregate in `spec.md` §3. No inheritance,
//! no behavior beyond small constructors/predicates; persistence and business
//! rules live in `db`, `auth_code`, `authorization`, and `token_exchange`.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registered third-party client application.
///
/// Created by an out-of-scope admin flow; immutable after creation except
/// for `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of an [`Account`].
///
/// Transitions: `pending` (on creation/re-authorization) → `active` (on
/// successful token exchange) → `disabled` (soft destruction) or `failed`
/// (IDLE listener failure ceiling reached, §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Active,
    Disabled,
    Failed,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Provider connection context for an account (`spec.md` §3).
///
/// SMTP host/port are recorded but never dialed by the core — reserved for a
/// future submission component (Open Question in `spec.md` §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderContext {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
}

/// A mail mailbox tied to one application.
///
/// `id` is the bridge's internal primary key; `external_id` is the stable
/// opaque identifier returned to callers as the OAuth2 "grant id" once the
/// account becomes `active`.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub external_id: Uuid,
    pub application_id: Uuid,
    pub email: String,
    pub credential_blob: Vec<u8>,
    pub provider: ProviderContext,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decrypted IMAP credentials for a single trial or pooled login.
///
/// Never logged, never serialized — held only as long as a connection
/// attempt is in flight.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

/// Short-lived, single-use opaque string binding (application, account,
/// redirect_uri).
///
/// Invariant: valid iff `used_at.is_none() && now < expires_at` (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub application_id: Uuid,
    pub account_id: Uuid,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl AuthorizationCode {
    /// A code is valid iff unused and not yet expired.
    ///
    /// Exactly-at-`expires_at` is invalid (`now < expires_at`, strict), per
    /// `spec.md` §8's boundary behaviour.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && now < self.expires_at
    }
}

/// Persisted mapping from (account, folder) to (uidvalidity, last_seen_uid).
///
/// Monotonic within a fixed (account, folder, uidvalidity) tuple; a
/// UIDVALIDITY change resets `last_seen_uid` to zero (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UidTrackerEntry {
    pub account_id: Uuid,
    pub folder: String,
    pub uidvalidity: u32,
    pub last_seen_uid: u32,
}

/// Backoff bookkeeping for one account's IDLE listener (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealthRecord {
    pub account_id: Uuid,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for ConnectionHealthRecord {
    fn default() -> Self {
        Self {
            account_id: Uuid::nil(),
            last_success_at: None,
            last_failure_at: None,
            consecutive_failures: 0,
        }
    }
}

/// A single new-message observation handed from the IDLE Listener (C) to the
/// Event Emitter (E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub account_id: Uuid,
    pub folder: String,
    pub uidvalidity: u32,
    pub uid: u32,
    pub date: Option<String>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub flags: Vec<String>,
}
