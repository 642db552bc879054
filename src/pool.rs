//! Connection Pool (`spec.md` §4.B)
//!
//! One bucket of sessions per provider host. Grounded directly on
//! `original_source/app/controllers/imap/connection.py::ConnectionManager`:
//! a per-provider list of connection records, a semaphore capping concurrent
//! sessions per provider, a [`crate::rate_limiter::RateLimiter`] gating new
//! acquisitions, and NOOP-based liveness checks with one retry before giving
//! up and dialing fresh. The record-stays-in-the-list-while-checked-out
//! shape (so stats count in-use sessions too) follows the
//! `HashMap`-of-sessions layout in `GraphicMeat-mail-vault-app`'s IMAP pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{DEFAULT_PROVIDER_CAP, LIVENESS_PROBE_TIMEOUT, ServerConfig};
use crate::errors::{AppError, AppResult};
use crate::imap::{self, ImapIdle, ImapSession};
use crate::models::Credentials;
use crate::rate_limiter::RateLimiter;

/// A session, either ready for commands or currently in IDLE.
enum SessionHolder {
    Active(ImapSession),
    Idling(ImapIdle),
}

/// Bookkeeping for one live connection. `slot` is `None` exactly while the
/// connection is checked out to a caller (held inside a [`PooledConnection`]).
struct PoolEntry {
    id: Uuid,
    account_id: Uuid,
    last_used: Instant,
    is_idle: bool,
    selected_folder: Option<String>,
    slot: Option<SessionHolder>,
}

struct ProviderBucket {
    entries: Vec<PoolEntry>,
    semaphore: Arc<Semaphore>,
    limiter: Arc<RateLimiter>,
}

/// Per-provider connection counts, returned by [`ConnectionPool::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
}

/// Managed pool of authenticated IMAP sessions, bucketed by provider host.
pub struct ConnectionPool {
    buckets: Mutex<HashMap<String, ProviderBucket>>,
    provider_cap: usize,
    imap_timeout: std::time::Duration,
}

/// A session checked out of the pool. Must be returned via [`ConnectionPool::release`]
/// or [`ConnectionPool::close`] — there is no `Drop`-based auto-return, matching
/// the explicit release/close contract in `spec.md` §4.B.
pub struct PooledConnection {
    entry_id: Uuid,
    provider_host: String,
    account_id: Uuid,
    session: Option<SessionHolder>,
}

impl PooledConnection {
    /// Borrow the live session. Returns `Internal` if the connection is
    /// currently idling (callers must `stop_idle` first).
    pub fn session_mut(&mut self) -> AppResult<&mut ImapSession> {
        match &mut self.session {
            Some(SessionHolder::Active(session)) => Ok(session),
            Some(SessionHolder::Idling(_)) => Err(AppError::Internal(
                "cannot issue commands while a connection is idling".to_owned(),
            )),
            None => Err(AppError::Internal("connection has no session".to_owned())),
        }
    }
}

impl ConnectionPool {
    pub fn new(config: &ServerConfig) -> Self {
        let mut buckets = HashMap::new();
        for host in &config.allowed_imap_hosts {
            buckets.insert(
                host.clone(),
                ProviderBucket {
                    entries: Vec::new(),
                    semaphore: Arc::new(Semaphore::new(
                        config.worker_max_connections_per_provider.max(1),
                    )),
                    limiter: Arc::new(RateLimiter::new(10.0, None)),
                },
            );
        }
        Self {
            buckets: Mutex::new(buckets),
            provider_cap: config.worker_max_connections_per_provider.max(DEFAULT_PROVIDER_CAP),
            imap_timeout: config.imap_timeout,
        }
    }

    /// Acquire a connection for `account_id` against `provider_host`,
    /// reusing an idle, live session when one exists, otherwise dialing a
    /// fresh one. Blocks on the provider's rate limiter and semaphore.
    ///
    /// `folder`, when given, restricts reuse to entries that already have
    /// that folder selected — an entry selected on a different folder is
    /// not a match (`spec.md` §4.B step 2); the caller still issues its own
    /// `SELECT` after acquiring either way, so no mismatch can persist.
    pub async fn get_connection(
        &self,
        provider_host: &str,
        port: u16,
        account_id: Uuid,
        credentials: &Credentials,
        folder: Option<&str>,
    ) -> AppResult<PooledConnection> {
        // Bucket keys are lowercased when the allow-list is loaded
        // (`config.rs`); normalize here too so a mixed-case `imap_host` on
        // the account (preserved verbatim from the `/process` form) still
        // finds its bucket.
        let provider_host = provider_host.to_ascii_lowercase();
        let provider_host = provider_host.as_str();

        let (semaphore, limiter) = {
            let buckets = self.buckets.lock().await;
            let bucket = buckets.get(provider_host).ok_or_else(|| {
                AppError::UpstreamUnavailable(format!("provider '{provider_host}' is not allow-listed"))
            })?;
            (Arc::clone(&bucket.semaphore), Arc::clone(&bucket.limiter))
        };

        limiter.acquire(1.0).await;

        // `spec.md` §4.B failure semantics: a dead entry is evicted silently
        // and the scan retries up to one more time before dialing fresh.
        for _ in 0..2 {
            match self.try_reuse(provider_host, account_id, folder).await? {
                Some(mut conn) if self.probe_alive(&mut conn).await => return Ok(conn),
                Some(_) => continue,
                None => break,
            }
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal("provider semaphore closed".to_owned()))?;
        let session = imap::connect_authenticated(provider_host, port, credentials, self.imap_timeout).await?;
        drop(permit);

        let entry_id = Uuid::new_v4();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .get_mut(provider_host)
            .ok_or_else(|| AppError::UpstreamUnavailable(format!("provider '{provider_host}' disappeared")))?;
        if bucket.entries.len() >= self.provider_cap {
            return Err(AppError::UpstreamUnavailable(format!(
                "provider '{provider_host}' is at its connection cap"
            )));
        }
        bucket.entries.push(PoolEntry {
            id: entry_id,
            account_id,
            last_used: Instant::now(),
            is_idle: false,
            selected_folder: None,
            slot: None,
        });

        Ok(PooledConnection {
            entry_id,
            provider_host: provider_host.to_owned(),
            account_id,
            session: Some(SessionHolder::Active(session)),
        })
    }

    /// Take a reusable, non-idling entry for this account out of the bucket,
    /// if one is sitting idle-in-the-pool (not to be confused with IMAP
    /// IDLE — this is "available for checkout"). `folder` narrows the scan to
    /// entries with no folder selected yet or already selected on `folder`
    /// (`spec.md` §4.B step 2); a caller not naming a folder accepts any.
    async fn try_reuse(
        &self,
        provider_host: &str,
        account_id: Uuid,
        folder: Option<&str>,
    ) -> AppResult<Option<PooledConnection>> {
        let mut buckets = self.buckets.lock().await;
        let bucket = match buckets.get_mut(provider_host) {
            Some(b) => b,
            None => return Ok(None),
        };
        let index = bucket.entries.iter().position(|e| {
            e.account_id == account_id
                && !e.is_idle
                && e.slot.is_some()
                && (folder.is_none() || e.selected_folder.as_deref() == folder)
        });
        let Some(index) = index else { return Ok(None) };
        let entry = &mut bucket.entries[index];
        let session = entry.slot.take();
        let entry_id = entry.id;
        Ok(session.map(|session| PooledConnection {
            entry_id,
            provider_host: provider_host.to_owned(),
            account_id,
            session: Some(session),
        }))
    }

    /// NOOP the connection; on failure, evict its entry and return `false` so
    /// the caller dials a replacement (`spec.md` §4.B: one retry, then evict).
    async fn probe_alive(&self, conn: &mut PooledConnection) -> bool {
        let alive = match conn.session_mut() {
            Ok(session) => imap::noop(session, LIVENESS_PROBE_TIMEOUT).await.is_ok(),
            Err(_) => false,
        };
        if !alive {
            self.remove_entry(&conn.provider_host, conn.entry_id).await;
        }
        alive
    }

    /// Enter IDLE on `conn`'s session, flipping its bookkeeping flag.
    pub async fn start_idle(&self, conn: &mut PooledConnection) -> AppResult<()> {
        let session = match conn.session.take() {
            Some(SessionHolder::Active(session)) => session,
            Some(other) => {
                conn.session = Some(other);
                return Err(AppError::Internal("connection is already idling".to_owned()));
            }
            None => return Err(AppError::Internal("connection has no session".to_owned())),
        };
        let handle = imap::idle_init(session).await?;
        conn.session = Some(SessionHolder::Idling(handle));
        self.set_idle_flag(&conn.provider_host, conn.entry_id, true).await;
        Ok(())
    }

    /// Wait on `conn`'s IDLE handle for a server push, the idle timeout, or
    /// cancellation. `conn` must currently be idling (see [`Self::start_idle`]).
    pub async fn wait_idle(
        &self,
        conn: &mut PooledConnection,
        idle_timeout: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> imap::IdleWake {
        match &mut conn.session {
            Some(SessionHolder::Idling(handle)) => imap::idle_wait(handle, idle_timeout, cancel).await,
            _ => imap::IdleWake::TimedOut,
        }
    }

    /// Leave IDLE and restore the session to `Active` inside `conn`.
    pub async fn stop_idle(&self, conn: &mut PooledConnection, deadline: std::time::Duration) -> AppResult<()> {
        let handle = match conn.session.take() {
            Some(SessionHolder::Idling(handle)) => handle,
            Some(other) => {
                conn.session = Some(other);
                return Ok(());
            }
            None => return Err(AppError::Internal("connection has no session".to_owned())),
        };
        let session = imap::idle_done(handle, deadline).await?;
        conn.session = Some(SessionHolder::Active(session));
        self.set_idle_flag(&conn.provider_host, conn.entry_id, false).await;
        Ok(())
    }

    /// Record which mailbox is currently selected on this connection.
    pub async fn note_selected_folder(&self, conn: &PooledConnection, folder: &str) {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(&conn.provider_host) {
            if let Some(entry) = bucket.entries.iter_mut().find(|e| e.id == conn.entry_id) {
                entry.selected_folder = Some(folder.to_owned());
            }
        }
    }

    /// Return a healthy connection to the pool for reuse.
    pub async fn release(&self, mut conn: PooledConnection) {
        let session = conn.session.take();
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(&conn.provider_host) {
            if let Some(entry) = bucket.entries.iter_mut().find(|e| e.id == conn.entry_id) {
                entry.slot = session;
                entry.is_idle = false;
                entry.last_used = Instant::now();
            }
        }
    }

    /// Discard a connection permanently: logout and drop its pool entry.
    pub async fn close(&self, conn: PooledConnection, deadline: std::time::Duration) {
        if let Some(session) = self.finalize_session(conn.session, deadline).await {
            imap::logout(session, deadline).await;
        }
        self.remove_entry(&conn.provider_host, conn.entry_id).await;
    }

    async fn finalize_session(
        &self,
        holder: Option<SessionHolder>,
        deadline: std::time::Duration,
    ) -> Option<ImapSession> {
        match holder {
            Some(SessionHolder::Active(session)) => Some(session),
            Some(SessionHolder::Idling(handle)) => imap::idle_done(handle, deadline).await.ok(),
            None => None,
        }
    }

    async fn remove_entry(&self, provider_host: &str, entry_id: Uuid) {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(provider_host) {
            bucket.entries.retain(|e| e.id != entry_id);
        }
    }

    async fn set_idle_flag(&self, provider_host: &str, entry_id: Uuid, is_idle: bool) {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(provider_host) {
            if let Some(entry) = bucket.entries.iter_mut().find(|e| e.id == entry_id) {
                entry.is_idle = is_idle;
            }
        }
    }

    /// Evict available (not checked-out) entries idle longer than
    /// `max_idle_seconds`, logging out best-effort.
    pub async fn cleanup_idle(&self, max_idle_seconds: u64) {
        let deadline = self.imap_timeout;
        let threshold = std::time::Duration::from_secs(max_idle_seconds);
        let stale: Vec<(String, Uuid, Option<SessionHolder>)> = {
            let mut buckets = self.buckets.lock().await;
            let mut drained = Vec::new();
            for (host, bucket) in buckets.iter_mut() {
                let mut keep = Vec::with_capacity(bucket.entries.len());
                for mut entry in bucket.entries.drain(..) {
                    if entry.slot.is_some() && entry.last_used.elapsed() >= threshold {
                        drained.push((host.clone(), entry.id, entry.slot.take()));
                    } else {
                        keep.push(entry);
                    }
                }
                bucket.entries = keep;
            }
            drained
        };
        for (_, _, holder) in stale {
            if let Some(session) = self.finalize_session(holder, deadline).await {
                imap::logout(session, deadline).await;
            }
        }
    }

    /// Logout and drop every available (not checked-out) entry across every
    /// provider. Idempotent; safe to call during shutdown.
    pub async fn close_all(&self) {
        let deadline = self.imap_timeout;
        let drained: Vec<Option<SessionHolder>> = {
            let mut buckets = self.buckets.lock().await;
            let mut drained = Vec::new();
            for bucket in buckets.values_mut() {
                for entry in bucket.entries.iter_mut() {
                    drained.push(entry.slot.take());
                }
                bucket.entries.clear();
            }
            drained
        };
        for holder in drained {
            if let Some(session) = self.finalize_session(holder, deadline).await {
                imap::logout(session, deadline).await;
            }
        }
    }

    /// Per-provider `{total, idle, active}` snapshot (`spec.md` §4.B).
    pub async fn stats(&self) -> HashMap<String, ProviderStats> {
        let buckets = self.buckets.lock().await;
        buckets
            .iter()
            .map(|(host, bucket)| {
                let idle = bucket.entries.iter().filter(|e| e.is_idle).count();
                let total = bucket.entries.len();
                (
                    host.clone(),
                    ProviderStats {
                        total,
                        idle,
                        active: total - idle,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            environment: crate::config::Environment::Development,
            database_url: "sqlite::memory:".to_owned(),
            database_min_pool_size: 1,
            database_max_pool_size: 1,
            workers_num: 1,
            worker_max_connections_per_provider: 3,
            imap_timeout: std::time::Duration::from_secs(5),
            imap_idle_timeout: std::time::Duration::from_secs(60),
            http_bind_addr: "127.0.0.1:0".to_owned(),
            allowed_imap_hosts: vec!["imap.purelymail.com".to_owned()],
            auth_code_ttl: std::time::Duration::from_secs(600),
            max_consecutive_failures: 20,
            pool_max_idle_seconds: 600,
        }
    }

    #[tokio::test]
    async fn stats_are_empty_for_an_unused_pool() {
        let pool = ConnectionPool::new(&test_config());
        let stats = pool.stats().await;
        assert_eq!(stats.get("imap.purelymail.com").map(|s| s.total), Some(0));
    }

    #[tokio::test]
    async fn get_connection_rejects_unknown_provider() {
        let pool = ConnectionPool::new(&test_config());
        let creds = Credentials {
            username: "a".to_owned(),
            password: secrecy::SecretString::new("b".to_owned().into()),
        };
        let result = pool
            .get_connection("imap.unknown.test", 993, Uuid::new_v4(), &creds, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn get_connection_bucket_lookup_is_case_insensitive() {
        // `config.rs` lowercases the allow-list; an account's stored
        // `imap_host` is preserved verbatim from the `/process` form, so the
        // bucket lookup must normalize too or a mixed-case host would
        // incorrectly look unlisted.
        let mut config = test_config();
        config.allowed_imap_hosts = vec!["localhost".to_owned()];
        let pool = ConnectionPool::new(&config);
        let creds = Credentials {
            username: "a".to_owned(),
            password: secrecy::SecretString::new("b".to_owned().into()),
        };
        let result = pool
            .get_connection("LOCALHOST", 1, Uuid::new_v4(), &creds, None)
            .await;
        let err = result.expect_err("nothing listens on loopback port 1");
        assert!(
            !err.to_string().contains("not allow-listed"),
            "mixed-case host should still resolve to its provider bucket: {err}"
        );
    }
}
