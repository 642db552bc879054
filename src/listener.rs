//! IDLE Listener (`spec.md` §4.C)
//!
//! One supervised task per `(account, folder)`. Grounded on the
//! `session.idle()` → `init()` → `wait_with_timeout()` → `done()` pattern in
//! `fd1471c2_oakpanha-juttmy-core`'s IDLE loop, wired through
//! [`crate::pool::ConnectionPool`] so the session is checked in and out of
//! the shared pool around each IDLE cycle rather than held exclusively
//! forever.
//!
//! State machine: `Starting → Syncing → Idling → (ServerPush → Syncing |
//! Timeout → Syncing | Cancelled → Stopped)`, with `Syncing`/`Idling`
//! falling back to `BackingOff` on any IMAP error and `Failed` once
//! `max_consecutive_failures` is reached.

use rand::Rng;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth_code::AuthCodeStore;
use crate::config::{MAX_BACKOFF, ServerConfig};
use crate::crypto::CredentialCipher;
use crate::db::Db;
use crate::emitter::EventEmitter;
use crate::errors::AppResult;
use crate::imap;
use crate::models::{Account, AccountStatus};
use crate::pool::ConnectionPool;
use crate::uid_tracker::UidTracker;

/// Observable lifecycle state of one listener task, useful for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Syncing,
    Idling,
    BackingOff,
    Failed,
    Stopped,
}

pub struct AccountListener {
    account_id: Uuid,
    folder: String,
    db: Db,
    pool: std::sync::Arc<ConnectionPool>,
    uid_tracker: UidTracker,
    emitter: EventEmitter,
    cipher: CredentialCipher,
    config: ServerConfig,
    cancel: CancellationToken,
}

impl AccountListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_id: Uuid,
        folder: String,
        db: Db,
        pool: std::sync::Arc<ConnectionPool>,
        uid_tracker: UidTracker,
        emitter: EventEmitter,
        cipher: CredentialCipher,
        config: ServerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            account_id,
            folder,
            db,
            pool,
            uid_tracker,
            emitter,
            cipher,
            config,
            cancel,
        }
    }

    /// Drive the supervised loop until cancelled or the failure ceiling is
    /// hit. Never returns an error: every failure is absorbed into backoff
    /// or the terminal `failed` account status.
    pub async fn run(mut self) {
        let mut state = ListenerState::Starting;
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(account_id = %self.account_id, folder = %self.folder, "listener cancelled");
                return;
            }

            state = match state {
                ListenerState::Starting | ListenerState::Syncing => match self.sync_once().await {
                    Ok(()) => {
                        attempt = 0;
                        let _ = self.db.record_connection_success(self.account_id).await;
                        ListenerState::Idling
                    }
                    Err(e) => {
                        tracing::warn!(account_id = %self.account_id, folder = %self.folder, error = %e, "sync failed");
                        ListenerState::BackingOff
                    }
                },
                ListenerState::Idling => match self.idle_once().await {
                    Ok(true) => ListenerState::Stopped,
                    Ok(false) => ListenerState::Syncing,
                    Err(e) => {
                        tracing::warn!(account_id = %self.account_id, folder = %self.folder, error = %e, "idle cycle failed");
                        ListenerState::BackingOff
                    }
                },
                ListenerState::BackingOff => {
                    let failures = self
                        .db
                        .record_connection_failure(self.account_id)
                        .await
                        .unwrap_or(attempt + 1);
                    if failures >= self.config.max_consecutive_failures {
                        let _ = self
                            .db
                            .set_account_status(self.account_id, AccountStatus::Failed)
                            .await;
                        ListenerState::Failed
                    } else {
                        attempt += 1;
                        self.backoff_sleep(attempt).await;
                        ListenerState::Syncing
                    }
                }
                ListenerState::Failed => {
                    tracing::error!(account_id = %self.account_id, folder = %self.folder, "listener reached the failure ceiling; stopping");
                    return;
                }
                ListenerState::Stopped => return,
            };
        }
    }

    /// Exponential backoff capped at `MAX_BACKOFF`, ±20% jitter.
    async fn backoff_sleep(&self, attempt: u32) {
        let base = Duration::from_secs(2u64.saturating_pow(attempt.min(10))).min(MAX_BACKOFF);
        let jitter_fraction = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered = base.as_secs_f64() * (1.0 + jitter_fraction);
        let wait = Duration::from_secs_f64(jittered.max(0.0));
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Resync: connect, select the folder, fetch-and-emit everything past
    /// `last_seen_uid`, advance the tracker, then release the connection.
    async fn sync_once(&self) -> AppResult<()> {
        let account = self.db.get_account_by_id(self.account_id).await?;
        let credentials = self.cipher.decrypt(&account.credential_blob)?;

        let mut conn = self
            .pool
            .get_connection(
                &account.provider.imap_host,
                account.provider.imap_port,
                account.id,
                &credentials,
                Some(self.folder.as_str()),
            )
            .await?;

        let result = self.sync_with_connection(&account, &mut conn).await;
        match &result {
            Ok(()) => self.pool.release(conn).await,
            Err(_) => self.pool.close(conn, self.config.imap_timeout).await,
        }
        result
    }

    async fn sync_with_connection(
        &self,
        account: &Account,
        conn: &mut crate::pool::PooledConnection,
    ) -> AppResult<()> {
        let uidvalidity = imap::select_mailbox(conn.session_mut()?, &self.folder, self.config.imap_timeout).await?;
        self.pool.note_selected_folder(conn, &self.folder).await;

        let stored = self.uid_tracker.load(account.id, &self.folder).await?;
        let uidvalidity_changed = !matches!(&stored, Some(entry) if entry.uidvalidity == uidvalidity);
        let since_uid = match &stored {
            Some(entry) if !uidvalidity_changed => entry.last_seen_uid,
            _ => 0,
        };

        // `spec.md` §4.C step 2: a UIDVALIDITY change resets `last_seen_uid`
        // to zero and marks a full resync immediately, even before any
        // message is fetched — otherwise a resync that finds zero new
        // messages would leave the stored UIDVALIDITY stale and re-trigger
        // a full resync on every subsequent cycle.
        if uidvalidity_changed {
            self.uid_tracker.reset(account.id, &self.folder, uidvalidity, 0).await?;
        }

        let uids = imap::uids_since(conn.session_mut()?, since_uid, self.config.imap_timeout).await?;
        for uid in uids {
            let record = imap::fetch_envelope(
                conn.session_mut()?,
                account.id,
                &self.folder,
                uidvalidity,
                uid,
                self.config.imap_timeout,
            )
            .await?;
            self.emitter.emit(&record).await?;
            self.uid_tracker
                .advance(account.id, &self.folder, uidvalidity, uid)
                .await?;
        }
        Ok(())
    }

    /// One IDLE cycle: acquire a fresh pooled connection, enter IDLE, wait
    /// for server push/timeout/cancellation, leave IDLE, release the
    /// connection. Returns `Ok(true)` if cancellation ended the cycle.
    async fn idle_once(&self) -> AppResult<bool> {
        let account = self.db.get_account_by_id(self.account_id).await?;
        let credentials = self.cipher.decrypt(&account.credential_blob)?;

        let mut conn = self
            .pool
            .get_connection(
                &account.provider.imap_host,
                account.provider.imap_port,
                account.id,
                &credentials,
                Some(self.folder.as_str()),
            )
            .await?;

        imap::select_mailbox(conn.session_mut()?, &self.folder, self.config.imap_timeout).await?;
        self.pool.note_selected_folder(&conn, &self.folder).await;

        let result = self.run_idle_wait(&mut conn).await;
        match &result {
            Ok(_) => self.pool.release(conn).await,
            Err(_) => self.pool.close(conn, self.config.imap_timeout).await,
        }
        result
    }

    async fn run_idle_wait(&self, conn: &mut crate::pool::PooledConnection) -> AppResult<bool> {
        self.pool.start_idle(conn).await?;
        let wake = self
            .pool
            .wait_idle(conn, self.config.imap_idle_timeout, &self.cancel)
            .await;
        self.pool.stop_idle(conn, self.config.imap_timeout).await?;
        match wake {
            imap::IdleWake::Cancelled => Ok(true),
            imap::IdleWake::ServerPush | imap::IdleWake::TimedOut => Ok(false),
        }
    }
}
