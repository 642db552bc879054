//! UID Tracker (`spec.md` §4.D)
//!
//! Thin typed façade over [`crate::db::Db`]'s `uid_tracker_entries` table.
//! Owns the compare-and-set `advance` semantics: `last_seen_uid` only ever
//! moves forward within a fixed `(account_id, folder, uidvalidity)` tuple; a
//! UIDVALIDITY change starts the folder over from the new baseline.

use uuid::Uuid;

use crate::db::Db;
use crate::errors::AppResult;
use crate::models::UidTrackerEntry;

pub struct UidTracker {
    db: Db,
}

impl UidTracker {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Load the last known `(uidvalidity, last_seen_uid)` for `(account_id,
    /// folder)`, or `None` if this is the first sync.
    pub async fn load(&self, account_id: Uuid, folder: &str) -> AppResult<Option<UidTrackerEntry>> {
        self.db.load_uid_tracker(account_id, folder).await
    }

    /// Reset tracking for a folder to start at `baseline_uid` under the
    /// given `uidvalidity` — called once on first sync, and again whenever
    /// the server reports a new `uidvalidity` (`spec.md` §4.D edge case).
    pub async fn reset(
        &self,
        account_id: Uuid,
        folder: &str,
        uidvalidity: u32,
        baseline_uid: u32,
    ) -> AppResult<()> {
        self.db
            .advance_uid_tracker(account_id, folder, uidvalidity, baseline_uid)
            .await
    }

    /// Advance `last_seen_uid` to `uid` for the given `uidvalidity`.
    ///
    /// Must only be called after the Event Emitter has durably recorded the
    /// corresponding message (`spec.md` §4.E's at-least-once ordering
    /// guarantee) — this type does not enforce that ordering itself, the
    /// [`crate::listener`] call sequence does.
    pub async fn advance(
        &self,
        account_id: Uuid,
        folder: &str,
        uidvalidity: u32,
        uid: u32,
    ) -> AppResult<()> {
        self.db
            .advance_uid_tracker(account_id, folder, uidvalidity, uid)
            .await
    }
}
