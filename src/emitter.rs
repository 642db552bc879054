//! Event Emitter (`spec.md` §4.E)
//!
//! Converts a UID delta into a webhook payload and durably records it. The
//! actual delivery transport to the external shipper is out of scope
//! (`spec.md` §1) — the emitter's contract ends at the append-only log; a
//! separate out-of-process shipper is assumed to drain it.
//!
//! The emitter is synchronous with respect to the IDLE Listener: `emit`
//! must return successfully before the caller is allowed to advance
//! `last_seen_uid`, so a crash between the two can only ever cause a
//! message to be re-delivered, never lost (`spec.md` §1's at-least-once
//! guarantee).

use serde_json::json;

use crate::db::Db;
use crate::errors::AppResult;
use crate::models::MessageRecord;

pub struct EventEmitter {
    db: Db,
}

impl EventEmitter {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Durably record `message` as a webhook payload. Returns once the write
    /// is committed; the caller may now advance the UID tracker.
    pub async fn emit(&self, message: &MessageRecord) -> AppResult<()> {
        let payload = json!({
            "account_id": message.account_id,
            "folder": message.folder,
            "uidvalidity": message.uidvalidity,
            "uid": message.uid,
            "date": message.date,
            "from": message.from,
            "subject": message.subject,
            "flags": message.flags,
        })
        .to_string();

        self.db
            .append_webhook_log(
                message.account_id,
                &message.folder,
                message.uidvalidity,
                message.uid,
                &payload,
            )
            .await
    }
}
