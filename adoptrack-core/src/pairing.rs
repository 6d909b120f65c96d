//! Event Store
//!
//! Accepts `before` and `after` snapshots and turns each matched pair into
//! exactly one [`EditEvent`]. Every state transition is a single storage
//! transaction: a crash leaves a pairing either still pending or fully
//! recorded.
//!
//! Slots are keyed by `(session_id, file_path)`. Two sessions editing the
//! same file hold independent slots and never complete each other's pairings.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{BeforeAck, EditEvent, SnapshotRecord, SnapshotStatus};
use std::sync::Arc;

/// Pairing slot key
pub type PairingKey = (String, String);

/// Reject keys that cannot identify a pairing slot.
pub fn validate_key(session_id: &str, file_path: &str) -> Result<()> {
    if session_id.trim().is_empty() {
        return Err(Error::InvalidArgument("session_id must not be empty".to_string()));
    }
    if file_path.trim().is_empty() {
        return Err(Error::InvalidArgument("file_path must not be empty".to_string()));
    }
    Ok(())
}

/// Durable before/after pairing over the database.
pub struct EventStore {
    db: Arc<Database>,
}

impl EventStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open a pairing for the key, superseding any pending one.
    pub fn record_before(
        &self,
        session_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<BeforeAck> {
        validate_key(session_id, file_path)?;

        let (snapshot, abandoned) = self.db.open_pairing(session_id, file_path, content)?;
        for id in &abandoned {
            tracing::warn!(
                session_id,
                file_path,
                abandoned_snapshot_id = id,
                "Abandoned pending pairing superseded by a new before snapshot"
            );
        }
        tracing::debug!(
            session_id,
            file_path,
            snapshot_id = snapshot.id,
            "Recorded before snapshot"
        );

        Ok(BeforeAck {
            snapshot_id: snapshot.id,
            pairing_token: snapshot.pairing_token,
            abandoned,
        })
    }

    /// Complete the key's pending pairing.
    ///
    /// Fails with [`Error::NoPendingBefore`] when nothing is open for the key;
    /// the `after` is then discarded, never stored as a `before`.
    pub fn record_after(
        &self,
        session_id: &str,
        file_path: &str,
        content: &str,
        project_id: &str,
        session_info: Option<&str>,
    ) -> Result<EditEvent> {
        validate_key(session_id, file_path)?;

        let event = self
            .db
            .complete_pairing(session_id, file_path, content, project_id, session_info)
            .map_err(|err| {
                if matches!(err, Error::NoPendingBefore { .. }) {
                    tracing::warn!(session_id, file_path, "After snapshot with no pending before");
                }
                err
            })?;

        tracing::debug!(
            session_id,
            file_path,
            event_id = event.id,
            project_id,
            "Paired edit event"
        );
        Ok(event)
    }

    /// Before snapshots in the given state (pending or abandoned for diagnostics)
    pub fn snapshots(&self, status: SnapshotStatus) -> Result<Vec<SnapshotRecord>> {
        self.db.list_snapshots(Some(status))
    }
}
