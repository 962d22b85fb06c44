//! C2 Conversation Store Adapter. Conversations are stored as one JSON
//! blob per row (sqlite has no native array/struct columns worth fighting
//! for here); the in-progress pointer lives in its own table so the
//! compare-and-set in [`Store::set_in_progress_pointer`] stays a single
//! statement. Mirrors the `rusqlite` + `parking_lot::Mutex<Connection>`
//! shape used elsewhere in this codebase for small embedded stores.

use crate::error::StoreError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use transcription_protocol::{Conversation, ConversationPhoto, ConversationStatus, TranscriptSegment};

/// Segments whose start times fall within this many seconds of each other
/// and share a speaker are coalesced into one segment (§4.2 rule 2).
pub const DEFAULT_COALESCE_GAP_SECS: f64 = 0.5;

pub struct Store {
    conn: Mutex<rusqlite::Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS conversations (
                uid TEXT NOT NULL,
                id TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (uid, id)
             );
             CREATE INDEX IF NOT EXISTS idx_conversations_uid_status ON conversations(uid, status);
             CREATE TABLE IF NOT EXISTS in_progress_ptr (
                uid TEXT PRIMARY KEY,
                conversation_id TEXT
             );",
        )?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_for_test(dir: &Path) -> Self {
        Store::open(&dir.join("store.db")).unwrap()
    }

    fn row_to_conversation(data: String) -> Result<Conversation, StoreError> {
        serde_json::from_str(&data).map_err(|e| StoreError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))
    }

    /// Persists a new conversation. If its status is `in_progress`, also
    /// attempts the in-progress pointer CAS; the caller (C4, under the
    /// conversation lock) is responsible for having verified there is no
    /// existing in-progress conversation first.
    pub fn create(&self, conv: &Conversation) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let data = serde_json::to_string(conv).expect("Conversation serializes");
        conn.execute(
            "INSERT INTO conversations (uid, id, status, data) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![conv.uid, conv.id, status_str(conv.status), data],
        )?;
        if conv.status == ConversationStatus::InProgress {
            set_in_progress_pointer_locked(&conn, &conv.uid, &conv.id)?;
        }
        Ok(())
    }

    pub fn get(&self, uid: &str, id: &str) -> Result<Conversation, StoreError> {
        let conn = self.conn.lock();
        let data: String = conn
            .query_row(
                "SELECT data FROM conversations WHERE uid = ?1 AND id = ?2",
                rusqlite::params![uid, id],
                |row| row.get(0),
            )
            .map_err(|_| StoreError::NotFound {
                uid: uid.to_string(),
                id: id.to_string(),
            })?;
        Self::row_to_conversation(data)
    }

    pub fn try_get(&self, uid: &str, id: &str) -> Result<Option<Conversation>, StoreError> {
        match self.get(uid, id) {
            Ok(conv) => Ok(Some(conv)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get_in_progress(&self, uid: &str) -> Result<Option<Conversation>, StoreError> {
        let id = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT conversation_id FROM in_progress_ptr WHERE uid = ?1",
                rusqlite::params![uid],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional_flatten()
        };
        match id {
            Some(id) => self.try_get(uid, &id),
            None => Ok(None),
        }
    }

    pub fn get_processing(&self, uid: &str) -> Result<Vec<Conversation>, StoreError> {
        self.get_by_status(uid, ConversationStatus::Processing)
    }

    pub fn get_last_completed(&self, uid: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM conversations WHERE uid = ?1 AND status = ?2
                 ORDER BY json_extract(data, '$.finished_at') DESC LIMIT 1",
                rusqlite::params![uid, status_str(ConversationStatus::Completed)],
                |row| row.get(0),
            )
            .optional_flatten();
        data.map(Self::row_to_conversation).transpose()
    }

    fn get_by_status(&self, uid: &str, status: ConversationStatus) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM conversations WHERE uid = ?1 AND status = ?2")?;
        let rows = stmt.query_map(rusqlite::params![uid, status_str(status)], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Self::row_to_conversation(row?)?);
        }
        Ok(out)
    }

    /// Reads, applies `f`, and writes back. Callers hold the conversation
    /// lock for the duration of the logical operation this belongs to; the
    /// store itself does not re-derive cross-process exclusion.
    fn mutate<F>(&self, uid: &str, id: &str, f: F) -> Result<Conversation, StoreError>
    where
        F: FnOnce(&mut Conversation),
    {
        let mut conv = self.get(uid, id)?;
        f(&mut conv);
        let conn = self.conn.lock();
        let data = serde_json::to_string(&conv).expect("Conversation serializes");
        conn.execute(
            "UPDATE conversations SET status = ?1, data = ?2 WHERE uid = ?3 AND id = ?4",
            rusqlite::params![status_str(conv.status), data, uid, id],
        )?;
        Ok(conv)
    }

    pub fn update_segments(&self, uid: &str, id: &str, segments: Vec<TranscriptSegment>) -> Result<Conversation, StoreError> {
        self.mutate(uid, id, |conv| conv.transcript_segments = segments)
    }

    pub fn store_photos(&self, uid: &str, id: &str, photos: Vec<ConversationPhoto>) -> Result<Conversation, StoreError> {
        self.mutate(uid, id, |conv| conv.photos.extend(photos))
    }

    pub fn update_finished_at(&self, uid: &str, id: &str, ts: chrono::DateTime<chrono::Utc>) -> Result<Conversation, StoreError> {
        self.mutate(uid, id, |conv| conv.finished_at = ts)
    }

    pub fn update_started_at(&self, uid: &str, id: &str, ts: chrono::DateTime<chrono::Utc>) -> Result<Conversation, StoreError> {
        self.mutate(uid, id, |conv| conv.started_at = ts)
    }

    pub fn promote_source_to_openglass(&self, uid: &str, id: &str) -> Result<Conversation, StoreError> {
        self.mutate(uid, id, |conv| conv.source = transcription_protocol::ConversationSource::Openglass)
    }

    /// Transitions status; if leaving `in_progress`, clears the pointer
    /// provided it still points at this conversation.
    pub fn set_status(&self, uid: &str, id: &str, status: ConversationStatus) -> Result<Conversation, StoreError> {
        let conv = self.mutate(uid, id, |conv| conv.status = status)?;
        if status != ConversationStatus::InProgress {
            let conn = self.conn.lock();
            clear_in_progress_pointer_if_matches_locked(&conn, uid, id)?;
        }
        Ok(conv)
    }

    pub fn set_discarded(&self, uid: &str, id: &str) -> Result<Conversation, StoreError> {
        let conv = self.mutate(uid, id, |conv| {
            conv.discarded = true;
            conv.status = ConversationStatus::Discarded;
        })?;
        let conn = self.conn.lock();
        clear_in_progress_pointer_if_matches_locked(&conn, uid, id)?;
        Ok(conv)
    }

    /// Used only for empty conversations (§4.4 finalize step 2).
    pub fn delete(&self, uid: &str, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM conversations WHERE uid = ?1 AND id = ?2",
            rusqlite::params![uid, id],
        )?;
        clear_in_progress_pointer_if_matches_locked(&conn, uid, id)?;
        Ok(())
    }

    /// Sets the pointer iff it is currently null or already equal to `id`
    /// (§5: "set pointer iff current value is null-or-same-id"). Returns
    /// whether the pointer now points at `id`.
    pub fn set_in_progress_pointer(&self, uid: &str, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        set_in_progress_pointer_locked(&conn, uid, id)
    }
}

fn set_in_progress_pointer_locked(conn: &rusqlite::Connection, uid: &str, id: &str) -> Result<bool, StoreError> {
    conn.execute(
        "INSERT INTO in_progress_ptr (uid, conversation_id) VALUES (?1, ?2)
         ON CONFLICT(uid) DO UPDATE SET conversation_id = excluded.conversation_id
         WHERE in_progress_ptr.conversation_id IS NULL OR in_progress_ptr.conversation_id = excluded.conversation_id",
        rusqlite::params![uid, id],
    )?;
    let current: Option<String> = conn.query_row(
        "SELECT conversation_id FROM in_progress_ptr WHERE uid = ?1",
        rusqlite::params![uid],
        |row| row.get(0),
    )?;
    Ok(current.as_deref() == Some(id))
}

fn clear_in_progress_pointer_if_matches_locked(conn: &rusqlite::Connection, uid: &str, id: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE in_progress_ptr SET conversation_id = NULL WHERE uid = ?1 AND conversation_id = ?2",
        rusqlite::params![uid, id],
    )?;
    Ok(())
}

fn status_str(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::InProgress => "in_progress",
        ConversationStatus::Processing => "processing",
        ConversationStatus::Completed => "completed",
        ConversationStatus::Discarded => "discarded",
    }
}

/// `query_row` returns `Err(QueryReturnedNoRows)` when there's no matching
/// row at all, but we asked for a nullable column, so a present row with a
/// NULL value and an absent row both mean "nothing here".
trait OptionalFlatten<T> {
    fn optional_flatten(self) -> Option<T>;
}

impl<T> OptionalFlatten<T> for rusqlite::Result<Option<T>> {
    fn optional_flatten(self) -> Option<T> {
        match self {
            Ok(inner) => inner,
            Err(_) => None,
        }
    }
}

/// Merges `new_batch` into `existing` per §4.2 and returns the merged list
/// together with the half-open range of indices `new_batch` contributed
/// to or touched. Pure and independent of storage so it can be tested in
/// isolation and reused by both C4 and these laws' tests.
pub fn merge_segments(
    existing: &[TranscriptSegment],
    new_batch: &[TranscriptSegment],
    coalesce_gap_secs: f64,
) -> (Vec<TranscriptSegment>, Range<usize>) {
    let mut merged = existing.to_vec();
    let mut touched_min = merged.len();
    let mut touched_max = merged.len();

    for incoming in new_batch {
        if let Some(pos) = merged.iter().position(|s| s.id == incoming.id) {
            coalesce_in_place(&mut merged[pos], incoming);
            touched_min = touched_min.min(pos);
            touched_max = touched_max.max(pos + 1);
            continue;
        }

        if let Some(last) = merged.last_mut() {
            let gap = incoming.start_sec - last.end_sec;
            if last.speaker_id == incoming.speaker_id && gap < coalesce_gap_secs {
                last.text = format!("{} {}", last.text.trim_end(), incoming.text.trim_start());
                last.end_sec = incoming.end_sec;
                let pos = merged.len() - 1;
                touched_min = touched_min.min(pos);
                touched_max = touched_max.max(pos + 1);
                continue;
            }
        }

        let insert_at = merged
            .iter()
            .position(|s| s.start_sec > incoming.start_sec)
            .unwrap_or(merged.len());
        merged.insert(insert_at, incoming.clone());
        touched_min = touched_min.min(insert_at);
        touched_max = merged.len();
        // shift any touched range after this insertion point forward by one
        if touched_min < insert_at {
            touched_max = touched_max.max(insert_at + 1);
        }
    }

    if new_batch.is_empty() {
        return (merged, merged.len()..merged.len());
    }
    (merged, touched_min..touched_max)
}

fn coalesce_in_place(existing: &mut TranscriptSegment, incoming: &TranscriptSegment) {
    let compatible = incoming.text.starts_with(existing.text.as_str()) || incoming.text == existing.text;
    if !compatible {
        tracing::warn!(
            segment_id = %existing.id,
            old_text = %existing.text,
            new_text = %incoming.text,
            "coalescing segment replaced with non-prefix-compatible text"
        );
    }
    existing.text = incoming.text.clone();
    existing.end_sec = incoming.end_sec;
    existing.translations = incoming.translations.clone();
}

/// Applies the session's speaker-assignment map (§4.2 rule 4) to any
/// segment in `range` that is not already `is_user` and has no
/// `person_id`.
pub fn apply_speaker_assignments(
    segments: &mut [TranscriptSegment],
    range: Range<usize>,
    assignments: &HashMap<String, String>,
) {
    for segment in segments[range].iter_mut() {
        if segment.is_user || segment.person_id.is_some() {
            continue;
        }
        if let Some(assigned) = assignments.get(&segment.id) {
            if assigned == "user" {
                segment.is_user = true;
                segment.person_id = None;
            } else {
                segment.is_user = false;
                segment.person_id = Some(assigned.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn seg(id: &str, text: &str, speaker_id: i32, start: f64, end: f64) -> TranscriptSegment {
        TranscriptSegment {
            id: id.to_string(),
            text: text.to_string(),
            speaker_label: format!("SPEAKER_{speaker_id:02}"),
            speaker_id,
            is_user: false,
            person_id: None,
            start_sec: start,
            end_sec: end,
            translations: vec![],
            source: "deepgram".to_string(),
            speech_profile_processed: false,
        }
    }

    fn conv(uid: &str, id: &str, status: ConversationStatus) -> Conversation {
        Conversation {
            id: id.to_string(),
            uid: uid.to_string(),
            created_at: Utc::now(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status,
            source: transcription_protocol::ConversationSource::Omi,
            language: "en".to_string(),
            transcript_segments: vec![],
            photos: vec![],
            structured: None,
            geolocation: None,
            is_locked: false,
            private_cloud_sync_enabled: false,
            discarded: false,
        }
    }

    #[test]
    fn rule1_same_id_coalesces_with_prefix_extension() {
        let existing = vec![seg("a", "hel", 0, 0.0, 0.3)];
        let new_batch = vec![seg("a", "hello", 0, 0.0, 0.5)];
        let (merged, range) = merge_segments(&existing, &new_batch, DEFAULT_COALESCE_GAP_SECS);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "hello");
        assert_eq!(merged[0].end_sec, 0.5);
        assert_eq!(range, 0..1);
    }

    #[test]
    fn rule2_same_speaker_small_gap_appends_to_previous() {
        let existing = vec![seg("a", "hello", 0, 0.0, 1.0)];
        let new_batch = vec![seg("b", "world", 0, 1.2, 1.8)];
        let (merged, range) = merge_segments(&existing, &new_batch, DEFAULT_COALESCE_GAP_SECS);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "hello world");
        assert_eq!(merged[0].end_sec, 1.8);
        assert_eq!(range, 0..1);
    }

    #[test]
    fn rule3_different_speaker_or_large_gap_inserts_ascending() {
        let existing = vec![seg("a", "hello", 0, 0.0, 1.0)];
        let new_batch = vec![seg("b", "hi there", 1, 1.0, 2.0)];
        let (merged, range) = merge_segments(&existing, &new_batch, DEFAULT_COALESCE_GAP_SECS);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].id, "b");
        assert_eq!(range, 1..2);
    }

    #[test]
    fn rule3_inserts_out_of_order_batch_ascending_by_start() {
        let existing = vec![seg("a", "first", 0, 0.0, 1.0), seg("c", "third", 0, 5.0, 6.0)];
        let new_batch = vec![seg("b", "second", 1, 2.0, 3.0)];
        let (merged, _) = merge_segments(&existing, &new_batch, DEFAULT_COALESCE_GAP_SECS);
        let starts: Vec<f64> = merged.iter().map(|s| s.start_sec).collect();
        assert_eq!(starts, vec![0.0, 2.0, 5.0]);
    }

    #[test]
    fn rule4_speaker_assignment_applied_to_touched_range_only() {
        let mut segments = vec![seg("a", "hello", 0, 0.0, 1.0), seg("b", "world", 1, 2.0, 3.0)];
        let mut assignments = HashMap::new();
        assignments.insert("b".to_string(), "user".to_string());
        apply_speaker_assignments(&mut segments, 1..2, &assignments);
        assert!(!segments[0].is_user);
        assert!(segments[1].is_user);
        assert_eq!(segments[1].person_id, None);
    }

    #[test]
    fn rule4_named_person_sets_person_id() {
        let mut segments = vec![seg("a", "hello", 0, 0.0, 1.0)];
        let mut assignments = HashMap::new();
        assignments.insert("a".to_string(), "person-42".to_string());
        apply_speaker_assignments(&mut segments, 0..1, &assignments);
        assert!(!segments[0].is_user);
        assert_eq!(segments[0].person_id.as_deref(), Some("person-42"));
    }

    #[test]
    fn i3_merged_list_stays_sorted_by_start_sec() {
        let existing = vec![];
        let batch = vec![seg("c", "c", 0, 5.0, 6.0), seg("a", "a", 1, 0.0, 1.0), seg("b", "b", 2, 2.0, 3.0)];
        let (merged, _) = merge_segments(&existing, &batch, DEFAULT_COALESCE_GAP_SECS);
        let starts: Vec<f64> = merged.iter().map(|s| s.start_sec).collect();
        let mut sorted = starts.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(starts, sorted);
    }

    #[test]
    fn l1_merge_is_associative_over_disjoint_batches() {
        let e = vec![seg("a", "hello", 0, 0.0, 1.0)];
        let batch_a = vec![seg("b", "mid", 2, 3.0, 4.0)];
        let batch_b = vec![seg("c", "end", 3, 6.0, 7.0)];

        let (step1, _) = merge_segments(&e, &batch_a, DEFAULT_COALESCE_GAP_SECS);
        let (left, _) = merge_segments(&step1, &batch_b, DEFAULT_COALESCE_GAP_SECS);

        let combined: Vec<TranscriptSegment> = batch_a.iter().chain(batch_b.iter()).cloned().collect();
        let (right, _) = merge_segments(&e, &combined, DEFAULT_COALESCE_GAP_SECS);

        assert_eq!(left, right);
    }

    #[test]
    fn in_progress_pointer_cas_rejects_second_distinct_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_for_test(dir.path());
        assert!(store.set_in_progress_pointer("u1", "c1").unwrap());
        assert!(!store.set_in_progress_pointer("u1", "c2").unwrap());
        assert!(store.set_in_progress_pointer("u1", "c1").unwrap());
    }

    #[test]
    fn create_persists_and_get_in_progress_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_for_test(dir.path());
        let c = conv("u1", "c1", ConversationStatus::InProgress);
        store.create(&c).unwrap();
        let fetched = store.get_in_progress("u1").unwrap().unwrap();
        assert_eq!(fetched.id, "c1");
    }

    #[test]
    fn set_status_clears_pointer_when_leaving_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_for_test(dir.path());
        let c = conv("u1", "c1", ConversationStatus::InProgress);
        store.create(&c).unwrap();
        store.set_status("u1", "c1", ConversationStatus::Processing).unwrap();
        assert!(store.get_in_progress("u1").unwrap().is_none());
        assert!(store.set_in_progress_pointer("u1", "c2").unwrap());
    }

    #[test]
    fn delete_removes_row_and_clears_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_for_test(dir.path());
        let c = conv("u1", "c1", ConversationStatus::InProgress);
        store.create(&c).unwrap();
        store.delete("u1", "c1").unwrap();
        assert!(store.try_get("u1", "c1").unwrap().is_none());
        assert!(store.get_in_progress("u1").unwrap().is_none());
    }
}
