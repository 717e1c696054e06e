//! Session persistence with merge-upsert semantics.
//!
//! Writers never replace a session document wholesale. They send a
//! [`SessionUpdate`] which [`merge_session`] folds into whatever is stored:
//! logs are appended and deduplicated, keyword and rule lists are unioned,
//! evaluation results are concatenated. Replaying the same update is harmless
//! for everything except evaluation results, which the engine only ever sends
//! once per judgment.
//!
//! Writes are conditional on the document `version`; [`SessionStore::upsert`]
//! reloads, re-merges and retries when another writer got there first.

use crate::model::{Session, SessionId, SessionKey, SessionUpdate, UnitResult, UnitUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version conflict on {key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: SessionKey,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Gave up on {key} after {attempts} conflicting writes")]
    ConflictsExhausted { key: SessionKey, attempts: u32 },

    #[error("No session with id {0}")]
    NotFound(SessionId),
}

/// Ways to address a stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    Id(SessionId),
    Key(SessionKey),
}

impl From<SessionKey> for SessionLookup {
    fn from(key: SessionKey) -> Self {
        SessionLookup::Key(key)
    }
}

impl From<SessionId> for SessionLookup {
    fn from(id: SessionId) -> Self {
        SessionLookup::Id(id)
    }
}

/// Document storage for sessions, one document per [`SessionKey`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, key: &SessionKey) -> Result<Option<Session>, StoreError>;

    async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Store `session` if the stored version equals `expected`.
    ///
    /// `None` means the document must not exist yet. A mismatch returns
    /// [`StoreError::VersionConflict`] and leaves the stored document as is.
    async fn put_if_version(&self, session: Session, expected: Option<u64>) -> Result<(), StoreError>;
}

// ============================================================================
// Merge
// ============================================================================

/// Fold `update` into `existing`, producing the next stored revision.
///
/// A missing document is created from `key`. The result's `version` is one
/// past the existing one.
pub fn merge_session(
    existing: Option<Session>,
    key: &SessionKey,
    update: &SessionUpdate,
    now: DateTime<Utc>,
) -> Session {
    let (mut session, version) = match existing {
        Some(session) => {
            let version = session.version;
            (session, version)
        }
        None => (Session::new(key, ""), 0),
    };

    if let Some(name) = update.user_name.as_deref().filter(|n| !n.is_empty()) {
        session.user_name = name.to_string();
    }
    if let Some(summary) = &update.summary {
        session.summary = summary.clone();
    }

    for incoming in &update.units {
        match session.unit_mut(&incoming.unit_id) {
            Some(unit) => merge_unit(unit, incoming),
            None => {
                let mut unit = UnitResult::new(&incoming.unit_id);
                merge_unit(&mut unit, incoming);
                session.unit_results.push(unit);
            }
        }
    }

    session.generated_at = now;
    session.version = version + 1;
    session
}

fn merge_unit(unit: &mut UnitResult, incoming: &UnitUpdate) {
    let mut seen: HashSet<String> = unit.conversation_logs.iter().map(|l| l.dedup_key()).collect();
    for log in &incoming.conversation_logs {
        if seen.insert(log.dedup_key()) {
            unit.conversation_logs.push(log.clone());
        }
    }
    // Stable, so lines sharing a timestamp keep their append order.
    unit.conversation_logs.sort_by_key(|l| l.timestamp);

    union_into(&mut unit.important_keywords, &incoming.important_keywords);
    union_into(&mut unit.standard_pass_rules, &incoming.standard_pass_rules);
    unit.evaluation_results.extend(incoming.evaluation_results.iter().cloned());

    if let Some(status) = incoming.status {
        unit.status = status;
    }
    if let Some(turns) = incoming.turn_count {
        unit.turn_count = unit.turn_count.max(turns);
    }
}

fn union_into(target: &mut Vec<String>, incoming: &[String]) {
    for value in incoming {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

// ============================================================================
// Session store
// ============================================================================

/// Merge-upsert front end over a [`DocumentStore`].
#[derive(Clone)]
pub struct SessionStore {
    docs: Arc<dyn DocumentStore>,
    attempts: u32,
    backoff: Duration,
}

impl SessionStore {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self {
            docs,
            attempts: 5,
            backoff: Duration::from_millis(20),
        }
    }

    /// Bound the conflict retry loop. The delay doubles after each conflict.
    pub fn with_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub async fn find(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        self.docs.find(key).await
    }

    pub async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        self.docs.find_by_id(id).await
    }

    /// Merge `update` into the addressed session and return the stored result.
    ///
    /// Addressing by key creates the document when absent; addressing by id
    /// requires it to exist.
    pub async fn upsert(
        &self,
        lookup: impl Into<SessionLookup>,
        update: &SessionUpdate,
    ) -> Result<Session, StoreError> {
        let lookup = lookup.into();
        let mut delay = self.backoff;
        let mut last_key = None;

        for attempt in 1..=self.attempts {
            let (key, existing) = self.load(&lookup).await?;
            let expected = existing.as_ref().map(|s| s.version);
            let merged = merge_session(existing, &key, update, Utc::now());

            match self.docs.put_if_version(merged.clone(), expected).await {
                Ok(()) => {
                    debug!(session = %key, version = merged.version, "session upserted");
                    return Ok(merged);
                }
                Err(StoreError::VersionConflict { found, .. }) => {
                    warn!(
                        session = %key,
                        attempt,
                        expected = ?expected,
                        found = ?found,
                        "session write conflicted, retrying"
                    );
                    last_key = Some(key);
                    if attempt < self.attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let key = match (last_key, lookup) {
            (Some(key), _) | (None, SessionLookup::Key(key)) => key,
            (None, SessionLookup::Id(id)) => return Err(StoreError::NotFound(id)),
        };
        Err(StoreError::ConflictsExhausted {
            key,
            attempts: self.attempts,
        })
    }

    async fn load(&self, lookup: &SessionLookup) -> Result<(SessionKey, Option<Session>), StoreError> {
        match lookup {
            SessionLookup::Key(key) => Ok((key.clone(), self.docs.find(key).await?)),
            SessionLookup::Id(id) => {
                let session = self.docs.find_by_id(*id).await?.ok_or(StoreError::NotFound(*id))?;
                Ok((session.key(), Some(session)))
            }
        }
    }
}

// ============================================================================
// Backends
// ============================================================================

fn check_version(key: &SessionKey, current: Option<&Session>, expected: Option<u64>) -> Result<(), StoreError> {
    let found = current.map(|s| s.version);
    if found == expected {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            key: key.clone(),
            expected,
            found,
        })
    }
}

/// Process-local document store.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn put_if_version(&self, session: Session, expected: Option<u64>) -> Result<(), StoreError> {
        let key = session.key();
        let mut sessions = self.sessions.write().await;
        check_version(&key, sessions.get(&key), expected)?;
        sessions.insert(key, session);
        Ok(())
    }
}

/// One pretty-printed JSON file per session under a directory.
///
/// Conditional writes are serialized within the process; the file is
/// replaced through a temp file and rename.
pub struct JsonDirDocumentStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDirDocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the session for `key`.
    pub fn session_path(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!(
            "{}__{}__{}.json",
            encode_component(&key.activity_id),
            encode_component(&key.user_id),
            encode_component(&key.session_code)
        ))
    }

    async fn read(path: &Path) -> Result<Option<Session>, StoreError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Escape everything but ASCII alphanumerics and `-`, so distinct keys never
/// share a file name.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

#[async_trait]
impl DocumentStore for JsonDirDocumentStore {
    async fn find(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        Self::read(&self.session_path(key)).await
    }

    async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(session) = Self::read(&path).await? {
                    if session.id == id {
                        return Ok(Some(session));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn put_if_version(&self, session: Session, expected: Option<u64>) -> Result<(), StoreError> {
        let key = session.key();
        let path = self.session_path(&key);
        let _guard = self.write_lock.lock().await;

        let current = Self::read(&path).await?;
        check_version(&key, current.as_ref(), expected)?;

        fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_string_pretty(&session)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationLog, UnitStatus};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn key() -> SessionKey {
        SessionKey::new("act", "user", "S1")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn exchange(unit: &str, user: &str, reply: &str, secs: i64) -> SessionUpdate {
        let mut update = SessionUpdate::new();
        let u = update.unit(unit);
        u.conversation_logs.push(ConversationLog::user(user, at(secs)));
        u.conversation_logs.push(ConversationLog::assistant(reply, at(secs + 1)));
        u.turn_count = Some(1);
        update
    }

    #[test]
    fn test_merge_creates_missing_session() {
        let mut update = exchange("u1", "hi", "hello", 0);
        update.user_name = Some("Ken".into());

        let session = merge_session(None, &key(), &update, at(5));

        assert_eq!(session.version, 1);
        assert_eq!(session.user_name, "Ken");
        assert_eq!(session.generated_at, at(5));
        assert_eq!(session.unit("u1").unwrap().conversation_logs.len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent_for_logs() {
        let update = exchange("u1", "hi", "hello", 0);
        let once = merge_session(None, &key(), &update, at(5));
        let twice = merge_session(Some(once.clone()), &key(), &update, at(6));

        let unit = twice.unit("u1").unwrap();
        assert_eq!(unit.conversation_logs, once.unit("u1").unwrap().conversation_logs);
        assert_eq!(unit.turn_count, 1);
        assert_eq!(twice.version, 2);
    }

    #[test]
    fn test_merging_full_unit_twice_is_idempotent() {
        let mut result = UnitResult::new("u1");
        result.status = UnitStatus::Passed;
        result.turn_count = 2;
        result.important_keywords = vec!["thanks".into()];
        result.conversation_logs = vec![
            ConversationLog::assistant("Excuse me?", at(0)),
            ConversationLog::user("thanks for waiting", at(1)),
            ConversationLog::assistant("Finally.", at(2)),
        ];
        let mut update = SessionUpdate::new();
        update.units.push(UnitUpdate::from(result.clone()));

        let once = merge_session(None, &key(), &update, at(5));
        let twice = merge_session(Some(once.clone()), &key(), &update, at(6));

        assert_eq!(once.unit_results, vec![result]);
        assert_eq!(twice.unit_results, once.unit_results);
    }

    #[test]
    fn test_merge_orders_logs_by_timestamp() {
        let later = merge_session(None, &key(), &exchange("u1", "second", "b", 10), at(20));
        let merged = merge_session(Some(later), &key(), &exchange("u1", "first", "a", 0), at(21));

        let contents: Vec<_> = merged
            .unit("u1")
            .unwrap()
            .conversation_logs
            .iter()
            .map(|l| l.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "a", "second", "b"]);
    }

    #[test]
    fn test_merge_unions_lists_and_concatenates_evaluations() {
        let mut first = SessionUpdate::new();
        let u = first.unit("u1");
        u.important_keywords = vec!["refund".into(), "sorry".into()];
        u.evaluation_results = vec!["not yet".into()];
        let mut second = SessionUpdate::new();
        let u = second.unit("u1");
        u.important_keywords = vec!["sorry".into(), "receipt".into()];
        u.standard_pass_rules = vec!["offers a solution".into()];
        u.evaluation_results = vec!["not yet".into()];
        u.status = Some(UnitStatus::Passed);

        let session = merge_session(None, &key(), &first, at(0));
        let session = merge_session(Some(session), &key(), &second, at(1));
        let unit = session.unit("u1").unwrap();

        assert_eq!(unit.important_keywords, vec!["refund", "sorry", "receipt"]);
        assert_eq!(unit.standard_pass_rules, vec!["offers a solution"]);
        assert_eq!(unit.evaluation_results, vec!["not yet", "not yet"]);
        assert_eq!(unit.status, UnitStatus::Passed);
    }

    #[test]
    fn test_merge_never_lowers_turn_count() {
        let mut high = SessionUpdate::new();
        high.unit("u1").turn_count = Some(3);
        let mut stale = SessionUpdate::new();
        stale.unit("u1").turn_count = Some(2);

        let session = merge_session(None, &key(), &high, at(0));
        let session = merge_session(Some(session), &key(), &stale, at(1));
        assert_eq!(session.turn_count("u1"), 3);
    }

    #[test]
    fn test_encoded_components_do_not_collide() {
        assert_ne!(encode_component("a-b"), encode_component("a_b"));
        assert_ne!(encode_component("a_b"), encode_component("a b"));
        assert_eq!(encode_component("S1"), "S1");
    }

    #[tokio::test]
    async fn test_in_memory_rejects_stale_version() {
        let store = InMemoryDocumentStore::new();
        let session = merge_session(None, &key(), &SessionUpdate::new(), at(0));
        store.put_if_version(session.clone(), None).await.unwrap();

        let again = store.put_if_version(session.clone(), None).await;
        assert!(matches!(
            again,
            Err(StoreError::VersionConflict { found: Some(1), .. })
        ));
        assert_eq!(store.find_by_id(session.id).await.unwrap().unwrap().key(), key());
    }

    /// Reports a conflict for the first `failures` writes, then delegates.
    struct Contended {
        inner: InMemoryDocumentStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl DocumentStore for Contended {
        async fn find(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
            self.inner.find(key).await
        }

        async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn put_if_version(&self, session: Session, expected: Option<u64>) -> Result<(), StoreError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::VersionConflict {
                    key: session.key(),
                    expected,
                    found: Some(99),
                });
            }
            self.inner.put_if_version(session, expected).await
        }
    }

    fn contended(failures: u32) -> Arc<Contended> {
        Arc::new(Contended {
            inner: InMemoryDocumentStore::new(),
            failures: AtomicU32::new(failures),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_retries_conflicts() {
        let store = SessionStore::new(contended(2)).with_retries(3, Duration::from_millis(10));

        let session = store.upsert(key(), &exchange("u1", "hi", "hello", 0)).await.unwrap();
        assert_eq!(session.version, 1);
        assert_eq!(store.find(&key()).await.unwrap().unwrap(), session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_surfaces_exhausted_conflicts() {
        let docs = contended(5);
        let store = SessionStore::new(docs.clone()).with_retries(3, Duration::from_millis(10));

        let result = store.upsert(key(), &exchange("u1", "hi", "hello", 0)).await;
        assert!(matches!(
            result,
            Err(StoreError::ConflictsExhausted { attempts: 3, .. })
        ));
        assert!(docs.inner.is_empty().await);
    }

    #[tokio::test]
    async fn test_upsert_by_unknown_id_fails() {
        let store = SessionStore::new(Arc::new(InMemoryDocumentStore::new()));
        let result = store.upsert(SessionId::new(), &SessionUpdate::new()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_json_dir_round_trip_and_lookup_by_id() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(Arc::new(JsonDirDocumentStore::new(dir.path().join("sessions"))));

        let created = store.upsert(key(), &exchange("u1", "hi", "hello", 0)).await.unwrap();
        let updated = store
            .upsert(created.id, &exchange("u1", "my kettle broke", "oh no", 10))
            .await
            .unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.version, 2);

        let reopened = JsonDirDocumentStore::new(dir.path().join("sessions"));
        let loaded = reopened.find(&key()).await.unwrap().unwrap();
        assert_eq!(loaded.unit("u1").unwrap().conversation_logs.len(), 4);
        assert_eq!(reopened.find_by_id(created.id).await.unwrap().unwrap().version, 2);
    }
}
