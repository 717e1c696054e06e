//! Persistent collection of dynamic memory entries.
//!
//! Baseline memories live with the persona and activity definitions in the
//! catalog; this collection only holds entries created during play.

use super::consolidate::ConsolidationPlan;
use super::entry::{MemoryEntry, MemoryId, MemoryScope, MemoryTier};
use super::working::WorkingMemory;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

/// Errors from the memory collection.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Refusing to store a baseline entry in the dynamic collection")]
    NotDynamic,
}

/// Storage for session-scoped memory entries.
#[async_trait]
pub trait MemoryRepository: Send + Sync {
    /// All entries owned by `scope`, in insertion order.
    async fn scope_entries(&self, scope: &MemoryScope) -> Result<Vec<MemoryEntry>, MemoryError>;

    /// Insert entries in one batch; either all are stored or none.
    ///
    /// Entries whose id is already stored are skipped. Returns how many
    /// were inserted.
    async fn insert_many(&self, entries: Vec<MemoryEntry>) -> Result<usize, MemoryError>;

    /// Flip every Hot entry of `scope` to Cold and return how many changed.
    async fn demote_hot(&self, scope: &MemoryScope) -> Result<usize, MemoryError>;
}

fn check_dynamic(entries: &[MemoryEntry]) -> Result<(), MemoryError> {
    if entries.iter().all(MemoryEntry::is_dynamic) {
        Ok(())
    } else {
        Err(MemoryError::NotDynamic)
    }
}

/// Append the entries of `incoming` whose ids `stored` does not hold yet.
fn append_new(stored: &mut Vec<MemoryEntry>, incoming: Vec<MemoryEntry>) -> usize {
    let mut ids: HashSet<MemoryId> = stored.iter().map(|e| e.id).collect();
    let before = stored.len();
    stored.extend(incoming.into_iter().filter(|e| ids.insert(e.id)));
    stored.len() - before
}

fn demote(entries: &mut [MemoryEntry], scope: &MemoryScope) -> usize {
    let mut changed = 0;
    for entry in entries.iter_mut().filter(|e| e.belongs_to(scope) && e.is_hot()) {
        entry.tier = MemoryTier::Cold;
        changed += 1;
    }
    changed
}

/// Tier bookkeeping on top of a [`MemoryRepository`].
#[derive(Clone)]
pub struct MemoryStore {
    repo: Arc<dyn MemoryRepository>,
}

impl MemoryStore {
    pub fn new(repo: Arc<dyn MemoryRepository>) -> Self {
        Self { repo }
    }

    /// Baseline entries plus the scope's stored dynamic entries, split by tier.
    pub async fn working_set(
        &self,
        baseline: Vec<MemoryEntry>,
        scope: &MemoryScope,
    ) -> Result<WorkingMemory, MemoryError> {
        let dynamic = self.repo.scope_entries(scope).await?;
        Ok(WorkingMemory::assemble(baseline, dynamic))
    }

    /// Persist the Hot/Cold pair written after an exchange.
    ///
    /// Returns `false` when the pair was already stored by an earlier
    /// attempt at the same turn.
    pub async fn record_exchange(&self, pair: [MemoryEntry; 2]) -> Result<bool, MemoryError> {
        Ok(self.repo.insert_many(pair.into()).await? > 0)
    }

    /// Demote the scope's dynamic hot entries, then store the summaries as hot.
    pub async fn commit_consolidation(
        &self,
        scope: &MemoryScope,
        plan: &ConsolidationPlan,
    ) -> Result<usize, MemoryError> {
        let demoted = self.repo.demote_hot(scope).await?;
        self.repo.insert_many(plan.summaries.clone()).await?;
        Ok(demoted)
    }
}

/// Process-local collection, used in tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryMemoryRepository {
    entries: RwLock<Vec<MemoryEntry>>,
}

impl InMemoryMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored entry regardless of scope.
    pub async fn all(&self) -> Vec<MemoryEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl MemoryRepository for InMemoryMemoryRepository {
    async fn scope_entries(&self, scope: &MemoryScope) -> Result<Vec<MemoryEntry>, MemoryError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.belongs_to(scope))
            .cloned()
            .collect())
    }

    async fn insert_many(&self, entries: Vec<MemoryEntry>) -> Result<usize, MemoryError> {
        check_dynamic(&entries)?;
        Ok(append_new(&mut *self.entries.write().await, entries))
    }

    async fn demote_hot(&self, scope: &MemoryScope) -> Result<usize, MemoryError> {
        Ok(demote(&mut self.entries.write().await, scope))
    }
}

/// Collection kept in a single pretty-printed JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the original,
/// so a crash mid-write leaves the previous collection intact.
pub struct JsonFileMemoryRepository {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonFileMemoryRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<MemoryEntry>, MemoryError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &[MemoryEntry]) -> Result<(), MemoryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl MemoryRepository for JsonFileMemoryRepository {
    async fn scope_entries(&self, scope: &MemoryScope) -> Result<Vec<MemoryEntry>, MemoryError> {
        let _guard = self.lock.read().await;
        let entries = self.load().await?;
        Ok(entries.into_iter().filter(|e| e.belongs_to(scope)).collect())
    }

    async fn insert_many(&self, entries: Vec<MemoryEntry>) -> Result<usize, MemoryError> {
        check_dynamic(&entries)?;
        let _guard = self.lock.write().await;
        let mut stored = self.load().await?;
        let inserted = append_new(&mut stored, entries);
        if inserted > 0 {
            self.save(&stored).await?;
        }
        Ok(inserted)
    }

    async fn demote_hot(&self, scope: &MemoryScope) -> Result<usize, MemoryError> {
        let _guard = self.lock.write().await;
        let mut stored = self.load().await?;
        let changed = demote(&mut stored, scope);
        if changed > 0 {
            self.save(&stored).await?;
        }
        Ok(changed)
    }
}
