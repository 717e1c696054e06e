//! Per-turn view of a persona's memories.

use super::entry::{MemoryEntry, MemoryId, MemoryTier};
use std::collections::HashSet;

/// Hot and cold sets for a single turn.
///
/// Built fresh at the start of each turn from baseline and stored dynamic
/// entries, then passed by reference through promotion, prompt composition
/// and consolidation.
#[derive(Debug, Clone, Default)]
pub struct WorkingMemory {
    hot: Vec<MemoryEntry>,
    cold: Vec<MemoryEntry>,
    base_hot_count: usize,
    promoted: HashSet<MemoryId>,
}

impl WorkingMemory {
    /// Split baseline and stored dynamic entries by tier.
    ///
    /// The baseline Hot count is captured here, before any promotion, and
    /// serves as the consolidation floor for the rest of the turn.
    pub fn assemble(baseline: Vec<MemoryEntry>, dynamic: Vec<MemoryEntry>) -> Self {
        let base_hot_count = baseline.iter().filter(|e| e.is_hot()).count();
        let (hot, cold) = baseline
            .into_iter()
            .chain(dynamic)
            .partition(MemoryEntry::is_hot);

        Self {
            hot,
            cold,
            base_hot_count,
            promoted: HashSet::new(),
        }
    }

    pub fn hot(&self) -> &[MemoryEntry] {
        &self.hot
    }

    pub fn cold(&self) -> &[MemoryEntry] {
        &self.cold
    }

    pub fn base_hot_count(&self) -> usize {
        self.base_hot_count
    }

    /// Capacity the hot tier is consolidated down to.
    pub fn target(&self, min_capacity: usize) -> usize {
        min_capacity.max(self.base_hot_count)
    }

    pub fn is_promoted(&self, id: MemoryId) -> bool {
        self.promoted.contains(&id)
    }

    /// Move the cold entries at the given 0-based positions into the hot set.
    ///
    /// Promoted entries keep their stored Cold tier; only [`is_promoted`]
    /// tells them apart. Out-of-range and repeated positions are ignored.
    /// Returns how many entries were promoted.
    ///
    /// [`is_promoted`]: WorkingMemory::is_promoted
    pub fn promote(&mut self, positions: &[usize]) -> usize {
        let wanted: HashSet<usize> = positions.iter().copied().filter(|&i| i < self.cold.len()).collect();
        if wanted.is_empty() {
            return 0;
        }

        let mut kept = Vec::with_capacity(self.cold.len());
        for (i, entry) in std::mem::take(&mut self.cold).into_iter().enumerate() {
            if wanted.contains(&i) {
                self.promoted.insert(entry.id);
                self.hot.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.cold = kept;
        wanted.len()
    }

    /// Add a freshly created entry to the matching set.
    ///
    /// An entry whose id is already present is ignored.
    pub fn record(&mut self, entry: MemoryEntry) {
        if self.hot.iter().chain(self.cold.iter()).any(|e| e.id == entry.id) {
            return;
        }
        match entry.tier {
            MemoryTier::Hot => self.hot.push(entry),
            MemoryTier::Cold => self.cold.push(entry),
        }
    }

    pub fn needs_consolidation(&self, target: usize) -> bool {
        self.hot.len() > target
    }

    /// Mirror a consolidation pass: dynamic hot entries and promotions go
    /// cold, baseline hot entries stay, `summaries` become the new dynamic hot.
    pub fn apply_consolidation(&mut self, summaries: Vec<MemoryEntry>) {
        let mut hot = Vec::with_capacity(self.base_hot_count + summaries.len());
        for mut entry in std::mem::take(&mut self.hot) {
            if entry.is_dynamic() || self.promoted.contains(&entry.id) {
                entry.tier = MemoryTier::Cold;
                self.cold.push(entry);
            } else {
                hot.push(entry);
            }
        }
        hot.extend(summaries);
        self.hot = hot;
        self.promoted.clear();
    }

    /// Hot then cold entries, as stored alongside each log line.
    ///
    /// Tiers are the stored ones, so a promoted entry still reads Cold.
    pub fn snapshot(&self) -> Vec<MemoryEntry> {
        self.hot.iter().chain(self.cold.iter()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryScope;

    fn scope() -> MemoryScope {
        MemoryScope::new("agent", "user", "act", "S1")
    }

    fn working() -> WorkingMemory {
        WorkingMemory::assemble(
            vec![
                MemoryEntry::baseline("agent", MemoryTier::Hot, "Speaks formally"),
                MemoryEntry::baseline("agent", MemoryTier::Hot, "Runs a bakery"),
                MemoryEntry::baseline("agent", MemoryTier::Cold, "Allergic to cats"),
            ],
            vec![
                MemoryEntry::dynamic(&scope(), MemoryTier::Hot, "Learner asked about bread"),
                MemoryEntry::dynamic(&scope(), MemoryTier::Cold, "Learner asked about bread"),
            ],
        )
    }

    #[test]
    fn test_base_hot_count_ignores_dynamic_entries() {
        let memory = working();
        assert_eq!(memory.base_hot_count(), 2);
        assert_eq!(memory.hot().len(), 3);
        assert_eq!(memory.cold().len(), 2);
        assert_eq!(memory.target(3), 3);
    }

    #[test]
    fn test_promote_moves_cold_to_hot() {
        let mut memory = working();
        assert_eq!(memory.promote(&[0, 0, 7]), 1);

        assert_eq!(memory.hot().len(), 4);
        assert_eq!(memory.cold().len(), 1);
        let promoted = memory.hot().last().unwrap();
        assert_eq!(promoted.content, "Allergic to cats");
        assert!(memory.is_promoted(promoted.id));
        assert_eq!(promoted.tier, MemoryTier::Cold);
        // Promotion does not raise the consolidation floor.
        assert_eq!(memory.base_hot_count(), 2);
    }

    #[test]
    fn test_snapshot_keeps_stored_tiers() {
        let mut memory = working();
        memory.promote(&[0]);

        let snapshot = memory.snapshot();
        let cats = snapshot.iter().find(|e| e.content == "Allergic to cats").unwrap();
        assert_eq!(cats.tier, MemoryTier::Cold);
        assert_eq!(snapshot.iter().filter(|e| e.is_hot()).count(), 3);
    }

    #[test]
    fn test_record_ignores_known_ids() {
        let mut memory = working();
        let [hot, cold] = MemoryEntry::exchange_pair(&scope(), "greeting", 1, "hi", "hello");
        memory.record(hot.clone());
        memory.record(cold);
        memory.record(hot);

        assert_eq!(memory.hot().len(), 4);
        assert_eq!(memory.cold().len(), 3);
    }

    #[test]
    fn test_apply_consolidation_keeps_baseline_hot() {
        let mut memory = working();
        memory.promote(&[0]);
        memory.apply_consolidation(vec![
            MemoryEntry::dynamic(&scope(), MemoryTier::Hot, "summary 1"),
        ]);

        let hot: Vec<_> = memory.hot().iter().map(|e| e.content.as_str()).collect();
        assert_eq!(hot, vec!["Speaks formally", "Runs a bakery", "summary 1"]);
        assert_eq!(memory.cold().len(), 3);
        assert!(memory.cold().iter().all(|e| e.tier == MemoryTier::Cold));
        assert_eq!(memory.snapshot().len(), 6);
    }
}
