//! Process-local record of work items already handed to execution.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::model::WorkId;

/// Append-only set of work ids this process has taken on.
///
/// Entries are never removed, so memory grows with the number of items
/// executed over the life of the session.
#[derive(Debug, Default)]
pub struct DedupLedger {
    seen: Mutex<HashSet<WorkId>>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`. Returns `true` only for the first caller.
    ///
    /// Callers must record before their first await; two refreshes racing
    /// over the same item then cannot both win.
    pub fn record(&self, id: &WorkId) -> bool {
        self.seen.lock().insert(id.clone())
    }

    pub fn contains(&self, id: &WorkId) -> bool {
        self.seen.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_record_wins() {
        let ledger = DedupLedger::new();
        let id = WorkId::from("w1");
        assert!(ledger.record(&id));
        assert!(!ledger.record(&id));
        assert!(ledger.contains(&id));
        assert_eq!(ledger.len(), 1);
    }
}
