use std::collections::VecDeque;

use custody_core::{CorrelationId, PoolKey, TrackingCode};

use crate::transfer::TransferState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub correlation_id: CorrelationId,
    pub tracking_code: TrackingCode,
    pub from: PoolKey,
    pub to: PoolKey,
    pub state: TransferState,
    /// `TransferError::kind_str` for failed transfers.
    pub error_kind: Option<&'static str>,
}

/// Bounded record of terminal transfers, oldest dropped first.
#[derive(Debug)]
pub struct TransferJournal {
    entries: VecDeque<JournalEntry>,
    max_depth: usize,
}

impl TransferJournal {
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_depth,
        }
    }

    pub fn push(&mut self, entry: JournalEntry) {
        self.entries.push_back(entry);
        if self.entries.len() > self.max_depth {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    /// Most recent entry for `code`.
    pub fn last_for(&self, code: &TrackingCode) -> Option<&JournalEntry> {
        self.entries.iter().rev().find(|e| &e.tracking_code == code)
    }
}
