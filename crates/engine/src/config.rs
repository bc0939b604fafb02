use serde::{Deserialize, Serialize};

use custody_core::InsertPosition;

const DEFAULT_JOURNAL_DEPTH: usize = 100;

/// When confirmed transfers get their views refetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Mark stale; the next `get_view` refetches.
    #[default]
    Lazy,
    /// Refetch registered views of both pools before the transfer resolves.
    Eager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Insert position for views registered without one.
    pub default_insert_position: InsertPosition,
    pub reconcile: ReconcileMode,
    /// Terminal transfers kept for diagnostics.
    pub journal_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_insert_position: InsertPosition::Head,
            reconcile: ReconcileMode::Lazy,
            journal_depth: DEFAULT_JOURNAL_DEPTH,
        }
    }
}
