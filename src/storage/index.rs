//! Structured results of index maintenance

use super::schema::{IndexDef, IndexKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    Dropped,
    Created,
    Failed(String),
}

/// Result of one index operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStatus {
    pub name: &'static str,
    pub table: &'static str,
    pub column: &'static str,
    pub outcome: IndexOutcome,
}

impl IndexStatus {
    pub(crate) fn new(def: &IndexDef, outcome: IndexOutcome) -> Self {
        Self {
            name: def.name,
            table: def.table,
            column: def.column,
            outcome,
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self.outcome, IndexOutcome::Failed(_))
    }
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            IndexOutcome::Dropped => write!(f, "{} on {}({}): dropped", self.name, self.table, self.column),
            IndexOutcome::Created => write!(f, "{} on {}({}): created", self.name, self.table, self.column),
            IndexOutcome::Failed(reason) => {
                write!(f, "{} on {}({}): failed: {}", self.name, self.table, self.column, reason)
            }
        }
    }
}

/// Per-index report for one group of indexes
#[derive(Debug, Clone)]
pub struct IndexReport {
    pub kind: IndexKind,
    pub statuses: Vec<IndexStatus>,
}

impl IndexReport {
    pub fn failures(&self) -> impl Iterator<Item = &IndexStatus> {
        self.statuses.iter().filter(|s| !s.is_ok())
    }

    pub fn is_ok(&self) -> bool {
        self.statuses.iter().all(IndexStatus::is_ok)
    }
}
