use std::collections::HashMap;

use tracing::debug;

use crate::api::datum::Datum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    First,
    Duplicate,
}

/// Idempotency gate for one invocation, keyed on `metadata.id`.
///
/// Datums without an id cannot be told apart from their redeliveries, they are always
/// admitted and counted as untracked.
#[derive(Debug, Default)]
pub struct Deduplicator {
    /// Highest `num_delivered` seen per id.
    seen: HashMap<String, u64>,
    duplicates: u64,
    untracked: u64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, datum: &Datum) -> Admission {
        let metadata = &datum.metadata;
        if metadata.id.is_empty() {
            self.untracked += 1;
            return Admission::First;
        }

        match self.seen.get_mut(&metadata.id) {
            None => {
                self.seen
                    .insert(metadata.id.clone(), metadata.num_delivered);
                Admission::First
            }
            Some(max_delivery) => {
                *max_delivery = (*max_delivery).max(metadata.num_delivered);
                self.duplicates += 1;
                debug!(
                    "duplicate delivery of {} (num_delivered={})",
                    metadata.id, metadata.num_delivered
                );
                Admission::Duplicate
            }
        }
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn untracked(&self) -> u64 {
        self.untracked
    }

    pub fn max_delivery(&self, id: &str) -> Option<u64> {
        self.seen.get(id).copied()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
