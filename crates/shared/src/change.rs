use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::StorageHandle;

/// Effect of one committed transaction on the persisted record set.
///
/// An event with all three sets empty is still meaningful: it marks a change
/// to transient UI-only state that downstream projections must pick up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub inserted: BTreeSet<StorageHandle>,
    pub updated: BTreeSet<StorageHandle>,
    pub deleted: BTreeSet<StorageHandle>,
}

impl ChangeEvent {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    /// Folds `other` into `self`. A handle inserted and deleted within the
    /// merged span disappears entirely; an update to an inserted handle stays
    /// an insert.
    pub fn merge(&mut self, other: ChangeEvent) {
        for handle in other.inserted {
            self.inserted.insert(handle);
        }
        for handle in other.updated {
            if !self.inserted.contains(&handle) {
                self.updated.insert(handle);
            }
        }
        for handle in other.deleted {
            self.updated.remove(&handle);
            if !self.inserted.remove(&handle) {
                self.deleted.insert(handle);
            }
        }
    }
}
