use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(RecordId);
id_newtype!(StorageHandle);

impl RecordId {
    /// Negative ids belong to records the remote has not confirmed yet.
    pub fn is_pending(self) -> bool {
        self.0 < 0
    }

    pub fn magnitude(self) -> u64 {
        self.0.unsigned_abs()
    }

    /// The id the remote assigns when it confirms a pending record.
    pub fn confirmed_counterpart(self) -> RecordId {
        RecordId(self.0.wrapping_abs())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub title: Option<String>,
    pub completed: bool,
    #[serde(default)]
    pub soft_deleted: bool,
    /// Absent until the record has been written to storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_handle: Option<StorageHandle>,
}

impl Record {
    pub fn new(id: RecordId, title: Option<String>, completed: bool) -> Self {
        Self {
            id,
            title,
            completed,
            soft_deleted: false,
            storage_handle: None,
        }
    }

    pub fn pending(id: RecordId) -> Self {
        Self::new(id, None, false)
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_pending()
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("(Untitled)")
    }
}

/// Orders records the way every reader sees them: by id magnitude, so a
/// pending record sits where its confirmed counterpart will land.
pub fn display_order(a: &Record, b: &Record) -> std::cmp::Ordering {
    a.id.magnitude()
        .cmp(&b.id.magnitude())
        .then_with(|| a.storage_handle.cmp(&b.storage_handle))
}
