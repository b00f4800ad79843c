use serde::{Deserialize, Serialize};

use crate::{
    domain::{Record, RecordId},
    error::RemoteError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Action {
    Create,
    BeginEditTitle {
        id: RecordId,
    },
    UpdateTitle {
        id: RecordId,
        text: String,
    },
    Delete {
        id: RecordId,
    },
    SetCompleted {
        id: RecordId,
        completed: bool,
    },
    DeleteAllCompleted,
    RemoteCreateSucceeded {
        temp_id: RecordId,
        confirmed: Record,
    },
    RemoteCreateFailed {
        temp_id: RecordId,
        error: RemoteError,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::BeginEditTitle { .. } => "begin_edit_title",
            Action::UpdateTitle { .. } => "update_title",
            Action::Delete { .. } => "delete",
            Action::SetCompleted { .. } => "set_completed",
            Action::DeleteAllCompleted => "delete_all_completed",
            Action::RemoteCreateSucceeded { .. } => "remote_create_succeeded",
            Action::RemoteCreateFailed { .. } => "remote_create_failed",
        }
    }

    pub fn target(&self) -> Option<RecordId> {
        match self {
            Action::BeginEditTitle { id }
            | Action::UpdateTitle { id, .. }
            | Action::Delete { id }
            | Action::SetCompleted { id, .. } => Some(*id),
            Action::RemoteCreateSucceeded { temp_id, .. }
            | Action::RemoteCreateFailed { temp_id, .. } => Some(*temp_id),
            Action::Create | Action::DeleteAllCompleted => None,
        }
    }
}
