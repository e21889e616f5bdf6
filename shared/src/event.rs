use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::FieldId;

const EVENT_BUFFER: usize = 64;

/// Notifications the editor emits so shells know when to re-render.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum EditorEvent {
    EditStarted { field: FieldId },
    EditEnded { field: FieldId },
    ValueChanged { field: FieldId },
    UndoShown { field: FieldId },
    UndoHidden { field: FieldId },
    Saved { field: FieldId },
    SaveFailed { field: FieldId, message: String },
    Reverted { field: FieldId },
}

impl EditorEvent {
    pub fn field(&self) -> &FieldId {
        match self {
            Self::EditStarted { field }
            | Self::EditEnded { field }
            | Self::ValueChanged { field }
            | Self::UndoShown { field }
            | Self::UndoHidden { field }
            | Self::Saved { field }
            | Self::SaveFailed { field, .. }
            | Self::Reverted { field } => field,
        }
    }
}

/// Fan-out of editor events. Sending never fails: with no subscribers the
/// event is dropped.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: broadcast::Sender<EditorEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EditorEvent> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: EditorEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
