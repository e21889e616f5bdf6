//! Editable-field state machine.
//!
//! A form is either idle or editing exactly one field. Each field keeps the
//! value it had when its edit session started; undo always returns to that
//! snapshot, however many keystrokes happened since. The undo affordance is
//! shown while the buffer differs from the snapshot and hides itself after
//! a quiet period (5 s after typing, 2 s after a save).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::undo::UndoEntry;
use crate::event::{EditorEvent, Notifier};
use crate::model::FieldId;
use crate::{AppError, ErrorKind, POST_SAVE_UNDO_WINDOW, UNDO_WINDOW};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SaveError {
    #[error("{message}")]
    Invalid { field: FieldId, message: String },

    #[error("unknown field '{0}'")]
    UnknownField(FieldId),

    #[error("{}", .0.user_facing_message())]
    Failed(AppError),
}

impl From<AppError> for SaveError {
    fn from(e: AppError) -> Self {
        SaveError::Failed(e)
    }
}

impl SaveError {
    /// Server-side validation rejections become `Invalid` so the message
    /// shows under the field; everything else is `Failed`.
    pub fn for_field(field: &FieldId, error: AppError) -> Self {
        if error.kind == ErrorKind::Validation {
            SaveError::Invalid {
                field: field.clone(),
                message: error.user_facing_message(),
            }
        } else {
            SaveError::Failed(error)
        }
    }

    /// Text for the inline error under the field.
    pub fn inline_message(&self) -> String {
        self.to_string()
    }
}

/// Persists one field. Implemented by the resource layer (contact and
/// profile savers) and by test doubles.
#[async_trait::async_trait]
pub trait FieldSaver: Send + Sync {
    async fn save(&self, field: &FieldId, value: &str) -> Result<(), SaveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Value equal to the session snapshot; nothing was sent.
    Unchanged,
    Saved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabDirection {
    Forward,
    Backward,
}

/// The field after (or before) `current` in `order`, wrapping. With no
/// current field, the first (or last).
pub fn tab_target(
    order: &[FieldId],
    current: Option<&FieldId>,
    direction: TabDirection,
) -> Option<FieldId> {
    if order.is_empty() {
        return None;
    }
    let len = order.len();
    let position = current.and_then(|c| order.iter().position(|f| f == c));
    let next = match (position, direction) {
        (Some(i), TabDirection::Forward) => (i + 1) % len,
        (Some(i), TabDirection::Backward) => (i + len - 1) % len,
        (None, TabDirection::Forward) => 0,
        (None, TabDirection::Backward) => len - 1,
    };
    Some(order[next].clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorTiming {
    pub undo_window: Duration,
    pub post_save_undo_window: Duration,
}

impl Default for EditorTiming {
    fn default() -> Self {
        Self {
            undo_window: UNDO_WINDOW,
            post_save_undo_window: POST_SAVE_UNDO_WINDOW,
        }
    }
}

#[derive(Debug, Default)]
struct EditorState {
    order: Vec<FieldId>,
    values: HashMap<FieldId, String>,
    undo: HashMap<FieldId, UndoEntry>,
    editing: Option<FieldId>,
}

impl EditorState {
    fn entry(&mut self, field: &FieldId) -> &mut UndoEntry {
        self.undo.entry(field.clone()).or_default()
    }

    fn begin_session(&mut self, field: &FieldId, notifier: &Notifier) {
        let current = self.values.get(field).cloned();
        let entry = self.entry(field);
        let was_shown = entry.show_undo;
        entry.original_value = current;
        entry.show_undo = false;
        entry.timer.cancel();
        self.editing = Some(field.clone());
        if was_shown {
            notifier.send(EditorEvent::UndoHidden {
                field: field.clone(),
            });
        }
        notifier.send(EditorEvent::EditStarted {
            field: field.clone(),
        });
    }

    fn end_session(&mut self, notifier: &Notifier) -> Option<FieldId> {
        let field = self.editing.take()?;
        notifier.send(EditorEvent::EditEnded {
            field: field.clone(),
        });
        Some(field)
    }
}

/// Field buffers plus edit/undo state for one form. Cloning is cheap and
/// clones share state; timers stop once the last clone is dropped.
#[derive(Clone)]
pub struct FieldEditor {
    state: Arc<Mutex<EditorState>>,
    saver: Arc<dyn FieldSaver>,
    notifier: Notifier,
    timing: EditorTiming,
}

impl FieldEditor {
    /// Blank buffers for `ids`, in tab order.
    pub fn new<I, F>(ids: I, saver: Arc<dyn FieldSaver>) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldId>,
    {
        Self::with_values(ids.into_iter().map(|id| (id, String::new())), saver)
    }

    /// Buffers seeded from entity data, in tab order.
    pub fn with_values<I, F, V>(values: I, saver: Arc<dyn FieldSaver>) -> Self
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<FieldId>,
        V: Into<String>,
    {
        let mut state = EditorState::default();
        for (id, value) in values {
            let id = id.into();
            if state.values.insert(id.clone(), value.into()).is_none() {
                state.order.push(id);
            }
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            saver,
            notifier: Notifier::new(),
            timing: EditorTiming::default(),
        }
    }

    #[must_use]
    pub fn with_timing(mut self, timing: EditorTiming) -> Self {
        self.timing = timing;
        self
    }

    fn lock(&self) -> MutexGuard<'_, EditorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EditorEvent> {
        self.notifier.subscribe()
    }

    pub fn fields(&self) -> Vec<FieldId> {
        self.lock().order.clone()
    }

    pub fn editing_field(&self) -> Option<FieldId> {
        self.lock().editing.clone()
    }

    pub fn is_editing(&self, field: &FieldId) -> bool {
        self.lock().editing.as_ref() == Some(field)
    }

    pub fn value(&self, field: &FieldId) -> Option<String> {
        self.lock().values.get(field).cloned()
    }

    pub fn values(&self) -> HashMap<FieldId, String> {
        self.lock().values.clone()
    }

    pub fn show_undo(&self, field: &FieldId) -> bool {
        self.lock().undo.get(field).is_some_and(|e| e.show_undo)
    }

    pub fn original_value(&self, field: &FieldId) -> Option<String> {
        self.lock()
            .undo
            .get(field)
            .and_then(|e| e.original_value.clone())
    }

    /// Replaces a buffer with fresh server data. Ignored while that field is
    /// being edited so refetches never clobber typing.
    pub fn seed(&self, field: &FieldId, value: impl Into<String>) {
        let mut state = self.lock();
        if state.editing.as_ref() == Some(field) {
            return;
        }
        if state.values.insert(field.clone(), value.into()).is_none() {
            state.order.push(field.clone());
        }
    }

    /// Opens `field` for editing. Returns `false` when another field was
    /// open: that field is closed (unsaved) and the caller must start again.
    pub fn handle_edit_start(&self, field: &FieldId) -> bool {
        let mut state = self.lock();
        if !state.values.contains_key(field) {
            warn!(%field, "edit start on unknown field");
            return false;
        }
        match state.editing.clone() {
            None => {
                state.begin_session(field, &self.notifier);
                debug!(%field, "edit started");
                true
            }
            Some(current) if &current == field => true,
            Some(current) => {
                state.end_session(&self.notifier);
                debug!(closed = %current, requested = %field, "closed other field");
                false
            }
        }
    }

    /// Moves straight to the next (or previous) field in `order`, wrapping
    /// at both ends. From idle, starts at the first (or last) field.
    pub fn handle_tab_navigation(
        &self,
        order: &[FieldId],
        direction: TabDirection,
    ) -> Option<FieldId> {
        let mut state = self.lock();
        let target = tab_target(order, state.editing.as_ref(), direction)?;
        if !state.values.contains_key(&target) {
            warn!(field = %target, "tab target is not a field of this form");
            return None;
        }

        if state.editing.as_ref() != Some(&target) {
            state.end_session(&self.notifier);
            state.begin_session(&target, &self.notifier);
        }
        Some(target)
    }

    /// Tab navigation over the form's own field order.
    pub fn tab(&self, direction: TabDirection) -> Option<FieldId> {
        let order = self.fields();
        self.handle_tab_navigation(&order, direction)
    }

    /// Writes the buffer. A value that differs from the session snapshot
    /// shows undo and restarts the hide timer; an equal value leaves undo
    /// state as it was.
    pub fn update_field_value(&self, field: &FieldId, value: impl Into<String>) {
        let value = value.into();
        let mut state = self.lock();
        if !state.values.contains_key(field) {
            warn!(%field, "update on unknown field");
            return;
        }
        state.values.insert(field.clone(), value.clone());
        self.notifier.send(EditorEvent::ValueChanged {
            field: field.clone(),
        });

        let entry = state.entry(field);
        let differs = entry
            .original_value
            .as_deref()
            .is_some_and(|original| original != value);
        if differs {
            let newly_shown = !entry.show_undo;
            entry.show_undo = true;
            self.arm_hide(entry, field, self.timing.undo_window);
            if newly_shown {
                self.notifier.send(EditorEvent::UndoShown {
                    field: field.clone(),
                });
            }
        }
    }

    fn arm_hide(&self, entry: &mut UndoEntry, field: &FieldId, delay: Duration) {
        let weak: Weak<Mutex<EditorState>> = Arc::downgrade(&self.state);
        let notifier = self.notifier.clone();
        let field = field.clone();
        entry.timer.arm(delay, move |generation| {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = state.undo.get_mut(&field) else {
                return;
            };
            if entry.timer.fired(generation) && entry.show_undo {
                entry.show_undo = false;
                debug!(%field, "undo window closed");
                notifier.send(EditorEvent::UndoHidden { field });
            }
        });
    }

    fn hide_undo(&self, state: &mut EditorState, field: &FieldId) {
        let entry = state.entry(field);
        let was_shown = entry.show_undo;
        entry.show_undo = false;
        entry.timer.cancel();
        if was_shown {
            self.notifier.send(EditorEvent::UndoHidden {
                field: field.clone(),
            });
        }
    }

    /// Persists the field if it changed during this session. On failure the
    /// field stays open with the user's input intact.
    pub async fn save_field(&self, field: &FieldId) -> Result<SaveOutcome, SaveError> {
        self.persist(field, true).await
    }

    /// Like [`save_field`](Self::save_field) but the field stays open, so a
    /// following [`handle_tab_navigation`](Self::handle_tab_navigation)
    /// jumps straight from it.
    pub async fn save_field_in_place(&self, field: &FieldId) -> Result<SaveOutcome, SaveError> {
        self.persist(field, false).await
    }

    #[instrument(skip(self))]
    async fn persist(&self, field: &FieldId, close: bool) -> Result<SaveOutcome, SaveError> {
        let value = {
            let mut state = self.lock();
            let Some(value) = state.values.get(field).cloned() else {
                return Err(SaveError::UnknownField(field.clone()));
            };
            let unchanged = state
                .undo
                .get(field)
                .and_then(|e| e.original_value.as_deref())
                .map_or(true, |original| original == value);
            if unchanged {
                self.hide_undo(&mut state, field);
                if close && state.editing.as_ref() == Some(field) {
                    state.end_session(&self.notifier);
                }
                debug!("unchanged, nothing to save");
                return Ok(SaveOutcome::Unchanged);
            }
            value
        };

        if let Err(e) = self.saver.save(field, &value).await {
            warn!(error = %e, "save failed, field stays open");
            self.notifier.send(EditorEvent::SaveFailed {
                field: field.clone(),
                message: e.inline_message(),
            });
            return Err(e);
        }

        let mut state = self.lock();
        if close && state.editing.as_ref() == Some(field) {
            state.end_session(&self.notifier);
        }
        let entry = state.entry(field);
        let newly_shown = !entry.show_undo;
        entry.show_undo = true;
        self.arm_hide(entry, field, self.timing.post_save_undo_window);
        self.notifier.send(EditorEvent::Saved {
            field: field.clone(),
        });
        if newly_shown {
            self.notifier.send(EditorEvent::UndoShown {
                field: field.clone(),
            });
        }
        debug!("saved");
        Ok(SaveOutcome::Saved)
    }

    /// Restores the session snapshot and persists it. Returns `false` when
    /// the field has no snapshot to return to. Edit state is left alone.
    ///
    /// If the save fails the buffer goes back to the value it held before
    /// the undo and undo is offered again.
    #[instrument(skip(self))]
    pub async fn undo(&self, field: &FieldId) -> Result<bool, SaveError> {
        let (original, replaced) = {
            let mut state = self.lock();
            let Some(current) = state.values.get(field).cloned() else {
                return Err(SaveError::UnknownField(field.clone()));
            };
            let Some(original) = state.undo.get(field).and_then(|e| e.original_value.clone())
            else {
                return Ok(false);
            };
            state.values.insert(field.clone(), original.clone());
            self.hide_undo(&mut state, field);
            (original, current)
        };
        self.notifier.send(EditorEvent::Reverted {
            field: field.clone(),
        });

        if let Err(e) = self.saver.save(field, &original).await {
            warn!(error = %e, "saving reverted value failed");
            let mut state = self.lock();
            if state.values.get(field) == Some(&original) {
                state.values.insert(field.clone(), replaced);
                self.notifier.send(EditorEvent::ValueChanged {
                    field: field.clone(),
                });
            }
            let entry = state.entry(field);
            entry.show_undo = true;
            self.arm_hide(entry, field, self.timing.undo_window);
            self.notifier.send(EditorEvent::UndoShown {
                field: field.clone(),
            });
            self.notifier.send(EditorEvent::SaveFailed {
                field: field.clone(),
                message: e.inline_message(),
            });
            return Err(e);
        }
        Ok(true)
    }

    /// Discards the open field's edits and closes it.
    pub fn cancel_edit(&self) -> Option<FieldId> {
        let mut state = self.lock();
        let field = state.editing.clone()?;
        if let Some(original) = state.undo.get(&field).and_then(|e| e.original_value.clone()) {
            state.values.insert(field.clone(), original);
            self.notifier.send(EditorEvent::Reverted {
                field: field.clone(),
            });
        }
        self.hide_undo(&mut state, &field);
        state.end_session(&self.notifier)
    }

    /// Closes the open field without saving or reverting.
    pub fn handle_edit_end(&self) {
        let mut state = self.lock();
        state.end_session(&self.notifier);
    }
}

impl std::fmt::Debug for FieldEditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FieldEditor")
            .field("fields", &state.order)
            .field("editing", &state.editing)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}
