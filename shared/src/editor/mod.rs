//! Inline editing: the per-field state machine, the undo primitives it is
//! built on, and the form layer shells talk to.

mod fields;
mod form;
mod undo;

pub use self::fields::{
    tab_target, EditorTiming, FieldEditor, FieldSaver, SaveError, SaveOutcome, TabDirection,
};
pub use self::form::{
    EditableForm, FieldConfig, FieldKind, FieldView, FormError, InputKind, Keyboard, Platform,
    Validator,
};
pub use self::undo::{UndoEntry, UndoTimer, UndoableState};

