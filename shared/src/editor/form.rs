use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::fields::{EditorTiming, FieldEditor, FieldSaver, SaveError, SaveOutcome, TabDirection};
use crate::model::{email_issue, FieldId};

const PHONE_MIN_DIGITS: usize = 7;
const PHONE_MAX_DIGITS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Multiline,
    Email,
    Phone,
    Url,
    Username,
}

type CustomCheck = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A rule run against the buffered value before it is saved. Rules other
/// than `Required` pass on an empty value.
#[derive(Clone)]
pub enum Validator {
    Required,
    Email,
    Phone,
    MaxLength(usize),
    MinLength(usize),
    Url,
    Custom(CustomCheck),
}

impl Validator {
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Validator::Custom(Arc::new(check))
    }

    /// Error message for `value`, if it breaks this rule.
    pub fn check(&self, label: &str, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return matches!(self, Validator::Required).then(|| format!("{label} is required"));
        }
        match self {
            Validator::Required => None,
            Validator::Email => email_issue(trimmed).map(|m| format!("{label} {m}")),
            Validator::Phone => (!is_plausible_phone(trimmed))
                .then(|| format!("{label} must be a valid phone number")),
            Validator::MaxLength(max) => (trimmed.chars().count() > *max)
                .then(|| format!("{label} must be at most {max} characters")),
            Validator::MinLength(min) => (trimmed.chars().count() < *min)
                .then(|| format!("{label} must be at least {min} characters")),
            Validator::Url => (!is_web_url(trimmed)).then(|| format!("{label} must be a valid URL")),
            Validator::Custom(check) => check(trimmed),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Required => f.write_str("Required"),
            Validator::Email => f.write_str("Email"),
            Validator::Phone => f.write_str("Phone"),
            Validator::MaxLength(n) => f.debug_tuple("MaxLength").field(n).finish(),
            Validator::MinLength(n) => f.debug_tuple("MinLength").field(n).finish(),
            Validator::Url => f.write_str("Url"),
            Validator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn is_plausible_phone(value: &str) -> bool {
    let allowed = |c: char| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')' | '.');
    if !value.chars().all(allowed) {
        return false;
    }
    let digits = value.chars().filter(char::is_ascii_digit).count();
    (PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&digits)
}

fn is_web_url(value: &str) -> bool {
    url::Url::parse(value)
        .is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
}

#[derive(Debug, Clone)]
pub struct FieldConfig {
    pub id: FieldId,
    pub label: String,
    pub kind: FieldKind,
    pub validators: Vec<Validator>,
    pub required: bool,
}

impl FieldConfig {
    /// A field with the validator its kind implies (`Email`, `Phone`, `Url`).
    pub fn new(id: impl Into<FieldId>, label: impl Into<String>, kind: FieldKind) -> Self {
        let validators = match kind {
            FieldKind::Email => vec![Validator::Email],
            FieldKind::Phone => vec![Validator::Phone],
            FieldKind::Url => vec![Validator::Url],
            FieldKind::Text | FieldKind::Multiline | FieldKind::Username => Vec::new(),
        };
        Self {
            id: id.into(),
            label: label.into(),
            kind,
            validators,
            required: false,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// First failing rule, `Required` first.
    pub fn validate(&self, value: &str) -> Option<String> {
        if self.required {
            if let Some(message) = Validator::Required.check(&self.label, value) {
                return Some(message);
            }
        }
        self.validators
            .iter()
            .find_map(|v| v.check(&self.label, value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Web,
    Ios,
    Android,
    Desktop,
}

impl Platform {
    pub fn is_mobile(self) -> bool {
        matches!(self, Platform::Ios | Platform::Android)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Keyboard {
    Default,
    Email,
    Phone,
    Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputKind {
    /// `type` of an `<input>`, or `"textarea"`.
    Html(&'static str),
    Native { keyboard: Keyboard, multiline: bool },
}

impl InputKind {
    pub fn for_field(kind: FieldKind, platform: Platform) -> Self {
        if platform == Platform::Web {
            return InputKind::Html(match kind {
                FieldKind::Text | FieldKind::Username => "text",
                FieldKind::Multiline => "textarea",
                FieldKind::Email => "email",
                FieldKind::Phone => "tel",
                FieldKind::Url => "url",
            });
        }
        let keyboard = match kind {
            FieldKind::Email => Keyboard::Email,
            FieldKind::Phone => Keyboard::Phone,
            FieldKind::Url => Keyboard::Url,
            FieldKind::Text | FieldKind::Multiline | FieldKind::Username => Keyboard::Default,
        };
        InputKind::Native {
            keyboard,
            multiline: kind == FieldKind::Multiline,
        }
    }
}

/// Everything a shell needs to draw one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldView {
    pub id: FieldId,
    pub label: String,
    pub value: String,
    pub editing: bool,
    pub show_undo: bool,
    pub error: Option<String>,
    pub input: InputKind,
    pub autocapitalize: bool,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormError {
    #[error("{message}")]
    Invalid { field: FieldId, message: String },

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error("unknown field '{0}'")]
    UnknownField(FieldId),
}

/// Field configs plus a [`FieldEditor`]: validation before save, inline
/// errors, blur/cancel/tab handling and per-platform rendering.
#[derive(Clone)]
pub struct EditableForm {
    editor: FieldEditor,
    configs: Arc<Vec<FieldConfig>>,
    errors: Arc<Mutex<HashMap<FieldId, String>>>,
}

impl EditableForm {
    /// Buffers start from `values`; fields missing there start blank.
    pub fn new(
        configs: Vec<FieldConfig>,
        values: &HashMap<FieldId, String>,
        saver: Arc<dyn FieldSaver>,
    ) -> Self {
        let seeded: Vec<(FieldId, String)> = configs
            .iter()
            .map(|c| (c.id.clone(), values.get(&c.id).cloned().unwrap_or_default()))
            .collect();
        Self {
            editor: FieldEditor::with_values(seeded, saver),
            configs: Arc::new(configs),
            errors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_timing(mut self, timing: EditorTiming) -> Self {
        self.editor = self.editor.with_timing(timing);
        self
    }

    pub fn editor(&self) -> &FieldEditor {
        &self.editor
    }

    pub fn config(&self, field: &FieldId) -> Option<&FieldConfig> {
        self.configs.iter().find(|c| &c.id == field)
    }

    fn order(&self) -> Vec<FieldId> {
        self.configs.iter().map(|c| c.id.clone()).collect()
    }

    fn errors(&self) -> MutexGuard<'_, HashMap<FieldId, String>> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn error(&self, field: &FieldId) -> Option<String> {
        self.errors().get(field).cloned()
    }

    fn set_error(&self, field: &FieldId, message: String) {
        self.errors().insert(field.clone(), message);
    }

    fn clear_error(&self, field: &FieldId) {
        self.errors().remove(field);
    }

    /// Refreshes buffers from server data; the open field is left alone.
    pub fn reseed(&self, values: &HashMap<FieldId, String>) {
        for config in self.configs.iter() {
            if let Some(value) = values.get(&config.id) {
                self.editor.seed(&config.id, value.clone());
            }
        }
    }

    pub fn begin(&self, field: &FieldId) -> bool {
        let started = self.editor.handle_edit_start(field);
        if started {
            self.clear_error(field);
        }
        started
    }

    pub fn input(&self, field: &FieldId, value: impl Into<String>) {
        self.editor.update_field_value(field, value);
        self.clear_error(field);
    }

    pub fn validate(&self, field: &FieldId) -> Result<(), FormError> {
        let config = self
            .config(field)
            .ok_or_else(|| FormError::UnknownField(field.clone()))?;
        let value = self.editor.value(field).unwrap_or_default();
        match config.validate(&value) {
            Some(message) => Err(FormError::Invalid {
                field: field.clone(),
                message,
            }),
            None => Ok(()),
        }
    }

    /// Validates, then saves. Either failure is kept as the field's inline
    /// error and the field stays open.
    pub async fn commit(&self, field: &FieldId) -> Result<SaveOutcome, FormError> {
        self.commit_with(field, true).await
    }

    async fn commit_with(&self, field: &FieldId, close: bool) -> Result<SaveOutcome, FormError> {
        if let Err(e) = self.validate(field) {
            if let FormError::Invalid { message, .. } = &e {
                debug!(%field, %message, "validation failed");
                self.set_error(field, message.clone());
            }
            return Err(e);
        }
        let saved = if close {
            self.editor.save_field(field).await
        } else {
            self.editor.save_field_in_place(field).await
        };
        match saved {
            Ok(outcome) => {
                self.clear_error(field);
                Ok(outcome)
            }
            Err(e) => {
                self.set_error(field, e.inline_message());
                Err(e.into())
            }
        }
    }

    /// Focus left `field`: save it, then close it whatever the result. The
    /// buffer and any inline error survive a failed save.
    pub async fn blur(&self, field: &FieldId) -> Result<SaveOutcome, FormError> {
        if !self.editor.is_editing(field) {
            return Ok(SaveOutcome::Unchanged);
        }
        let result = self.commit(field).await;
        if self.editor.is_editing(field) {
            self.editor.handle_edit_end();
        }
        result
    }

    /// Drops the open field's edits.
    pub fn cancel(&self) {
        if let Some(field) = self.editor.cancel_edit() {
            self.clear_error(&field);
        }
    }

    /// Saves the open field, then jumps to the next one without passing
    /// through idle. Stays put when the save fails.
    pub async fn tab(&self, direction: TabDirection) -> Result<Option<FieldId>, FormError> {
        if let Some(current) = self.editor.editing_field() {
            self.commit_with(&current, false).await?;
        }
        let next = self.editor.handle_tab_navigation(&self.order(), direction);
        if let Some(next) = &next {
            self.clear_error(next);
        }
        Ok(next)
    }

    /// One-tap field switch: saves the open field first, then opens
    /// `field`. Returns `Ok(false)` when `field` is unknown.
    pub async fn switch_to(&self, field: &FieldId) -> Result<bool, FormError> {
        match self.editor.editing_field() {
            Some(current) if &current == field => return Ok(true),
            Some(current) => {
                self.commit(&current).await?;
            }
            None => {}
        }
        Ok(self.begin(field))
    }

    pub async fn undo(&self, field: &FieldId) -> Result<bool, FormError> {
        self.clear_error(field);
        match self.editor.undo(field).await {
            Ok(undone) => Ok(undone),
            Err(e) => {
                self.set_error(field, e.inline_message());
                Err(e.into())
            }
        }
    }

    pub fn render_field(&self, field: &FieldId, platform: Platform) -> Option<FieldView> {
        let config = self.config(field)?;
        Some(FieldView {
            id: config.id.clone(),
            label: config.label.clone(),
            value: self.editor.value(field).unwrap_or_default(),
            editing: self.editor.is_editing(field),
            show_undo: self.editor.show_undo(field),
            error: self.error(field),
            input: InputKind::for_field(config.kind, platform),
            autocapitalize: !matches!(
                config.kind,
                FieldKind::Email | FieldKind::Url | FieldKind::Username
            ),
            required: config.required,
        })
    }

    pub fn render(&self, platform: Platform) -> Vec<FieldView> {
        self.configs
            .iter()
            .filter_map(|c| self.render_field(&c.id, platform))
            .collect()
    }
}

impl fmt::Debug for EditableForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditableForm")
            .field("fields", &self.order())
            .field("editor", &self.editor)
            .finish_non_exhaustive()
    }
}
