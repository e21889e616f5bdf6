use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use secrecy::{ExposeSecret, SecretString};

// --- Secret wrapper: redacts Debug, zeroizes on Drop (via secrecy) ---

pub struct Secret(SecretString);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(SecretString::new(s.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for Secret {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_owned())
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret::new)
    }
}

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

typed_id!(FieldId);
typed_id!(UserKey);

// --- Schema validation at the I/O boundary ---

/// One failed check, addressed by a JSON-ish path such as `items[2].slug`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    fn nested(self, prefix: &str) -> Self {
        let path = if self.path.is_empty() {
            prefix.to_owned()
        } else if self.path.starts_with('[') {
            format!("{prefix}{}", self.path)
        } else {
            format!("{prefix}.{}", self.path)
        };
        Self { path, ..self }
    }
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Response types checked after deserialization. Deserializing proves the
/// shape; `validate` checks the invariants serde cannot express.
pub trait Schema: DeserializeOwned {
    fn validate(&self) -> Vec<SchemaIssue> {
        Vec::new()
    }
}

impl Schema for serde_json::Value {}

impl<T: Schema> Schema for Vec<T> {
    fn validate(&self) -> Vec<SchemaIssue> {
        self.iter()
            .enumerate()
            .flat_map(|(i, item)| {
                let prefix = format!("[{i}]");
                item.validate().into_iter().map(move |issue| issue.nested(&prefix))
            })
            .collect()
    }
}

fn require_non_empty(issues: &mut Vec<SchemaIssue>, path: &str, value: &str) {
    if value.trim().is_empty() {
        issues.push(SchemaIssue::new(path, "must not be empty"));
    }
}

fn is_plausible_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
}

pub(crate) fn email_issue(value: &str) -> Option<&'static str> {
    if is_plausible_email(value) {
        None
    } else {
        Some("must be a valid email address")
    }
}

// --- Entities ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_path: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
}

impl Schema for User {
    fn validate(&self) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        require_non_empty(&mut issues, "id", &self.id);
        require_non_empty(&mut issues, "username", &self.username);
        if let Some(msg) = email_issue(&self.email) {
            issues.push(SchemaIssue::new("email", msg));
        }
        issues
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TagRef {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

impl Tag {
    pub fn to_ref(&self) -> TagRef {
        TagRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

impl Schema for Tag {
    fn validate(&self) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        require_non_empty(&mut issues, "id", &self.id);
        require_non_empty(&mut issues, "name", &self.name);
        if let Some(color) = &self.color {
            let hex = color.strip_prefix('#').unwrap_or(color);
            if !(hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())) {
                issues.push(SchemaIssue::new("color", "must be a #rrggbb hex color"));
            }
        }
        issues
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Contact {
    pub id: String,
    pub slug: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub avatar_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagRef>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Schema for Contact {
    fn validate(&self) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        require_non_empty(&mut issues, "id", &self.id);
        require_non_empty(&mut issues, "slug", &self.slug);
        if let Some(email) = self.email.as_deref().filter(|e| !e.is_empty()) {
            if let Some(msg) = email_issue(email) {
                issues.push(SchemaIssue::new("email", msg));
            }
        }
        for (i, tag) in self.tags.iter().enumerate() {
            require_non_empty(&mut issues, &format!("tags[{i}].id"), &tag.id);
        }
        issues
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Image {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// An image attached to a contact or user, with its gallery position.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageRelation {
    pub id: String,
    pub image: Image,
    pub order: u32,
    #[serde(default)]
    pub is_cover: bool,
}

impl Schema for ImageRelation {
    fn validate(&self) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        require_non_empty(&mut issues, "id", &self.id);
        require_non_empty(&mut issues, "image.id", &self.image.id);
        require_non_empty(&mut issues, "image.path", &self.image.path);
        issues
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub count: u64,
}

impl<T> Paginated<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            count: 0,
        }
    }
}

impl<T: Schema> Schema for Paginated<T> {
    fn validate(&self) -> Vec<SchemaIssue> {
        let mut issues: Vec<SchemaIssue> = self
            .items
            .validate()
            .into_iter()
            .map(|issue| issue.nested("items"))
            .collect();
        if (self.count as usize) < self.items.len() {
            issues.push(SchemaIssue::new(
                "count",
                format!("{} is smaller than the {} items returned", self.count, self.items.len()),
            ));
        }
        issues
    }
}

/// Image galleries additionally need unique positions.
pub fn validate_gallery(relations: &[ImageRelation]) -> Vec<SchemaIssue> {
    let mut issues = relations.to_vec().validate();
    let mut seen = std::collections::HashSet::new();
    for (i, rel) in relations.iter().enumerate() {
        if !seen.insert(rel.order) {
            issues.push(SchemaIssue::new(format!("[{i}].order"), "duplicate position"));
        }
    }
    if relations.iter().filter(|r| r.is_cover).count() > 1 {
        issues.push(SchemaIssue::new("", "more than one cover image"));
    }
    issues
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct TokenPair {
    pub access: Secret,
    pub refresh: Secret,
}

impl Schema for TokenPair {
    fn validate(&self) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        require_non_empty(&mut issues, "access", self.access.expose());
        require_non_empty(&mut issues, "refresh", self.refresh.expose());
        issues
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UsernameAvailability {
    pub available: bool,
}

impl Schema for UsernameAvailability {}

/// Generic `{ "detail": .. }`/`{ "message": .. }` acknowledgement bodies.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Ack {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl Schema for Ack {}

// --- Request payloads ---

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContactInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

#[derive(Serialize, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize, Clone, PartialEq, Eq)]
pub struct SignupRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SignupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignupRequest")
            .field("email", &self.email)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
