//! Serializable view models handed to the shells.

use serde::{Deserialize, Serialize};

use crate::media::resolve_asset_url;
use crate::model::{Contact, ImageRelation, Paginated, Tag, TagRef, User};
use crate::resources::{ContactListQuery, SortField, SortOrder};
use crate::{AppError, AppResult, ErrorKind, ErrorSeverity};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserFacingError {
    pub message: String,
    pub is_transient: bool,
    pub is_retryable: bool,
    pub error_code: String,
}

impl From<&AppError> for UserFacingError {
    fn from(e: &AppError) -> Self {
        Self {
            message: e.user_facing_message(),
            is_transient: e.severity == ErrorSeverity::Transient,
            is_retryable: e.is_retryable(),
            error_code: e.code().to_string(),
        }
    }
}

/// What a full screen shows. Missing entities get their own fallback
/// instead of a generic error.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "screen", content = "data", rename_all = "snake_case")]
pub enum Screen<T> {
    Loading,
    Ready(T),
    UserNotFound,
    ContactNotFound,
    Error(UserFacingError),
}

impl<T> Screen<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Screen::Ready(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Screen<U> {
        match self {
            Screen::Loading => Screen::Loading,
            Screen::Ready(v) => Screen::Ready(f(v)),
            Screen::UserNotFound => Screen::UserNotFound,
            Screen::ContactNotFound => Screen::ContactNotFound,
            Screen::Error(e) => Screen::Error(e),
        }
    }

    fn failed(error: &AppError, not_found: Self) -> Self {
        if error.kind == ErrorKind::NotFound {
            not_found
        } else {
            Screen::Error(UserFacingError::from(error))
        }
    }
}

/// `first last`, falling back to whichever half is present.
pub fn display_name(first: &str, last: &str) -> String {
    match (first.trim(), last.trim()) {
        ("", "") => String::new(),
        (first, "") => first.to_string(),
        ("", last) => last.to_string(),
        (first, last) => format!("{first} {last}"),
    }
}

/// Up to two uppercase initials for the avatar placeholder.
pub fn initials(first: &str, last: &str) -> String {
    let initial = |s: &str| s.trim().chars().next().into_iter().flat_map(char::to_uppercase);
    let both: String = initial(first).chain(initial(last)).collect();
    if both.is_empty() {
        "?".into()
    } else {
        both
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TagChip {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
}

impl TagChip {
    /// Picks up the color from the full tag list when it is known.
    pub fn resolve(tag: &TagRef, known: &[Tag]) -> Self {
        Self {
            id: tag.id.clone(),
            name: tag.name.clone(),
            color: known
                .iter()
                .find(|t| t.id == tag.id)
                .and_then(|t| t.color.clone()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Avatar {
    pub url: Option<String>,
    pub initials: String,
}

impl Avatar {
    pub fn new(path: Option<&str>, first: &str, last: &str, asset_base: &str) -> Self {
        Self {
            url: resolve_asset_url(path, asset_base),
            initials: initials(first, last),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContactRow {
    pub slug: String,
    pub name: String,
    pub subtitle: Option<String>,
    pub avatar: Avatar,
    pub tags: Vec<TagChip>,
}

impl ContactRow {
    pub fn build(contact: &Contact, known_tags: &[Tag], asset_base: &str) -> Self {
        let subtitle = [&contact.company, &contact.email]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map(str::to_string);
        Self {
            slug: contact.slug.clone(),
            name: display_name(&contact.first_name, &contact.last_name),
            subtitle,
            avatar: Avatar::new(
                contact.avatar_path.as_deref(),
                &contact.first_name,
                &contact.last_name,
                asset_base,
            ),
            tags: contact
                .tags
                .iter()
                .map(|t| TagChip::resolve(t, known_tags))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContactListView {
    pub rows: Vec<ContactRow>,
    pub total: u64,
    pub search: String,
    pub sort: SortField,
    pub order: SortOrder,
    pub next_offset: Option<u32>,
    pub is_empty_search: bool,
}

impl ContactListView {
    pub fn build(
        page: &Paginated<Contact>,
        query: &ContactListQuery,
        known_tags: &[Tag],
        asset_base: &str,
    ) -> Self {
        let search = query.search.clone().unwrap_or_default();
        Self {
            rows: page
                .items
                .iter()
                .map(|c| ContactRow::build(c, known_tags, asset_base))
                .collect(),
            total: page.count,
            is_empty_search: page.items.is_empty() && !search.is_empty(),
            search,
            sort: query.sort,
            order: query.order,
            next_offset: query.next_page(page.count).map(|q| q.offset),
        }
    }

    pub fn screen(
        result: &AppResult<Paginated<Contact>>,
        query: &ContactListQuery,
        known_tags: &[Tag],
        asset_base: &str,
    ) -> Screen<Self> {
        match result {
            Ok(page) => Screen::Ready(Self::build(page, query, known_tags, asset_base)),
            Err(e) => Screen::Error(UserFacingError::from(e)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GalleryItem {
    pub relation_id: String,
    pub url: Option<String>,
    pub is_cover: bool,
}

pub fn gallery(relations: &[ImageRelation], asset_base: &str) -> Vec<GalleryItem> {
    let mut sorted: Vec<&ImageRelation> = relations.iter().collect();
    sorted.sort_by_key(|r| r.order);
    sorted
        .into_iter()
        .map(|r| GalleryItem {
            relation_id: r.id.clone(),
            url: resolve_asset_url(Some(&r.image.path), asset_base),
            is_cover: r.is_cover,
        })
        .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContactDetailView {
    pub row: ContactRow,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

impl ContactDetailView {
    pub fn build(contact: &Contact, known_tags: &[Tag], asset_base: &str) -> Self {
        Self {
            row: ContactRow::build(contact, known_tags, asset_base),
            email: contact.email.clone(),
            phone: contact.phone.clone(),
            notes: contact.notes.clone(),
        }
    }

    /// `Ok(None)` is a contact the server does not know.
    pub fn screen(
        result: &AppResult<Option<Contact>>,
        known_tags: &[Tag],
        asset_base: &str,
    ) -> Screen<Self> {
        match result {
            Ok(Some(contact)) => Screen::Ready(Self::build(contact, known_tags, asset_base)),
            Ok(None) => Screen::ContactNotFound,
            Err(e) => Screen::failed(e, Screen::ContactNotFound),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProfileView {
    pub username: String,
    pub name: String,
    pub email: String,
    pub bio: Option<String>,
    pub avatar: Avatar,
    pub is_verified: bool,
}

impl ProfileView {
    pub fn build(user: &User, asset_base: &str) -> Self {
        let name = display_name(&user.first_name, &user.last_name);
        let avatar = if user.first_name.trim().is_empty() && user.last_name.trim().is_empty() {
            Avatar::new(user.avatar_path.as_deref(), &user.username, "", asset_base)
        } else {
            Avatar::new(user.avatar_path.as_deref(), &user.first_name, &user.last_name, asset_base)
        };
        Self {
            username: user.username.clone(),
            name: if name.is_empty() { user.username.clone() } else { name },
            email: user.email.clone(),
            bio: user.bio.clone().filter(|b| !b.trim().is_empty()),
            avatar,
            is_verified: user.is_verified,
        }
    }

    pub fn screen(result: &AppResult<Option<User>>, asset_base: &str) -> Screen<Self> {
        match result {
            Ok(Some(user)) => Screen::Ready(Self::build(user, asset_base)),
            Ok(None) => Screen::UserNotFound,
            Err(e) => Screen::failed(e, Screen::UserNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ASSETS: &str = "https://cdn.test/media";

    fn contact(value: serde_json::Value) -> Contact {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn names_and_initials() {
        assert_eq!(display_name("Ada", "Lovelace"), "Ada Lovelace");
        assert_eq!(display_name(" Ada ", ""), "Ada");
        assert_eq!(display_name("", "Hopper"), "Hopper");
        assert_eq!(initials("ada", "lovelace"), "AL");
        assert_eq!(initials("émile", ""), "É");
        assert_eq!(initials("", " "), "?");
    }

    #[test]
    fn row_resolves_avatar_and_tag_colors() {
        let c = contact(json!({
            "id": "1", "slug": "ada", "first_name": "Ada", "last_name": "Lovelace",
            "email": "ada@example.com", "company": " ",
            "avatar_path": "avatars/ada.jpg",
            "tags": [{"id": "t1", "name": "work"}, {"id": "t2", "name": "home"}]
        }));
        let known = vec![Tag {
            id: "t1".into(),
            name: "work".into(),
            color: Some("#336699".into()),
        }];

        let row = ContactRow::build(&c, &known, ASSETS);
        assert_eq!(row.name, "Ada Lovelace");
        assert_eq!(row.subtitle.as_deref(), Some("ada@example.com"));
        assert_eq!(
            row.avatar.url.as_deref(),
            Some("https://cdn.test/media/avatars/ada.jpg")
        );
        assert_eq!(row.avatar.initials, "AL");
        assert_eq!(row.tags[0].color.as_deref(), Some("#336699"));
        assert_eq!(row.tags[1].color, None);
    }

    #[test]
    fn list_view_pages_and_empty_search() {
        let page = Paginated {
            items: Vec::new(),
            count: 0,
        };
        let query = ContactListQuery::default().with_search("zzz");
        let view = ContactListView::build(&page, &query, &[], ASSETS);
        assert!(view.is_empty_search);
        assert_eq!(view.next_offset, None);

        let page = Paginated {
            items: vec![contact(json!({"id": "1", "slug": "a", "first_name": "A"}))],
            count: 45,
        };
        let view = ContactListView::build(&page, &ContactListQuery::default(), &[], ASSETS);
        assert_eq!(view.next_offset, Some(20));
        assert!(!view.is_empty_search);
    }

    #[test]
    fn missing_entities_get_their_own_screen() {
        assert_eq!(ContactDetailView::screen(&Ok(None), &[], ASSETS), Screen::ContactNotFound);
        assert_eq!(ProfileView::screen(&Ok(None), ASSETS), Screen::UserNotFound);

        let not_found = AppError::new(ErrorKind::NotFound, "gone");
        assert_eq!(
            ContactDetailView::screen(&Err(not_found), &[], ASSETS),
            Screen::ContactNotFound
        );

        let offline = AppError::new(ErrorKind::Network, "offline");
        match ProfileView::screen(&Err(offline), ASSETS) {
            Screen::Error(e) => {
                assert!(e.is_retryable);
                assert_eq!(e.error_code, "NETWORK_ERROR");
            }
            other => panic!("unexpected screen {other:?}"),
        }
    }

    #[test]
    fn profile_falls_back_to_username() {
        let user: User = serde_json::from_value(json!({
            "id": "u1", "username": "grace", "email": "g@example.com", "bio": "  "
        }))
        .unwrap();
        let view = ProfileView::build(&user, ASSETS);
        assert_eq!(view.name, "grace");
        assert_eq!(view.avatar.initials, "G");
        assert_eq!(view.avatar.url, None);
        assert_eq!(view.bio, None);
    }

    #[test]
    fn screen_serializes_with_a_tag() {
        let screen: Screen<u32> = Screen::Ready(3);
        assert_eq!(
            serde_json::to_value(&screen).unwrap(),
            json!({"screen": "ready", "data": 3})
        );
        assert_eq!(
            serde_json::to_value(Screen::<u32>::UserNotFound).unwrap(),
            json!({"screen": "user_not_found"})
        );
    }

    #[test]
    fn gallery_is_in_display_order() {
        let relations: Vec<ImageRelation> = serde_json::from_value(json!([
            {"id": "b", "image": {"id": "i2", "path": "https://x.test/b.jpg"}, "order": 1},
            {"id": "a", "image": {"id": "i1", "path": "a.jpg"}, "order": 0, "is_cover": true}
        ]))
        .unwrap();
        let items = gallery(&relations, ASSETS);
        assert_eq!(items[0].relation_id, "a");
        assert_eq!(items[0].url.as_deref(), Some("https://cdn.test/media/a.jpg"));
        assert_eq!(items[1].url.as_deref(), Some("https://x.test/b.jpg"));
    }
}
