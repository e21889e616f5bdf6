use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tracing::instrument;

use super::contacts::ContactData;
use super::{keys, segment, ResourceContext};
use crate::client::{valid, ApiError, Body};
use crate::capabilities::HttpMethod;
use crate::editor::UndoableState;
use crate::model::{Contact, Tag, TagRef};
use crate::query::{run_optimistic, OptimisticMutation, QueryKey};
use crate::{AppError, AppResult, ErrorKind};

pub const MAX_TAG_NAME_LEN: usize = 50;

#[derive(Debug, Clone)]
pub struct Tags {
    ctx: ResourceContext,
}

impl Tags {
    pub fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> AppResult<Vec<Tag>> {
        let client = &self.ctx.client;
        let opts = self.ctx.authed();
        let key = keys::tags();
        let fetch = self.ctx.cache.fetch_query(&key, || async move {
            valid(client.get::<Vec<Tag>>("/tags", opts).await?)
        });
        self.ctx.guard("list_tags", fetch).await
    }

    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, color: Option<&str>) -> AppResult<Tag> {
        self.ctx
            .guard("create_tag", async {
                let name = name.trim();
                if name.is_empty() || name.chars().count() > MAX_TAG_NAME_LEN {
                    return Err(AppError::new(
                        ErrorKind::Validation,
                        format!("Tag names must be 1 to {MAX_TAG_NAME_LEN} characters"),
                    ));
                }
                let body = Body::Json(json!({ "name": name, "color": color }));
                let tag: Tag = valid(self.ctx.client.post("/tags", body, self.ctx.authed()).await?)?;
                self.ctx.cache.invalidate(&keys::tags());
                Ok(tag)
            })
            .await
    }

    /// Drops the tag from the cached tag list first; contacts carrying it
    /// are refetched once the server confirms.
    #[instrument(skip(self))]
    pub async fn delete(&self, tag_id: &str) -> AppResult<()> {
        let mutation = match segment("tag", tag_id) {
            Ok(id) => DeleteTag { ctx: &self.ctx, id },
            Err(e) => return Err(self.ctx.fail("delete_tag", e).await),
        };
        match run_optimistic(&self.ctx.cache, &mutation).await {
            Ok(()) => {
                self.ctx.cache.invalidate(&keys::contacts());
                Ok(())
            }
            Err(e) => Err(self.ctx.fail("delete_tag", e).await),
        }
    }

    pub async fn assign(&self, slug: &str, tag: &TagRef) -> AppResult<()> {
        self.set_assigned(slug, tag, true).await
    }

    pub async fn unassign(&self, slug: &str, tag: &TagRef) -> AppResult<()> {
        self.set_assigned(slug, tag, false).await
    }

    /// Optimistically adds or removes the tag on every cached copy of the
    /// contact, list pages and detail alike.
    #[instrument(skip(self, tag), fields(tag = %tag.id))]
    async fn set_assigned(&self, slug: &str, tag: &TagRef, assigned: bool) -> AppResult<()> {
        let action = if assigned { "assign_tag" } else { "unassign_tag" };
        let path = match (segment("contact", slug), segment("tag", &tag.id)) {
            (Ok(slug), Ok(id)) => format!("/contacts/{slug}/tags/{id}"),
            (Err(e), _) | (_, Err(e)) => return Err(self.ctx.fail(action, e).await),
        };
        let mutation = AssignTag {
            ctx: &self.ctx,
            slug,
            tag,
            assigned,
            path,
        };
        match run_optimistic(&self.ctx.cache, &mutation).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.ctx.fail(action, e).await),
        }
    }
}

struct DeleteTag<'a> {
    ctx: &'a ResourceContext,
    id: &'a str,
}

#[async_trait::async_trait]
impl<'a> OptimisticMutation for DeleteTag<'a> {
    type Output = ();
    type Data = Vec<Tag>;

    fn name(&self) -> &'static str {
        "delete_tag"
    }

    fn affected(&self) -> QueryKey {
        keys::tags()
    }

    fn apply(&self, _key: &QueryKey, mut tags: Vec<Tag>) -> Vec<Tag> {
        tags.retain(|t| t.id != self.id);
        tags
    }

    async fn execute(&self) -> Result<(), ApiError> {
        self.ctx
            .client
            .delete_empty(&format!("/tags/{}", self.id), self.ctx.authed())
            .await
    }
}

struct AssignTag<'a> {
    ctx: &'a ResourceContext,
    slug: &'a str,
    tag: &'a TagRef,
    assigned: bool,
    path: String,
}

#[async_trait::async_trait]
impl<'a> OptimisticMutation for AssignTag<'a> {
    type Output = ();
    type Data = ContactData;

    fn name(&self) -> &'static str {
        if self.assigned {
            "assign_tag"
        } else {
            "unassign_tag"
        }
    }

    fn affected(&self) -> QueryKey {
        keys::contacts()
    }

    fn apply(&self, _key: &QueryKey, data: ContactData) -> ContactData {
        data.modify(self.slug, |contact: &mut Contact| {
            contact.tags.retain(|t| t.id != self.tag.id);
            if self.assigned {
                contact.tags.push(self.tag.clone());
            }
        })
    }

    async fn execute(&self) -> Result<(), ApiError> {
        let method = if self.assigned {
            HttpMethod::Post
        } else {
            HttpMethod::Delete
        };
        self.ctx
            .client
            .send_empty(method, &self.path, None, self.ctx.authed())
            .await
    }
}

/// Tag chips on one contact. Each toggle can be reverted within the undo
/// window; the revert is persisted like any other change.
#[derive(Debug)]
pub struct TagSelection {
    tags: Tags,
    slug: String,
    selected: UndoableState<BTreeMap<String, TagRef>>,
}

impl TagSelection {
    pub fn new(tags: Tags, contact: &Contact, undo_window: Duration) -> Self {
        let selected = contact
            .tags
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        Self {
            tags,
            slug: contact.slug.clone(),
            selected: UndoableState::new(selected, undo_window),
        }
    }

    pub fn is_selected(&self, tag_id: &str) -> bool {
        self.selected.get().contains_key(tag_id)
    }

    pub fn selected(&self) -> Vec<TagRef> {
        self.selected.get().into_values().collect()
    }

    pub fn can_undo(&self) -> bool {
        self.selected.can_undo()
    }

    /// Flips `tag`. Returns whether it is now assigned. A failed request
    /// puts the selection back.
    pub async fn toggle(&self, tag: &TagRef) -> AppResult<bool> {
        let mut next = self.selected.get();
        let assign = next.remove(&tag.id).is_none();
        if assign {
            next.insert(tag.id.clone(), tag.clone());
        }
        self.selected.set(next);

        let result = if assign {
            self.tags.assign(&self.slug, tag).await
        } else {
            self.tags.unassign(&self.slug, tag).await
        };
        if let Err(e) = result {
            self.selected.undo();
            return Err(e);
        }
        Ok(assign)
    }

    /// Reverts the last toggle. `Ok(false)` when the window has closed.
    pub async fn undo(&self) -> AppResult<bool> {
        let current = self.selected.get();
        let Some(previous) = self.selected.undo() else {
            return Ok(false);
        };
        for (id, tag) in &previous {
            if !current.contains_key(id) {
                self.tags.assign(&self.slug, tag).await?;
            }
        }
        for (id, tag) in &current {
            if !previous.contains_key(id) {
                self.tags.unassign(&self.slug, tag).await?;
            }
        }
        Ok(true)
    }
}
