use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use super::{keys, segment, ResourceContext};
use crate::capabilities::HttpMethod;
use crate::client::{valid, ApiError, Body};
use crate::media::prepare_upload;
use crate::model::{validate_gallery, ImageRelation};
use crate::query::{run_optimistic, OptimisticMutation, QueryKey};
use crate::{AppError, AppResult, ErrorKind};

/// The entity a gallery hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageTarget {
    Contact,
    User,
}

impl ImageTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageTarget::Contact => "contacts",
            ImageTarget::User => "users",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Images {
    ctx: ResourceContext,
}

impl Images {
    pub fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }

    fn base(target: ImageTarget, id: &str) -> AppResult<String> {
        Ok(format!("/{}/{}/images", target.as_str(), segment("owner", id)?))
    }

    /// The gallery in display order.
    #[instrument(skip(self))]
    pub async fn list(&self, target: ImageTarget, id: &str) -> AppResult<Vec<ImageRelation>> {
        self.ctx
            .guard("list_images", async {
                let path = Self::base(target, id)?;
                let client = &self.ctx.client;
                let opts = self.ctx.authed();
                let mut gallery: Vec<ImageRelation> = self
                    .ctx
                    .cache
                    .fetch_query(&keys::images(target, id), || async move {
                        let gallery: Vec<ImageRelation> = valid(client.get(&path, opts).await?)?;
                        let issues = validate_gallery(&gallery);
                        if let Some(first) = issues.first() {
                            return Err(AppError::new(ErrorKind::Serialization, "inconsistent gallery")
                                .with_internal(first.to_string()));
                        }
                        Ok(gallery)
                    })
                    .await?;
                gallery.sort_by_key(|r| r.order);
                Ok(gallery)
            })
            .await
    }

    #[instrument(skip(self, image), fields(bytes = image.len()))]
    pub async fn upload(
        &self,
        target: ImageTarget,
        id: &str,
        image: Vec<u8>,
    ) -> AppResult<ImageRelation> {
        self.ctx
            .guard("upload_image", async {
                let path = Self::base(target, id)?;
                let prepared = prepare_upload(image)?;
                let relation: ImageRelation = valid(
                    self.ctx
                        .client
                        .post(&path, prepared.into_multipart("image"), self.ctx.authed())
                        .await?,
                )?;
                self.ctx.cache.invalidate(&keys::images(target, id));
                Ok(relation)
            })
            .await
    }

    /// Moves the gallery into the order of `relation_ids`. Positions are
    /// renumbered from zero in the cache before the server answers.
    pub async fn reorder(
        &self,
        target: ImageTarget,
        id: &str,
        relation_ids: &[String],
    ) -> AppResult<()> {
        let mut seen = HashSet::new();
        if relation_ids.is_empty() || !relation_ids.iter().all(|r| seen.insert(r.as_str())) {
            let err = AppError::new(ErrorKind::Validation, "Image order must list each image once");
            return Err(self.ctx.fail("reorder_images", err).await);
        }
        self.mutate(target, id, ImageOp::Reorder(relation_ids)).await
    }

    pub async fn set_cover(&self, target: ImageTarget, id: &str, relation: &str) -> AppResult<()> {
        self.mutate(target, id, ImageOp::SetCover(relation)).await
    }

    pub async fn unset_cover(&self, target: ImageTarget, id: &str, relation: &str) -> AppResult<()> {
        self.mutate(target, id, ImageOp::UnsetCover(relation)).await
    }

    pub async fn detach(&self, target: ImageTarget, id: &str, relation: &str) -> AppResult<()> {
        self.mutate(target, id, ImageOp::Detach(relation)).await
    }

    #[instrument(skip(self, op), fields(op = op.name()))]
    async fn mutate(&self, target: ImageTarget, id: &str, op: ImageOp<'_>) -> AppResult<()> {
        let base = match Self::base(target, id).and_then(|base| op.check().map(|()| base)) {
            Ok(base) => base,
            Err(e) => return Err(self.ctx.fail(op.name(), e).await),
        };
        let mutation = ImageMutation {
            ctx: &self.ctx,
            key: keys::images(target, id),
            base,
            op,
        };
        match run_optimistic(&self.ctx.cache, &mutation).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.ctx.fail(mutation.op.name(), e).await),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ImageOp<'a> {
    Reorder(&'a [String]),
    SetCover(&'a str),
    UnsetCover(&'a str),
    Detach(&'a str),
}

impl ImageOp<'_> {
    fn name(&self) -> &'static str {
        match self {
            ImageOp::Reorder(_) => "reorder_images",
            ImageOp::SetCover(_) => "set_cover_image",
            ImageOp::UnsetCover(_) => "unset_cover_image",
            ImageOp::Detach(_) => "detach_image",
        }
    }

    fn check(&self) -> AppResult<()> {
        match self {
            ImageOp::Reorder(ids) => ids.iter().try_for_each(|r| segment("image", r).map(|_| ())),
            ImageOp::SetCover(r) | ImageOp::UnsetCover(r) | ImageOp::Detach(r) => {
                segment("image", r).map(|_| ())
            }
        }
    }

    fn apply(&self, mut gallery: Vec<ImageRelation>) -> Vec<ImageRelation> {
        match *self {
            ImageOp::Reorder(ids) => {
                gallery.sort_by_key(|r| {
                    let listed = ids.iter().position(|id| *id == r.id);
                    (listed.is_none(), listed, r.order)
                });
                renumber(&mut gallery);
            }
            ImageOp::SetCover(rel) => {
                for r in &mut gallery {
                    r.is_cover = r.id == rel;
                }
            }
            ImageOp::UnsetCover(rel) => {
                if let Some(r) = gallery.iter_mut().find(|r| r.id == rel) {
                    r.is_cover = false;
                }
            }
            ImageOp::Detach(rel) => {
                gallery.sort_by_key(|r| r.order);
                gallery.retain(|r| r.id != rel);
                renumber(&mut gallery);
            }
        }
        gallery
    }
}

fn renumber(gallery: &mut [ImageRelation]) {
    for (position, relation) in (0u32..).zip(gallery.iter_mut()) {
        relation.order = position;
    }
}

struct ImageMutation<'a> {
    ctx: &'a ResourceContext,
    key: QueryKey,
    base: String,
    op: ImageOp<'a>,
}

#[async_trait::async_trait]
impl<'a> OptimisticMutation for ImageMutation<'a> {
    type Output = ();
    type Data = Vec<ImageRelation>;

    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn affected(&self) -> QueryKey {
        self.key.clone()
    }

    fn apply(&self, _key: &QueryKey, gallery: Vec<ImageRelation>) -> Vec<ImageRelation> {
        self.op.apply(gallery)
    }

    async fn execute(&self) -> Result<(), ApiError> {
        let (method, path, body) = match self.op {
            ImageOp::Reorder(ids) => (
                HttpMethod::Patch,
                format!("{}/order", self.base),
                Some(Body::Json(json!({ "order": ids }))),
            ),
            ImageOp::SetCover(rel) => (HttpMethod::Patch, format!("{}/{rel}/cover", self.base), None),
            ImageOp::UnsetCover(rel) => (HttpMethod::Delete, format!("{}/{rel}/cover", self.base), None),
            ImageOp::Detach(rel) => (HttpMethod::Delete, format!("{}/{rel}", self.base), None),
        };
        self.ctx
            .client
            .send_empty(method, &path, body, self.ctx.authed())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::MockReply;
    use crate::resources::testing::fixture;
    use serde_json::Value;

    fn rel(id: &str, order: u32, cover: bool) -> Value {
        json!({
            "id": id,
            "image": {"id": format!("img-{id}"), "path": format!("photos/{id}.jpg")},
            "order": order,
            "is_cover": cover,
        })
    }

    fn gallery_key() -> QueryKey {
        keys::images(ImageTarget::Contact, "ada")
    }

    fn seeded_gallery() -> Value {
        json!([rel("a", 0, true), rel("b", 1, false), rel("c", 2, false)])
    }

    fn order_of(gallery: &[ImageRelation]) -> Vec<(&str, u32)> {
        gallery.iter().map(|r| (r.id.as_str(), r.order)).collect()
    }

    #[tokio::test]
    async fn list_sorts_by_position() {
        let f = fixture().await;
        f.mock.on(
            HttpMethod::Get,
            "/contacts/ada/images",
            MockReply::ok(json!([rel("b", 1, false), rel("a", 0, true)])),
        );

        let gallery = Images::new(f.ctx.clone())
            .list(ImageTarget::Contact, "ada")
            .await
            .unwrap();
        assert_eq!(order_of(&gallery), vec![("a", 0), ("b", 1)]);
    }

    #[tokio::test]
    async fn inconsistent_gallery_is_rejected() {
        let f = fixture().await;
        f.mock.on(
            HttpMethod::Get,
            "/users/u1/images",
            MockReply::ok(json!([rel("a", 0, true), rel("b", 0, false)])),
        );

        let err = Images::new(f.ctx.clone())
            .list(ImageTarget::User, "u1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(!f.ctx.cache.contains(&keys::images(ImageTarget::User, "u1")));
    }

    #[tokio::test]
    async fn reorder_renumbers_from_zero() {
        let f = fixture().await;
        f.ctx.cache.set_raw(gallery_key(), seeded_gallery());
        f.mock
            .on(HttpMethod::Patch, "/contacts/ada/images/order", MockReply::Empty(204));

        let ids = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        Images::new(f.ctx.clone())
            .reorder(ImageTarget::Contact, "ada", &ids)
            .await
            .unwrap();

        let gallery: Vec<ImageRelation> = f.ctx.cache.get_query_data(&gallery_key()).unwrap();
        assert_eq!(order_of(&gallery), vec![("c", 0), ("a", 1), ("b", 2)]);
        let sent = f
            .mock
            .last(HttpMethod::Patch, "/contacts/ada/images/order")
            .unwrap();
        assert_eq!(sent.json_body(), Some(json!({"order": ["c", "a", "b"]})));
    }

    #[tokio::test]
    async fn failed_reorder_restores_gallery() {
        let f = fixture().await;
        f.ctx.cache.set_raw(gallery_key(), seeded_gallery());
        f.mock.on(
            HttpMethod::Patch,
            "/contacts/ada/images/order",
            MockReply::status(409, json!({"detail": "gallery changed"})),
        );

        let ids = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let err = Images::new(f.ctx.clone())
            .reorder(ImageTarget::Contact, "ada", &ids)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(f.ctx.cache.get_raw(&gallery_key()), Some(seeded_gallery()));
        assert!(f.ctx.cache.entry(&gallery_key()).unwrap().stale);
        assert_eq!(
            f.reporter.reports.lock().unwrap().as_slice(),
            [("reorder_images".to_string(), "CONFLICT".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_reorder_restores_every_variant_of_the_gallery() {
        let f = fixture().await;
        let second_page = gallery_key().child("page=2");
        let other_contact = keys::images(ImageTarget::Contact, "grace");
        let user_gallery = keys::images(ImageTarget::User, "ada");
        for key in [&gallery_key(), &second_page, &other_contact, &user_gallery] {
            f.ctx.cache.set_raw(key.clone(), seeded_gallery());
        }
        f.mock.on(
            HttpMethod::Patch,
            "/contacts/ada/images/order",
            MockReply::status(500, json!({})),
        );

        let ids = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        Images::new(f.ctx.clone())
            .reorder(ImageTarget::Contact, "ada", &ids)
            .await
            .unwrap_err();

        for key in [&gallery_key(), &second_page] {
            assert_eq!(f.ctx.cache.get_raw(key), Some(seeded_gallery()));
            assert!(f.ctx.cache.entry(key).unwrap().stale);
        }
        for key in [&other_contact, &user_gallery] {
            assert_eq!(f.ctx.cache.get_raw(key), Some(seeded_gallery()));
            assert!(!f.ctx.cache.entry(key).unwrap().stale);
        }
    }

    #[tokio::test]
    async fn duplicate_ids_never_reach_the_server() {
        let f = fixture().await;
        let ids = vec!["a".to_string(), "a".to_string()];
        let err = Images::new(f.ctx.clone())
            .reorder(ImageTarget::Contact, "ada", &ids)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(f.mock.requests().is_empty());
    }

    #[tokio::test]
    async fn cover_is_exclusive() {
        let f = fixture().await;
        f.ctx.cache.set_raw(gallery_key(), seeded_gallery());
        f.mock
            .on(HttpMethod::Patch, "/contacts/ada/images/b/cover", MockReply::Empty(204))
            .on(HttpMethod::Delete, "/contacts/ada/images/b/cover", MockReply::Empty(204));
        let images = Images::new(f.ctx.clone());

        images.set_cover(ImageTarget::Contact, "ada", "b").await.unwrap();
        let gallery: Vec<ImageRelation> = f.ctx.cache.get_query_data(&gallery_key()).unwrap();
        let covers: Vec<_> = gallery.iter().filter(|r| r.is_cover).map(|r| r.id.as_str()).collect();
        assert_eq!(covers, vec!["b"]);

        images.unset_cover(ImageTarget::Contact, "ada", "b").await.unwrap();
        let gallery: Vec<ImageRelation> = f.ctx.cache.get_query_data(&gallery_key()).unwrap();
        assert!(gallery.iter().all(|r| !r.is_cover));
    }

    #[tokio::test]
    async fn detach_closes_the_gap() {
        let f = fixture().await;
        f.ctx.cache.set_raw(gallery_key(), seeded_gallery());
        f.mock
            .on(HttpMethod::Delete, "/contacts/ada/images/b", MockReply::Empty(204));

        Images::new(f.ctx.clone())
            .detach(ImageTarget::Contact, "ada", "b")
            .await
            .unwrap();

        let gallery: Vec<ImageRelation> = f.ctx.cache.get_query_data(&gallery_key()).unwrap();
        assert_eq!(order_of(&gallery), vec![("a", 0), ("c", 1)]);
    }

    #[tokio::test]
    async fn upload_posts_multipart_and_invalidates() {
        let f = fixture().await;
        f.ctx.cache.set_raw(gallery_key(), seeded_gallery());
        f.mock.on(
            HttpMethod::Post,
            "/contacts/ada/images",
            MockReply::status(201, rel("d", 3, false)),
        );

        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend_from_slice(&[0u8; 32]);
        let relation = Images::new(f.ctx.clone())
            .upload(ImageTarget::Contact, "ada", png)
            .await
            .unwrap();

        assert_eq!(relation.id, "d");
        let sent = f.mock.last(HttpMethod::Post, "/contacts/ada/images").unwrap();
        let content_type = sent.headers().get("Content-Type").unwrap_or_default();
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        assert!(f.ctx.cache.entry(&gallery_key()).unwrap().stale);
    }

    #[tokio::test]
    async fn unsupported_upload_is_a_media_error() {
        let f = fixture().await;
        let err = Images::new(f.ctx.clone())
            .upload(ImageTarget::Contact, "ada", b"not an image".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Media);
        assert!(f.mock.requests().is_empty());
    }
}
