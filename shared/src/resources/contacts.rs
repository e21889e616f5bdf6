use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{keys, segment, ResourceContext};
use crate::client::{valid, ApiError, Body, FetchOptions};
use crate::debounce::Debouncer;
use crate::editor::{FieldConfig, FieldKind, FieldSaver, SaveError, Validator};
use crate::media::prepare_avatar;
use crate::model::{Contact, ContactInput, FieldId, Paginated};
use crate::query::{run_optimistic, OptimisticMutation, QueryKey};
use crate::{AppError, AppResult, ErrorKind, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortField {
    #[default]
    FirstName,
    LastName,
    Company,
    CreatedAt,
    UpdatedAt,
}

impl SortField {
    pub fn as_str(self) -> &'static str {
        match self {
            SortField::FirstName => "first_name",
            SortField::LastName => "last_name",
            SortField::Company => "company",
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactListQuery {
    pub search: Option<String>,
    pub sort: SortField,
    pub order: SortOrder,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ContactListQuery {
    fn default() -> Self {
        Self {
            search: None,
            sort: SortField::default(),
            order: SortOrder::default(),
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl ContactListQuery {
    /// Blank or whitespace-only search means no filter.
    #[must_use]
    pub fn with_search(mut self, search: &str) -> Self {
        let search = search.trim();
        self.search = (!search.is_empty()).then(|| search.to_string());
        self.offset = 0;
        self
    }

    #[must_use]
    pub fn sorted(mut self, sort: SortField, order: SortOrder) -> Self {
        self.sort = sort;
        self.order = order;
        self.offset = 0;
        self
    }

    #[must_use]
    pub fn page(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    /// Next page's query, if `total` says there is one.
    pub fn next_page(&self, total: u64) -> Option<Self> {
        let next = self.offset.saturating_add(self.effective_limit());
        (u64::from(next) < total).then(|| self.clone().page(next))
    }

    pub fn cache_segment(&self) -> String {
        format!(
            "search={}&sort={}&order={}&limit={}&offset={}",
            self.search.as_deref().unwrap_or(""),
            self.sort.as_str(),
            self.order.as_str(),
            self.effective_limit(),
            self.offset
        )
    }

    pub fn apply(&self, mut opts: FetchOptions) -> FetchOptions {
        if let Some(search) = &self.search {
            opts = opts.query("search", search);
        }
        opts.query("sort", self.sort.as_str())
            .query("order", self.order.as_str())
            .query("limit", self.effective_limit())
            .query("offset", self.offset)
    }
}

/// Either shape cached under `["contacts", ..]`: a list page or a single
/// contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum ContactData {
    Page(Paginated<Contact>),
    One(Contact),
}

impl ContactData {
    /// Applies `f` to every cached copy of the contact with `slug`.
    pub(crate) fn modify(self, slug: &str, f: impl Fn(&mut Contact)) -> Self {
        match self {
            ContactData::Page(mut page) => {
                page.items
                    .iter_mut()
                    .filter(|c| c.slug == slug)
                    .for_each(&f);
                ContactData::Page(page)
            }
            ContactData::One(mut contact) => {
                if contact.slug == slug {
                    f(&mut contact);
                }
                ContactData::One(contact)
            }
        }
    }
}

fn contact_path(slug: &str) -> AppResult<String> {
    Ok(format!("/contacts/{}", segment("contact", slug)?))
}

/// Builds the PATCH body for a single edited field. Optional fields are
/// cleared by sending an empty string.
pub fn contact_patch(field: &FieldId, value: &str) -> AppResult<ContactInput> {
    let value = Some(value.trim().to_string());
    let mut input = ContactInput::default();
    match field.as_str() {
        "first_name" => input.first_name = value,
        "last_name" => input.last_name = value,
        "email" => input.email = value,
        "phone" => input.phone = value,
        "company" => input.company = value,
        "notes" => input.notes = value,
        other => {
            return Err(AppError::new(
                ErrorKind::Validation,
                format!("Contacts have no editable field '{other}'"),
            ))
        }
    }
    Ok(input)
}

/// Field layout of the contact detail form.
pub fn contact_fields() -> Vec<FieldConfig> {
    vec![
        FieldConfig::new("first_name", "First name", FieldKind::Text)
            .required()
            .validator(Validator::MaxLength(100)),
        FieldConfig::new("last_name", "Last name", FieldKind::Text).validator(Validator::MaxLength(100)),
        FieldConfig::new("email", "Email", FieldKind::Email),
        FieldConfig::new("phone", "Phone", FieldKind::Phone),
        FieldConfig::new("company", "Company", FieldKind::Text).validator(Validator::MaxLength(100)),
        FieldConfig::new("notes", "Notes", FieldKind::Multiline).validator(Validator::MaxLength(2000)),
    ]
}

pub fn contact_values(contact: &Contact) -> HashMap<FieldId, String> {
    let optional = |v: &Option<String>| v.clone().unwrap_or_default();
    HashMap::from([
        (FieldId::from("first_name"), contact.first_name.clone()),
        (FieldId::from("last_name"), contact.last_name.clone()),
        (FieldId::from("email"), optional(&contact.email)),
        (FieldId::from("phone"), optional(&contact.phone)),
        (FieldId::from("company"), optional(&contact.company)),
        (FieldId::from("notes"), optional(&contact.notes)),
    ])
}

#[derive(Debug, Clone)]
pub struct Contacts {
    ctx: ResourceContext,
}

impl Contacts {
    pub fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ResourceContext {
        &self.ctx
    }

    fn remember(&self, contact: &Contact) {
        if let Err(e) = self
            .ctx
            .cache
            .set_query_data(keys::contact(&contact.slug), contact)
        {
            warn!(error = %e, "could not cache contact");
        }
    }

    #[instrument(skip(self), fields(key = %keys::contact_list(query)))]
    pub async fn list(&self, query: &ContactListQuery) -> AppResult<Paginated<Contact>> {
        let key = keys::contact_list(query);
        let opts = query.apply(self.ctx.authed());
        let client = &self.ctx.client;
        let fetch = self.ctx.cache.fetch_query(&key, || async move {
            valid(client.get::<Paginated<Contact>>("/contacts", opts).await?)
        });
        self.ctx.guard("list_contacts", fetch).await
    }

    /// `Ok(None)` when the server has no such contact.
    #[instrument(skip(self))]
    pub async fn get(&self, slug: &str) -> AppResult<Option<Contact>> {
        let path = match contact_path(slug) {
            Ok(path) => path,
            Err(e) => return Err(self.ctx.fail("get_contact", e).await),
        };
        let key = keys::contact(slug);
        let opts = self.ctx.authed();
        let client = &self.ctx.client;
        let result = self
            .ctx
            .cache
            .fetch_query(&key, || async move {
                valid(client.get::<Contact>(&path, opts).await?)
            })
            .await;
        match result {
            Ok(contact) => Ok(Some(contact)),
            Err(e) if e.kind == ErrorKind::NotFound => {
                debug!(slug, "contact not found");
                self.ctx.cache.remove(&key);
                Ok(None)
            }
            Err(e) => Err(self.ctx.fail("get_contact", e).await),
        }
    }

    #[instrument(skip_all)]
    pub async fn create(&self, input: &ContactInput) -> AppResult<Contact> {
        self.ctx
            .guard("create_contact", async {
                let contact: Contact = valid(
                    self.ctx
                        .client
                        .post("/contacts", Body::json(input)?, self.ctx.authed())
                        .await?,
                )?;
                self.remember(&contact);
                self.ctx.cache.invalidate(&keys::contact_lists());
                Ok(contact)
            })
            .await
    }

    #[instrument(skip(self, input))]
    pub async fn update(&self, slug: &str, input: &ContactInput) -> AppResult<Contact> {
        self.ctx
            .guard("update_contact", async {
                let path = contact_path(slug)?;
                let contact: Contact = valid(
                    self.ctx
                        .client
                        .patch(&path, Body::json(input)?, self.ctx.authed())
                        .await?,
                )?;
                if contact.slug != slug {
                    self.ctx.cache.remove(&keys::contact(slug));
                }
                self.remember(&contact);
                self.ctx.cache.invalidate(&keys::contact_lists());
                Ok(contact)
            })
            .await
    }

    pub async fn update_field(&self, slug: &str, field: &FieldId, value: &str) -> AppResult<Contact> {
        let input = match contact_patch(field, value) {
            Ok(input) => input,
            Err(e) => return Err(self.ctx.fail("update_contact", e).await),
        };
        self.update(slug, &input).await
    }

    /// Removes the contact from every cached list page before the request;
    /// restores them if the server refuses.
    #[instrument(skip(self))]
    pub async fn delete(&self, slug: &str) -> AppResult<()> {
        let path = match contact_path(slug) {
            Ok(path) => path,
            Err(e) => return Err(self.ctx.fail("delete_contact", e).await),
        };
        let mutation = DeleteContact {
            ctx: &self.ctx,
            slug,
            path,
        };
        match run_optimistic(&self.ctx.cache, &mutation).await {
            Ok(()) => {
                self.ctx.cache.remove(&keys::contact(slug));
                Ok(())
            }
            Err(e) => Err(self.ctx.fail("delete_contact", e).await),
        }
    }

    /// Uploads a new avatar after downscaling it on the blocking pool.
    #[instrument(skip(self, image), fields(input_size = image.len()))]
    pub async fn upload_avatar(&self, slug: &str, image: Vec<u8>) -> AppResult<Contact> {
        self.ctx
            .guard("upload_contact_avatar", async {
                let path = format!("{}/avatar", contact_path(slug)?);
                let prepared = prepare_avatar(image).await?;
                let contact: Contact = valid(
                    self.ctx
                        .client
                        .post(&path, prepared.into_multipart("avatar"), self.ctx.authed())
                        .await?,
                )?;
                self.remember(&contact);
                self.ctx.cache.invalidate(&keys::contact_lists());
                Ok(contact)
            })
            .await
    }
}

struct DeleteContact<'a> {
    ctx: &'a ResourceContext,
    slug: &'a str,
    path: String,
}

#[async_trait::async_trait]
impl<'a> OptimisticMutation for DeleteContact<'a> {
    type Output = ();
    type Data = Paginated<Contact>;

    fn name(&self) -> &'static str {
        "delete_contact"
    }

    fn affected(&self) -> QueryKey {
        keys::contact_lists()
    }

    fn apply(&self, _key: &QueryKey, mut page: Paginated<Contact>) -> Paginated<Contact> {
        let before = page.items.len();
        page.items.retain(|c| c.slug != self.slug);
        let removed = (before - page.items.len()) as u64;
        page.count = page.count.saturating_sub(removed);
        page
    }

    async fn execute(&self) -> Result<(), ApiError> {
        self.ctx.client.delete_empty(&self.path, self.ctx.authed()).await
    }
}

/// Search and sort for the contacts list. Keystrokes and sort changes are
/// debounced; only the last change in a burst hits the server.
#[derive(Debug)]
pub struct ContactSearch {
    contacts: Contacts,
    debouncer: Debouncer,
    query: Mutex<ContactListQuery>,
}

impl ContactSearch {
    pub fn new(contacts: Contacts, delay: Duration) -> Self {
        Self {
            contacts,
            debouncer: Debouncer::new(delay),
            query: Mutex::new(ContactListQuery::default()),
        }
    }

    pub fn query(&self) -> ContactListQuery {
        self.query
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(ContactListQuery) -> ContactListQuery) -> ContactListQuery {
        let mut query = self.query.lock().unwrap_or_else(PoisonError::into_inner);
        *query = f(query.clone());
        query.clone()
    }

    /// `None` when a later change superseded this one.
    pub async fn set_search(&self, text: &str) -> Option<AppResult<Paginated<Contact>>> {
        let query = self.update(|q| q.with_search(text));
        self.run(query).await
    }

    pub async fn set_sort(
        &self,
        sort: SortField,
        order: SortOrder,
    ) -> Option<AppResult<Paginated<Contact>>> {
        let query = self.update(|q| q.sorted(sort, order));
        self.run(query).await
    }

    /// Pagination is not debounced.
    pub async fn load_page(&self, offset: u32) -> AppResult<Paginated<Contact>> {
        let query = self.update(|q| q.page(offset));
        self.contacts.list(&query).await
    }

    async fn run(&self, query: ContactListQuery) -> Option<AppResult<Paginated<Contact>>> {
        let query = self.debouncer.settle(query).await?;
        Some(self.contacts.list(&query).await)
    }
}

/// Saves contact detail fields one at a time.
#[derive(Debug, Clone)]
pub struct ContactFieldSaver {
    contacts: Contacts,
    slug: String,
}

impl ContactFieldSaver {
    pub fn new(contacts: Contacts, slug: impl Into<String>) -> Self {
        Self {
            contacts,
            slug: slug.into(),
        }
    }
}

#[async_trait::async_trait]
impl FieldSaver for ContactFieldSaver {
    async fn save(&self, field: &FieldId, value: &str) -> Result<(), SaveError> {
        self.contacts
            .update_field(&self.slug, field, value)
            .await
            .map(|_| ())
            .map_err(|e| SaveError::for_field(field, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::MockReply;
    use crate::capabilities::HttpMethod;
    use crate::resources::testing::fixture;
    use serde_json::{json, Value};

    fn contact_json(slug: &str, first: &str) -> Value {
        json!({"id": format!("id-{slug}"), "slug": slug, "first_name": first, "last_name": "X", "tags": []})
    }

    fn page(slugs: &[&str]) -> Value {
        let items: Vec<Value> = slugs.iter().map(|s| contact_json(s, s)).collect();
        json!({"items": items, "count": slugs.len()})
    }

    #[test]
    fn query_params_and_cache_segment() {
        let q = ContactListQuery::default()
            .with_search("  ada ")
            .sorted(SortField::LastName, SortOrder::Desc);
        assert_eq!(q.search.as_deref(), Some("ada"));
        assert_eq!(
            q.cache_segment(),
            "search=ada&sort=last_name&order=desc&limit=20&offset=0"
        );
        let opts = q.apply(FetchOptions::default());
        assert!(opts.query.contains(&("search".to_string(), "ada".to_string())));
        assert!(opts.query.contains(&("limit".to_string(), "20".to_string())));

        let blank = ContactListQuery::default().with_search("   ");
        assert_eq!(blank.search, None);
        let big = ContactListQuery {
            limit: 1000,
            ..ContactListQuery::default()
        };
        assert_eq!(big.effective_limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn next_page_stops_at_total() {
        let q = ContactListQuery::default();
        assert_eq!(q.next_page(45).map(|p| p.offset), Some(20));
        assert_eq!(q.page(40).next_page(45), None);
    }

    #[test]
    fn patch_targets_one_field() {
        let input = contact_patch(&FieldId::from("phone"), " 555 ").unwrap();
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            json!({"phone": "555"})
        );
        let err = contact_patch(&FieldId::from("slug"), "x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn list_is_cached_until_invalidated() {
        let f = fixture().await;
        f.mock
            .on(HttpMethod::Get, "/contacts", MockReply::ok(page(&["ada", "bob"])));
        let contacts = Contacts::new(f.ctx.clone());
        let q = ContactListQuery::default().with_search("a");

        let first = contacts.list(&q).await.unwrap();
        assert_eq!(first.items.len(), 2);
        contacts.list(&q).await.unwrap();
        assert_eq!(f.mock.count(HttpMethod::Get, "/contacts"), 1);

        let sent = f.mock.last(HttpMethod::Get, "/contacts").unwrap();
        assert!(sent.url().as_str().contains("search=a"));
        assert!(sent.headers().get("authorization").is_some());

        f.ctx.cache.invalidate(&keys::contacts());
        contacts.list(&q).await.unwrap();
        assert_eq!(f.mock.count(HttpMethod::Get, "/contacts"), 2);
    }

    #[tokio::test]
    async fn missing_contact_is_none() {
        let f = fixture().await;
        f.mock.on(
            HttpMethod::Get,
            "/contacts/ghost",
            MockReply::status(404, json!({"detail": "Not found."})),
        );
        let contacts = Contacts::new(f.ctx.clone());
        assert_eq!(contacts.get("ghost").await.unwrap(), None);
        assert!(!f.ctx.cache.contains(&keys::contact("ghost")));
        assert!(f.reporter.reports.lock().unwrap().is_empty());

        assert_eq!(
            contacts.get("bad/slug").await.unwrap_err().kind,
            ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn create_invalidates_lists_and_caches_detail() {
        let f = fixture().await;
        f.mock
            .on(HttpMethod::Get, "/contacts", MockReply::ok(page(&["bob"])))
            .on(HttpMethod::Post, "/contacts", MockReply::status(201, contact_json("ada", "Ada")));
        let contacts = Contacts::new(f.ctx.clone());
        let q = ContactListQuery::default();
        contacts.list(&q).await.unwrap();

        let created = contacts
            .create(&ContactInput {
                first_name: Some("Ada".into()),
                ..ContactInput::default()
            })
            .await
            .unwrap();
        assert_eq!(created.slug, "ada");
        assert!(f.ctx.cache.entry(&keys::contact_list(&q)).unwrap().stale);
        let cached: Contact = f.ctx.cache.get_query_data(&keys::contact("ada")).unwrap();
        assert_eq!(cached, created);
    }

    #[tokio::test]
    async fn failed_delete_restores_every_list_variant() {
        let f = fixture().await;
        let contacts = Contacts::new(f.ctx.clone());
        let all = ContactListQuery::default();
        let searched = ContactListQuery::default().with_search("a");
        f.ctx
            .cache
            .set_raw(keys::contact_list(&all), page(&["ada", "bob"]));
        f.ctx
            .cache
            .set_raw(keys::contact_list(&searched), page(&["ada"]));
        f.mock.on(
            HttpMethod::Delete,
            "/contacts/ada",
            MockReply::status(500, json!({})),
        );

        let err = contacts.delete("ada").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(
            f.ctx.cache.get_raw(&keys::contact_list(&all)),
            Some(page(&["ada", "bob"]))
        );
        assert_eq!(
            f.ctx.cache.get_raw(&keys::contact_list(&searched)),
            Some(page(&["ada"]))
        );
        let reports = f.reporter.reports.lock().unwrap().clone();
        assert_eq!(reports, vec![("delete_contact".to_string(), "INTERNAL_ERROR".to_string())]);
    }

    #[tokio::test]
    async fn successful_delete_drops_contact() {
        let f = fixture().await;
        let contacts = Contacts::new(f.ctx.clone());
        let all = ContactListQuery::default();
        f.ctx
            .cache
            .set_raw(keys::contact_list(&all), page(&["ada", "bob"]));
        f.ctx.cache.set_raw(keys::contact("ada"), contact_json("ada", "Ada"));
        f.mock
            .on(HttpMethod::Delete, "/contacts/ada", MockReply::Empty(204));

        contacts.delete("ada").await.unwrap();
        let list: Paginated<Contact> = f.ctx.cache.get_query_data(&keys::contact_list(&all)).unwrap();
        assert_eq!(list.count, 1);
        assert_eq!(list.items[0].slug, "bob");
        assert!(!f.ctx.cache.contains(&keys::contact("ada")));
    }

    #[tokio::test]
    async fn auth_failure_ends_session() {
        let f = fixture().await;
        f.mock
            .on(HttpMethod::Get, "/contacts", MockReply::status(401, json!({})))
            .on(HttpMethod::Post, "/auth/refresh", MockReply::status(401, json!({})));
        let contacts = Contacts::new(f.ctx.clone());

        let err = contacts.list(&ContactListQuery::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert!(!f.ctx.session.is_authenticated().await);
    }

    #[tokio::test]
    async fn field_saver_maps_server_validation_to_inline_error() {
        let f = fixture().await;
        f.mock.on(
            HttpMethod::Patch,
            "/contacts/ada",
            MockReply::status(400, json!({"message": "Enter a valid phone number."})),
        );
        let saver = ContactFieldSaver::new(Contacts::new(f.ctx.clone()), "ada");
        let err = saver
            .save(&FieldId::from("phone"), "12")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SaveError::Invalid {
                field: FieldId::from("phone"),
                message: "Enter a valid phone number.".into()
            }
        );
        let sent = f.mock.last(HttpMethod::Patch, "/contacts/ada").unwrap();
        assert_eq!(sent.json_body(), Some(json!({"phone": "12"})));
    }

    #[tokio::test(start_paused = true)]
    async fn search_burst_sends_one_request() {
        let f = fixture().await;
        f.mock
            .on(HttpMethod::Get, "/contacts", MockReply::ok(page(&["ada"])));
        let search = std::sync::Arc::new(ContactSearch::new(
            Contacts::new(f.ctx.clone()),
            Duration::from_millis(300),
        ));

        let early = {
            let s = search.clone();
            tokio::spawn(async move { s.set_search("a").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let last = search.set_search("ad").await;

        assert!(early.await.unwrap().is_none());
        assert_eq!(last.unwrap().unwrap().items.len(), 1);
        assert_eq!(f.mock.count(HttpMethod::Get, "/contacts"), 1);
        assert_eq!(search.query().search.as_deref(), Some("ad"));
        let sent = f.mock.last(HttpMethod::Get, "/contacts").unwrap();
        assert!(sent.url().as_str().contains("search=ad"));
    }

    #[test]
    fn cached_shapes_are_told_apart() {
        let one: ContactData = serde_json::from_value(contact_json("ada", "Ada")).unwrap();
        assert!(matches!(one, ContactData::One(_)));
        let many: ContactData = serde_json::from_value(page(&["ada"])).unwrap();
        let ContactData::Page(p) = many.modify("ada", |c| c.first_name = "Augusta".into()) else {
            panic!("expected a page");
        };
        assert_eq!(p.items[0].first_name, "Augusta");
    }
}
