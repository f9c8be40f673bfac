//! Records of one collection: CRUD with auth-store synchronization,
//! realtime subscriptions, and the auth flows of auth collections.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::auth_store::{token_payload, AuthStore};
use crate::client::{decode, FilePart, PocketBase, SendOptions};
use crate::error::ClientError;
use crate::models::{AuthMethodsList, OtpResponse, RecordAuth, RecordModel, RecordSubscriptionEvent, ResultList};
use crate::realtime::proto::{SseMessage, SubscribeOptions};
use crate::realtime::service::Unsubscribe;
use crate::services::crud::CrudService;
use crate::services::{encode_segment, RequestOptions};

/// Reserved realtime topic carrying OAuth2 redirect payloads.
pub const OAUTH2_TOPIC: &str = "@oauth2";
/// Backend route the OAuth2 provider redirects to.
pub const OAUTH2_REDIRECT_PATH: &str = "/api/oauth2-redirect";

const AUTH_METHODS_FIELDS: &str = "mfa,otp,password,oauth2";

/// Settings for [`RecordService::auth_with_oauth2`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OAuth2Options {
    /// Replaces the provider's default scopes when not empty.
    pub scopes: Vec<String>,
    /// Data used when the OAuth2 sign-in creates a new record.
    pub create_data: Option<Value>,
    pub request: RequestOptions,
}

#[derive(Debug, Default, Deserialize)]
struct OAuth2Redirect {
    #[serde(default)]
    state: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    error: String,
}

/// Service for the records of one collection.
#[derive(Clone)]
pub struct RecordService {
    client: PocketBase,
    collection: String,
    crud: CrudService<RecordModel>,
}

impl RecordService {
    pub fn new(client: PocketBase, collection_id_or_name: impl Into<String>) -> Self {
        let collection = collection_id_or_name.into();
        let base_path = format!(
            "/api/collections/{}/records",
            encode_segment(&collection)
        );

        let store = client.auth_store().clone();
        let update_collection = collection.clone();
        let delete_store = store.clone();
        let delete_collection = collection.clone();
        let crud = CrudService::new(client.clone(), base_path)
            .with_after_update(move |record: &RecordModel| {
                merge_auth_record(&store, &update_collection, record);
            })
            .with_after_delete(move |id: &str| {
                let matches = delete_store
                    .record()
                    .is_some_and(|current| current.is_same_record(id, &delete_collection));
                if matches {
                    debug!(event = "auth_record_deleted", id);
                    delete_store.clear();
                }
            });

        Self {
            client,
            collection,
            crud,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn crud(&self) -> &CrudService<RecordModel> {
        &self.crud
    }

    fn collection_path(&self, suffix: &str) -> String {
        format!(
            "/api/collections/{}/{}",
            encode_segment(&self.collection),
            suffix
        )
    }

    // Records

    pub async fn get_full_list(
        &self,
        batch: u32,
        options: &RequestOptions,
    ) -> Result<Vec<RecordModel>, ClientError> {
        self.crud.get_full_list(batch, options).await
    }

    pub async fn get_list(
        &self,
        page: u32,
        per_page: u32,
        skip_total: bool,
        options: &RequestOptions,
    ) -> Result<ResultList<RecordModel>, ClientError> {
        self.crud.get_list(page, per_page, skip_total, options).await
    }

    pub async fn get_one(
        &self,
        id: &str,
        options: &RequestOptions,
    ) -> Result<RecordModel, ClientError> {
        self.crud.get_one(id, options).await
    }

    pub async fn get_first_list_item(
        &self,
        filter: &str,
        options: &RequestOptions,
    ) -> Result<RecordModel, ClientError> {
        self.crud.get_first_list_item(filter, options).await
    }

    pub async fn create(
        &self,
        body: Value,
        files: Vec<FilePart>,
        options: &RequestOptions,
    ) -> Result<RecordModel, ClientError> {
        self.crud.create(body, files, options).await
    }

    /// Updates a record. When it is the authenticated record, the response is
    /// merged into the auth store.
    pub async fn update(
        &self,
        id: &str,
        body: Value,
        files: Vec<FilePart>,
        options: &RequestOptions,
    ) -> Result<RecordModel, ClientError> {
        self.crud.update(id, body, files, options).await
    }

    /// Deletes a record. Deleting the authenticated record clears the auth
    /// store.
    pub async fn delete(&self, id: &str, options: &RequestOptions) -> Result<(), ClientError> {
        self.crud.delete(id, options).await
    }

    // Realtime

    /// Subscribes to `topic` within this collection (`*` for every record, or
    /// a record id).
    pub async fn subscribe<F>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Unsubscribe, ClientError>
    where
        F: Fn(RecordSubscriptionEvent) + Send + Sync + 'static,
    {
        let topic = format!("{}/{}", self.collection, topic);
        self.client
            .realtime()
            .subscribe(&topic, options, move |message: &SseMessage| {
                match message.json::<RecordSubscriptionEvent>() {
                    Ok(event) => callback(event),
                    Err(err) => {
                        warn!(event = "record_event_undecodable", topic = %message.event, error = %err)
                    }
                }
            })
            .await
    }

    /// Removes the subscriptions of `topic` in this collection, or every
    /// subscription of the collection when `topic` is `None`.
    pub async fn unsubscribe(&self, topic: Option<&str>) -> Result<(), ClientError> {
        let realtime = self.client.realtime();
        match topic.filter(|t| !t.is_empty()) {
            Some(topic) => {
                realtime
                    .unsubscribe(Some(&format!("{}/{}", self.collection, topic)))
                    .await
            }
            None => realtime.unsubscribe_by_prefix(&self.collection).await,
        }
    }

    // Auth

    pub async fn list_auth_methods(
        &self,
        options: &RequestOptions,
    ) -> Result<AuthMethodsList, ClientError> {
        let send = options
            .send_options(SendOptions::get())
            .query("fields", AUTH_METHODS_FIELDS);
        let value = self
            .client
            .send(&self.collection_path("auth-methods"), send)
            .await?;
        Ok(decode(value))
    }

    pub async fn auth_with_password(
        &self,
        identity: &str,
        password: &str,
        options: &RequestOptions,
    ) -> Result<RecordAuth, ClientError> {
        let body = options.enriched_body([
            ("identity", json!(identity)),
            ("password", json!(password)),
        ]);
        self.authenticate("auth-with-password", body, options).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn auth_with_oauth2_code(
        &self,
        provider: &str,
        code: &str,
        code_verifier: &str,
        redirect_url: &str,
        create_data: Option<Value>,
        options: &RequestOptions,
    ) -> Result<RecordAuth, ClientError> {
        let mut fields = vec![
            ("provider", json!(provider)),
            ("code", json!(code)),
            ("codeVerifier", json!(code_verifier)),
            ("redirectUrl", json!(redirect_url)),
        ];
        if let Some(create_data) = create_data {
            fields.push(("createData", create_data));
        }
        let body = options.enriched_body(fields);
        self.authenticate("auth-with-oauth2", body, options).await
    }

    /// Runs the interactive OAuth2 flow.
    ///
    /// Subscribes to the reserved OAuth2 topic, hands the provider URL (with
    /// the realtime client id as `state`) to `url_callback`, then waits for
    /// the redirect payload and exchanges its code. The subscription is
    /// always removed before returning.
    pub async fn auth_with_oauth2<F>(
        &self,
        provider_name: &str,
        url_callback: F,
        options: OAuth2Options,
    ) -> Result<RecordAuth, ClientError>
    where
        F: FnOnce(Url) + Send,
    {
        let methods = self.list_auth_methods(&RequestOptions::default()).await?;
        let provider = methods
            .oauth2
            .providers
            .into_iter()
            .find(|p| p.name == provider_name)
            .ok_or_else(|| {
                ClientError::application(format!("missing or invalid provider \"{provider_name}\""))
            })?;
        let redirect_url = self.client.build_url(OAUTH2_REDIRECT_PATH, None);

        let (unsubscribe, mut messages) = self
            .client
            .realtime()
            .subscribe_channel(OAUTH2_TOPIC, SubscribeOptions::new())
            .await?;

        let outcome = async {
            let state = self.client.realtime().client_id();
            let auth_url = oauth2_auth_url(&provider.auth_url, &redirect_url, &state, &options.scopes)?;
            url_callback(auth_url);

            let message = messages.recv().await.ok_or_else(|| {
                ClientError::application("realtime connection closed before the OAuth2 redirect")
            })?;
            let redirect: OAuth2Redirect = message.json().unwrap_or_default();

            if redirect.state.is_empty() || redirect.state != state {
                return Err(ClientError::application("State parameters don't match."));
            }
            if !redirect.error.is_empty() || redirect.code.is_empty() {
                return Err(ClientError::application(format!(
                    "OAuth2 redirect error or missing code: {}",
                    redirect.error
                )));
            }

            self.auth_with_oauth2_code(
                &provider.name,
                &redirect.code,
                &provider.code_verifier,
                &redirect_url,
                options.create_data.clone(),
                &options.request,
            )
            .await
        }
        .await;

        if let Err(err) = unsubscribe.unsubscribe().await {
            warn!(event = "oauth2_unsubscribe_failed", error = %err);
        }
        outcome
    }

    pub async fn auth_refresh(&self, options: &RequestOptions) -> Result<RecordAuth, ClientError> {
        let body = options.enriched_body(Vec::<(String, Value)>::new());
        self.authenticate("auth-refresh", body, options).await
    }

    pub async fn request_otp(
        &self,
        email: &str,
        options: &RequestOptions,
    ) -> Result<OtpResponse, ClientError> {
        let body = options.enriched_body([("email", json!(email))]);
        let send = options.send_options(SendOptions::post()).body(body);
        let value = self
            .client
            .send(&self.collection_path("request-otp"), send)
            .await?;
        Ok(decode(value))
    }

    pub async fn auth_with_otp(
        &self,
        otp_id: &str,
        password: &str,
        options: &RequestOptions,
    ) -> Result<RecordAuth, ClientError> {
        let body = options.enriched_body([
            ("otpId", json!(otp_id)),
            ("password", json!(password)),
        ]);
        self.authenticate("auth-with-otp", body, options).await
    }

    pub async fn request_password_reset(
        &self,
        email: &str,
        options: &RequestOptions,
    ) -> Result<(), ClientError> {
        let body = options.enriched_body([("email", json!(email))]);
        self.post_action("request-password-reset", body, options).await
    }

    pub async fn confirm_password_reset(
        &self,
        reset_token: &str,
        password: &str,
        password_confirm: &str,
        options: &RequestOptions,
    ) -> Result<(), ClientError> {
        let body = options.enriched_body([
            ("token", json!(reset_token)),
            ("password", json!(password)),
            ("passwordConfirm", json!(password_confirm)),
        ]);
        self.post_action("confirm-password-reset", body, options).await
    }

    pub async fn request_verification(
        &self,
        email: &str,
        options: &RequestOptions,
    ) -> Result<(), ClientError> {
        let body = options.enriched_body([("email", json!(email))]);
        self.post_action("request-verification", body, options).await
    }

    /// Confirms a verification token and marks the stored auth record as
    /// verified when the token belongs to it.
    pub async fn confirm_verification(
        &self,
        verification_token: &str,
        options: &RequestOptions,
    ) -> Result<(), ClientError> {
        let body = options.enriched_body([("token", json!(verification_token))]);
        self.post_action("confirm-verification", body, options).await?;

        let store = self.client.auth_store();
        if let Some(mut record) = token_owner(store, verification_token) {
            if !record.get::<bool>("verified").unwrap_or(false) {
                record.set("verified", Value::Bool(true));
                store.save(store.token(), Some(record));
            }
        }
        Ok(())
    }

    pub async fn request_email_change(
        &self,
        new_email: &str,
        options: &RequestOptions,
    ) -> Result<(), ClientError> {
        let body = options.enriched_body([("newEmail", json!(new_email))]);
        self.post_action("request-email-change", body, options).await
    }

    /// Confirms an email change and clears the auth store when the token
    /// belongs to the authenticated record.
    pub async fn confirm_email_change(
        &self,
        change_token: &str,
        password: &str,
        options: &RequestOptions,
    ) -> Result<(), ClientError> {
        let body = options.enriched_body([
            ("token", json!(change_token)),
            ("password", json!(password)),
        ]);
        self.post_action("confirm-email-change", body, options).await?;

        let store = self.client.auth_store();
        if token_owner(store, change_token).is_some() {
            store.clear();
        }
        Ok(())
    }

    /// Authenticates as another record and returns a separate client whose
    /// memory-only store holds the impersonated session.
    pub async fn impersonate(
        &self,
        record_id: &str,
        duration_secs: f64,
        options: &RequestOptions,
    ) -> Result<PocketBase, ClientError> {
        let body = options.enriched_body([("duration", json!(duration_secs))]);
        let mut send = options.send_options(SendOptions::post()).body(body);
        let token = self.client.auth_store().token();
        if !token.is_empty() && !send.headers.keys().any(|k| k.eq_ignore_ascii_case("authorization")) {
            send = send.header("Authorization", token);
        }

        let impersonated = PocketBase::with_options(
            self.client.base_url(),
            self.client.options().clone(),
            AuthStore::new(),
        )?;
        let path = self.collection_path(&format!("impersonate/{}", encode_segment(record_id)));
        let value = impersonated.send(&path, send).await?;
        let auth: RecordAuth = decode(value);
        impersonated
            .auth_store()
            .save(auth.token.clone(), Some(auth.record.clone()));
        Ok(impersonated)
    }

    async fn authenticate(
        &self,
        action: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<RecordAuth, ClientError> {
        let send = options.send_options(SendOptions::post()).body(body);
        let value = self.client.send(&self.collection_path(action), send).await?;
        let auth: RecordAuth = decode(value);
        self.client
            .auth_store()
            .save(auth.token.clone(), Some(auth.record.clone()));
        debug!(event = "auth_saved", collection = %self.collection, record_id = auth.record.id());
        Ok(auth)
    }

    async fn post_action(
        &self,
        action: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<(), ClientError> {
        let send = options.send_options(SendOptions::post()).body(body);
        self.client.send(&self.collection_path(action), send).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RecordService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordService")
            .field("collection", &self.collection)
            .finish()
    }
}

/// The stored auth record, when `token` was issued for it.
fn token_owner(store: &AuthStore, token: &str) -> Option<RecordModel> {
    let payload = token_payload(token)?;
    let record = store.record()?;
    let id = payload.get("id").and_then(Value::as_str)?;
    let collection_id = payload.get("collectionId").and_then(Value::as_str)?;
    (record.id() == id && record.collection_id() == collection_id).then_some(record)
}

/// Merges an updated record into the auth store when it is the
/// authenticated one. Existing `expand` entries are kept unless replaced.
fn merge_auth_record(store: &AuthStore, collection: &str, updated: &RecordModel) {
    let Some(current) = store.record() else {
        return;
    };
    if !current.is_same_record(updated.id(), collection) {
        return;
    }

    let mut data: Map<String, Value> = current.data().clone();
    let current_expand = data.get("expand").and_then(Value::as_object).cloned();
    for (key, value) in updated.data() {
        data.insert(key.clone(), value.clone());
    }
    if let Some(mut expand) = current_expand.filter(|e| !e.is_empty()) {
        if let Some(new_expand) = updated.data().get("expand").and_then(Value::as_object) {
            expand.extend(new_expand.clone());
        }
        data.insert("expand".to_string(), Value::Object(expand));
    }

    store.save(store.token(), Some(RecordModel::new(data)));
}

/// Appends the redirect URL to the provider URL and sets `state` (and
/// `scope`, when scopes are given).
fn oauth2_auth_url(
    provider_auth_url: &str,
    redirect_url: &str,
    state: &str,
    scopes: &[String],
) -> Result<Url, ClientError> {
    let mut url = Url::parse(&format!("{provider_auth_url}{redirect_url}"))
        .map_err(|err| ClientError::application(format!("invalid OAuth2 auth url: {err}")))?;

    let replace_scope = !scopes.is_empty();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "state" && !(replace_scope && key == "scope"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (key, value) in &kept {
            query.append_pair(key, value);
        }
        query.append_pair("state", state);
        if replace_scope {
            query.append_pair("scope", &scopes.join(" "));
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{merge_auth_record, oauth2_auth_url};
    use crate::auth_store::AuthStore;
    use crate::models::RecordModel;

    fn record(value: serde_json::Value) -> RecordModel {
        RecordModel::from_value(value).expect("object")
    }

    #[test]
    fn auth_url_carries_redirect_state_and_scopes() {
        let url = oauth2_auth_url(
            "https://provider.test/auth?client_id=abc&scope=email&state=old&redirect_uri=",
            "http://127.0.0.1:8090/api/oauth2-redirect",
            "client-1",
            &["openid".to_string(), "profile".to_string()],
        )
        .expect("url");

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("client_id".into(), "abc".into())));
        assert!(pairs.contains(&(
            "redirect_uri".into(),
            "http://127.0.0.1:8090/api/oauth2-redirect".into()
        )));
        assert!(pairs.contains(&("state".into(), "client-1".into())));
        assert!(pairs.contains(&("scope".into(), "openid profile".into())));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "state").count(), 1);
        assert_eq!(pairs.iter().filter(|(k, _)| k == "scope").count(), 1);
    }

    #[test]
    fn auth_url_keeps_provider_scope_without_overrides() {
        let url = oauth2_auth_url("https://p.test/a?scope=email&redirect_uri=", "http://x/r", "s", &[])
            .expect("url");
        assert!(url.query_pairs().any(|(k, v)| k == "scope" && v == "email"));
    }

    #[test]
    fn update_of_authenticated_record_merges_into_store() {
        let store = AuthStore::new();
        store.save(
            "token",
            Some(record(json!({
                "id": "u1",
                "collectionName": "users",
                "name": "old",
                "email": "a@b.c",
                "expand": {"team": {"id": "t1"}}
            }))),
        );

        merge_auth_record(
            &store,
            "users",
            &record(json!({"id": "u1", "collectionName": "users", "name": "new", "expand": {"org": {"id": "o1"}}})),
        );

        let merged = store.record().expect("record");
        assert_eq!(merged.get::<String>("name").as_deref(), Some("new"));
        assert_eq!(merged.get::<String>("email").as_deref(), Some("a@b.c"));
        assert_eq!(merged.get::<String>("expand.team.id").as_deref(), Some("t1"));
        assert_eq!(merged.get::<String>("expand.org.id").as_deref(), Some("o1"));
        assert_eq!(store.token(), "token");
    }

    #[test]
    fn update_of_other_record_leaves_store_alone() {
        let store = AuthStore::new();
        store.save("token", Some(record(json!({"id": "u1", "collectionName": "users", "name": "old"}))));

        merge_auth_record(&store, "users", &record(json!({"id": "u2", "name": "new"})));
        merge_auth_record(&store, "posts", &record(json!({"id": "u1", "name": "new"})));

        assert_eq!(
            store.record().and_then(|r| r.get::<String>("name")).as_deref(),
            Some("old")
        );
    }
}
