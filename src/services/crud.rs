//! Parametric CRUD over one base path.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::{decode, FilePart, PocketBase, SendOptions};
use crate::error::ClientError;
use crate::models::ResultList;
use crate::services::{encode_segment, RequestOptions};

/// Page size used by [`CrudService::get_full_list`] when none is given.
pub const DEFAULT_BATCH_SIZE: u32 = 500;
pub const DEFAULT_PER_PAGE: u32 = 30;

type AfterUpdate<T> = Arc<dyn Fn(&T) + Send + Sync>;
type AfterDelete = Arc<dyn Fn(&str) + Send + Sync>;

/// List, read, create, update, and delete items of type `T` under
/// `base_path`.
///
/// Resource-specific follow-up work runs through the optional `after_update`
/// and `after_delete` hooks.
pub struct CrudService<T> {
    client: PocketBase,
    base_path: String,
    after_update: Option<AfterUpdate<T>>,
    after_delete: Option<AfterDelete>,
    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for CrudService<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            base_path: self.base_path.clone(),
            after_update: self.after_update.clone(),
            after_delete: self.after_delete.clone(),
            _item: PhantomData,
        }
    }
}

impl<T> CrudService<T>
where
    T: DeserializeOwned + Default,
{
    pub fn new(client: PocketBase, base_path: impl Into<String>) -> Self {
        Self {
            client,
            base_path: base_path.into(),
            after_update: None,
            after_delete: None,
            _item: PhantomData,
        }
    }

    pub fn with_after_update<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.after_update = Some(Arc::new(hook));
        self
    }

    pub fn with_after_delete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.after_delete = Some(Arc::new(hook));
        self
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Fetches every page of `batch` items until a short page is returned.
    pub async fn get_full_list(
        &self,
        batch: u32,
        options: &RequestOptions,
    ) -> Result<Vec<T>, ClientError> {
        let per_page = if batch == 0 { DEFAULT_BATCH_SIZE } else { batch };
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let list = self.get_list(page, per_page, true, options).await?;
            let received = list.items.len();
            items.extend(list.items);
            if received < per_page as usize {
                break;
            }
            page += 1;
        }

        Ok(items)
    }

    pub async fn get_list(
        &self,
        page: u32,
        per_page: u32,
        skip_total: bool,
        options: &RequestOptions,
    ) -> Result<ResultList<T>, ClientError> {
        let mut query = options.enriched_query();
        query.entry("page").or_insert_with(|| page.into());
        query.entry("perPage").or_insert_with(|| per_page.into());
        query.entry("skipTotal").or_insert_with(|| skip_total.into());

        let send = SendOptions::get()
            .headers(options.headers.clone())
            .extend_query(query);
        let value = self.client.send(&self.base_path, send).await?;
        Ok(decode(value))
    }

    /// Fails with a synthesized 404 when `id` is blank.
    pub async fn get_one(&self, id: &str, options: &RequestOptions) -> Result<T, ClientError> {
        if id.trim().is_empty() {
            return Err(ClientError::not_found(
                self.client.build_url(&format!("{}/", self.base_path), None),
                "Missing required record id.",
            ));
        }
        let value = self
            .client
            .send(&self.item_path(id), options.send_options(SendOptions::get()))
            .await?;
        Ok(decode(value))
    }

    /// First item matching `filter`, or a synthesized 404.
    pub async fn get_first_list_item(
        &self,
        filter: &str,
        options: &RequestOptions,
    ) -> Result<T, ClientError> {
        let options = options.clone().filter(filter);
        let list = self.get_list(1, 1, true, &options).await?;
        list.items.into_iter().next().ok_or_else(|| {
            ClientError::not_found(
                self.client.build_url(&format!("{}/", self.base_path), None),
                "The requested resource wasn't found.",
            )
        })
    }

    pub async fn create(
        &self,
        body: Value,
        files: Vec<FilePart>,
        options: &RequestOptions,
    ) -> Result<T, ClientError> {
        let send = options
            .send_options(SendOptions::post())
            .body(body)
            .files(files);
        let value = self.client.send(&self.base_path, send).await?;
        Ok(decode(value))
    }

    pub async fn update(
        &self,
        id: &str,
        body: Value,
        files: Vec<FilePart>,
        options: &RequestOptions,
    ) -> Result<T, ClientError> {
        let send = options
            .send_options(SendOptions::patch())
            .body(body)
            .files(files);
        let value = self.client.send(&self.item_path(id), send).await?;
        let item: T = decode(value);
        if let Some(hook) = &self.after_update {
            hook(&item);
        }
        Ok(item)
    }

    pub async fn delete(&self, id: &str, options: &RequestOptions) -> Result<(), ClientError> {
        let mut send = options.send_options(SendOptions::delete());
        if !options.body.is_empty() {
            send = send.body(Value::Object(options.body.clone()));
        }
        self.client.send(&self.item_path(id), send).await?;
        if let Some(hook) = &self.after_delete {
            hook(id);
        }
        Ok(())
    }

    fn item_path(&self, id: &str) -> String {
        format!("{}/{}", self.base_path, encode_segment(id))
    }
}
