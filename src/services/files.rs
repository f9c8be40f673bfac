//! File URLs and protected file tokens.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::client::{decode, PocketBase, SendOptions};
use crate::error::ClientError;
use crate::models::RecordModel;
use crate::services::{encode_segment, RequestOptions};

#[derive(Debug, Default, Deserialize)]
struct FileToken {
    #[serde(default)]
    token: String,
}

/// Options for [`FileService::get_url`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileUrlOptions {
    /// Thumb size such as `100x100`.
    pub thumb: Option<String>,
    /// Token for protected files.
    pub token: Option<String>,
    /// Forces a `Content-Disposition: attachment` response.
    pub download: bool,
    pub query: Map<String, Value>,
}

#[derive(Clone, Debug)]
pub struct FileService {
    client: PocketBase,
}

impl FileService {
    pub fn new(client: PocketBase) -> Self {
        Self { client }
    }

    /// Absolute URL of `file_name` attached to `record`.
    ///
    /// Returns an empty string when the file name or record id is missing.
    pub fn get_url(&self, record: &RecordModel, file_name: &str, options: &FileUrlOptions) -> String {
        if file_name.is_empty() || record.id().is_empty() {
            return String::new();
        }

        let collection = if record.collection_id().is_empty() {
            record.collection_name()
        } else {
            record.collection_id()
        };
        let path = format!(
            "/api/files/{}/{}/{}",
            encode_segment(collection),
            encode_segment(record.id()),
            encode_segment(file_name)
        );

        let mut query = options.query.clone();
        if let Some(thumb) = options.thumb.as_ref().filter(|t| !t.is_empty()) {
            query.insert("thumb".to_string(), Value::String(thumb.clone()));
        }
        if let Some(token) = options.token.as_ref().filter(|t| !t.is_empty()) {
            query.insert("token".to_string(), Value::String(token.clone()));
        }
        if options.download {
            query.insert("download".to_string(), Value::String(String::new()));
        }

        self.client.build_url(&path, Some(&query))
    }

    /// Requests a short-lived token for protected files.
    pub async fn get_token(&self, options: &RequestOptions) -> Result<String, ClientError> {
        let send = options
            .send_options(SendOptions::post())
            .body(options.enriched_body(Vec::<(String, Value)>::new()));
        let value = self.client.send("/api/files/token", send).await?;
        Ok(decode::<FileToken>(value).token)
    }
}
