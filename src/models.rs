//! Response models shared by the services.
//!
//! Records are schemaless on the wire, so [`RecordModel`] keeps the raw JSON
//! object and exposes typed, non-panicking accessors over it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single collection record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordModel {
    data: Map<String, Value>,
}

impl RecordModel {
    /// Wraps an existing JSON object.
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Builds a record from any JSON value, keeping only objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(data) => Some(Self { data }),
            _ => None,
        }
    }

    pub fn id(&self) -> &str {
        self.str_field("id")
    }

    pub fn collection_id(&self) -> &str {
        self.str_field("collectionId")
    }

    pub fn collection_name(&self) -> &str {
        self.str_field("collectionName")
    }

    /// Returns the raw value at a dot-notation path (`"expand.author.name"`,
    /// `"tags.0"`).
    pub fn get_value(&self, path: &str) -> Option<&Value> {
        let mut parts = path.trim().split('.');
        let first = parts.next()?;
        let mut current = self.data.get(first)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Extracts and converts the value at a dot-notation path.
    ///
    /// Missing paths, nulls, and values that do not convert all yield `None`.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        match self.get_value(path)? {
            Value::Null => None,
            value => serde_json::from_value(value.clone()).ok(),
        }
    }

    /// Sets a top-level field.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }

    /// Returns `true` when this record is `id` within the named collection
    /// (matched by collection id or name).
    pub fn is_same_record(&self, id: &str, collection_id_or_name: &str) -> bool {
        !self.id().is_empty()
            && self.id() == id
            && (self.collection_id() == collection_id_or_name
                || self.collection_name() == collection_id_or_name)
    }

    fn str_field(&self, key: &str) -> &str {
        self.data.get(key).and_then(Value::as_str).unwrap_or("")
    }
}

/// One page of a paginated list response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultList<T> {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default)]
    pub total_items: i64,
    #[serde(default)]
    pub total_pages: i64,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> Default for ResultList<T> {
    fn default() -> Self {
        Self {
            page: 0,
            per_page: 0,
            total_items: 0,
            total_pages: 0,
            items: Vec::new(),
        }
    }
}

/// Token and record returned by every auth endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordAuth {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub record: RecordModel,
    /// Provider metadata (OAuth2 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethodPassword {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub identity_fields: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthMethodToggle {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub duration: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethodProvider {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub code_verifier: String,
    #[serde(default)]
    pub code_challenge: String,
    #[serde(default)]
    pub code_challenge_method: String,
    #[serde(default)]
    pub auth_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthMethodOAuth2 {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub providers: Vec<AuthMethodProvider>,
}

/// Auth options enabled on an auth collection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthMethodsList {
    #[serde(default)]
    pub mfa: AuthMethodToggle,
    #[serde(default)]
    pub otp: AuthMethodToggle,
    #[serde(default)]
    pub password: AuthMethodPassword,
    #[serde(default)]
    pub oauth2: AuthMethodOAuth2,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpResponse {
    #[serde(default)]
    pub otp_id: String,
}

/// Per-request outcome of a batch call, in submission order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    #[serde(default)]
    pub status: u16,
    /// Usually null, an object, or a list of objects.
    #[serde(default)]
    pub body: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Payload pushed for record topics (`create`, `update`, `delete`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSubscriptionEvent {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub record: RecordModel,
}
