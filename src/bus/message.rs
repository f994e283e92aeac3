//! Message definitions for the bus
//!
//! `Message` is the canonical internal representation delivered to
//! subscribers and evaluated by the routing engine. Every field is
//! JSON-serializable so a message can cross process boundaries through a
//! network adapter without a separate wire type.
//!
//! Notes on fields:
//! - `topic`: dot-delimited hierarchical address used for routing
//! - `payload`: arbitrary JSON value (the protocol is JSON)
//! - `id`: opaque unique id; the bus generates one on publish if the
//!   producer leaves it empty
//! - `created_at`: milliseconds since UNIX epoch; stamped by the bus upon
//!   publish if left at zero
//! - `retain`: marks this message as the topic's single retained value
//! - `reply_topic` / `correlation_id`: request/reply correlation
//! - `headers`: free-form string metadata (tracing, source, tenant, tags)
//!
//! Once `publish` has accepted a message it is shared behind `Arc` and never
//! mutated again; the bus fills in `id`/`created_at` before sharing and
//! leaves every producer-supplied field untouched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Value,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub retain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl Message {
    /// Create a bare message for `topic` carrying `payload`. Remaining
    /// fields start empty and are stamped by the bus on publish.
    pub fn new(topic: &str, payload: Value) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
            id: String::new(),
            created_at: 0,
            retain: false,
            reply_topic: None,
            correlation_id: None,
            headers: None,
        }
    }

    /// Look up a header value by key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.as_ref()?.get(key).map(String::as_str)
    }

    /// Tags attached to this message, parsed from the comma-separated
    /// `tags` header. Empty when the header is absent.
    pub fn tags(&self) -> Vec<&str> {
        match self.header("tags") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Per-publish options supplied alongside topic and payload.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub retain: bool,
    pub headers: Option<HashMap<String, String>>,
    pub reply_topic: Option<String>,
    pub correlation_id: Option<String>,
    /// Identifies the producer for rate limiting. Defaults to `anonymous`.
    pub client_id: Option<String>,
}

impl PublishOptions {
    pub fn retained() -> Self {
        Self {
            retain: true,
            ..Self::default()
        }
    }

    pub fn from_client(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            ..Self::default()
        }
    }
}
