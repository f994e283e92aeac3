//! Route actions
//!
//! The side effects a matched route performs, in order: `emit` publishes a
//! new message (optionally inheriting fields from the source), `forward`
//! re-publishes the transformed message under a different topic, `log`
//! renders a template to the tracing sink (never back onto the bus), and
//! `call` invokes a registered handler fire-and-forget: the routing pass
//! spawns it and moves on.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::Message;

use super::condition::lookup;

/// A registered CALL handler. May do async work; the routing engine spawns
/// the returned future and never awaits it. Failures after detachment are
/// surfaced on the bus error stream.
pub type ActionHandlerFn = Arc<
    dyn Fn(Arc<Message>) -> BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + Sync,
>;

/// Action as it appears in route configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Action {
    /// Publish a new message on `topic`. `payload` overrides; otherwise the
    /// payload is inherited when `inherit` names it. `inherit` may list
    /// `payload`, `headers`, `correlation_id`, `reply_topic`.
    Emit {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inherit: Vec<String>,
    },
    /// Re-publish the transformed message under a new topic, with a fresh id
    /// and timestamp. The retain flag is not carried over.
    Forward { topic: String },
    /// Render `template` (with `{dotted.path}` placeholders resolved against
    /// the serialized message) to the tracing sink at `level` (default info).
    Log {
        template: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
    },
    /// Invoke the named registered handler with the message, detached.
    Call { handler: String },
}

impl Action {
    /// Build the message an `emit` action publishes.
    pub fn emit_message(
        topic: &str,
        payload: &Option<Value>,
        inherit: &[String],
        source: &Message,
    ) -> Message {
        let inherits = |field: &str| inherit.iter().any(|f| f == field);

        let mut msg = Message::new(
            topic,
            match payload {
                Some(p) => p.clone(),
                None if inherits("payload") => source.payload.clone(),
                None => Value::Null,
            },
        );
        if inherits("headers") {
            msg.headers = source.headers.clone();
        }
        if inherits("correlation_id") {
            msg.correlation_id = source.correlation_id.clone();
        }
        if inherits("reply_topic") {
            msg.reply_topic = source.reply_topic.clone();
        }
        msg
    }

    /// Build the message a `forward` action publishes: same content, new
    /// topic, fresh id/timestamp (stamped by the bus), never retained.
    pub fn forward_message(topic: &str, source: &Message) -> Message {
        let mut msg = Message::new(topic, source.payload.clone());
        msg.headers = source.headers.clone();
        msg.correlation_id = source.correlation_id.clone();
        msg.reply_topic = source.reply_topic.clone();
        msg
    }
}

/// Render a log template, substituting `{dotted.path}` placeholders with
/// values looked up in `doc`. Unresolvable placeholders render as `{path}`
/// unchanged so broken templates are visible in the log output.
pub fn render_template(template: &str, doc: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                match lookup(doc, path) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(value) => out.push_str(&value.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(path);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
