//! Message transforms
//!
//! A matched route may rewrite the message before its actions run. Four
//! operations: `identity` passes the message through, `pick` projects a
//! subset of dotted paths into a fresh payload, `map` applies a registered
//! named function to the value at one path, and `custom` applies a
//! registered named function to the whole serialized message.
//!
//! Named functions live in the routing engine's registry and are resolved at
//! evaluation time; an unregistered name is a reported error, never a
//! silent no-op. The source message is never mutated; transforms always
//! build a new one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bus::Message;
use crate::utils::error::BusError;

use super::condition::lookup;

/// A registered transform function: JSON value in, JSON value out. Used for
/// both `map` (applied to one path's value) and `custom` (applied to the
/// whole serialized message).
pub type TransformFn =
    Arc<dyn Fn(&Value) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Transform operation as it appears in route configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Transform {
    Identity,
    Pick { paths: Vec<String> },
    Map { path: String, func: String },
    Custom { func: String },
}

impl Transform {
    /// Name of the registered function this transform resolves, if any.
    pub fn func_name(&self) -> Option<&str> {
        match self {
            Transform::Map { func, .. } | Transform::Custom { func } => Some(func),
            _ => None,
        }
    }

    /// Apply this transform to `msg` (with `doc` its serialized form),
    /// producing a new message. `func` is the pre-resolved registered
    /// function for `map`/`custom`; the engine reports
    /// `TransformFunctionNotFound` before ever calling this.
    pub fn apply(
        &self,
        msg: &Arc<Message>,
        doc: &Value,
        func: Option<&TransformFn>,
    ) -> Result<Arc<Message>, BusError> {
        match self {
            Transform::Identity => Ok(msg.clone()),
            Transform::Pick { paths } => {
                let mut payload = Value::Object(Map::new());
                for path in paths {
                    if let Some(value) = lookup(doc, path) {
                        // Values picked from inside the payload keep their
                        // position; anything else lands under its full path.
                        let dest = path.strip_prefix("payload.").unwrap_or(path);
                        set_path(&mut payload, dest, value.clone());
                    }
                }
                let mut out = (**msg).clone();
                out.payload = payload;
                Ok(Arc::new(out))
            }
            Transform::Map { path, func: name } => {
                let func = func.ok_or_else(|| BusError::TransformFunctionNotFound {
                    name: name.clone(),
                })?;
                let current = lookup(doc, path).ok_or_else(|| BusError::HandlerThrew {
                    detail: format!("map transform: path `{path}` not found"),
                })?;
                let mapped = func(current).map_err(|e| BusError::HandlerThrew {
                    detail: format!("transform function `{name}` failed: {e}"),
                })?;
                let mut new_doc = doc.clone();
                set_path(&mut new_doc, path, mapped);
                rebuild(new_doc)
            }
            Transform::Custom { func: name } => {
                let func = func.ok_or_else(|| BusError::TransformFunctionNotFound {
                    name: name.clone(),
                })?;
                let new_doc = func(doc).map_err(|e| BusError::HandlerThrew {
                    detail: format!("transform function `{name}` failed: {e}"),
                })?;
                rebuild(new_doc)
            }
        }
    }
}

/// Deserialize a transformed document back into a message. A function that
/// breaks the message shape is a reported failure for that route.
fn rebuild(doc: Value) -> Result<Arc<Message>, BusError> {
    serde_json::from_value::<Message>(doc)
        .map(Arc::new)
        .map_err(|e| BusError::HandlerThrew {
            detail: format!("transform produced an invalid message: {e}"),
        })
}

/// Write `value` at a dotted `path`, creating intermediate objects as
/// needed and overwriting non-objects in the way.
fn set_path(root: &mut Value, path: &str, value: Value) {
    let Some((parents, leaf)) = split_leaf(path) else {
        return;
    };

    let mut current = root;
    for seg in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just coerced to object")
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current
        .as_object_mut()
        .expect("just coerced to object")
        .insert(leaf.to_string(), value);
}

fn split_leaf(path: &str) -> Option<(Vec<&str>, &str)> {
    let mut segs: Vec<&str> = path.split('.').collect();
    let leaf = segs.pop()?;
    if leaf.is_empty() {
        return None;
    }
    Some((segs, leaf))
}
