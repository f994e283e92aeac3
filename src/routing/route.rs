//! Route definitions
//!
//! A `Route` is a declarative match → transform → actions rule. Routes are
//! serde-friendly so hosts can load them from configuration files or accept
//! them over an admin surface; the engine compiles the match block once at
//! add/update time (see [`CompiledMatch`]) so nothing is re-parsed per
//! message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{Message, TopicPattern};
use crate::utils::error::BusError;

use super::action::Action;
use super::condition::{CompiledCondition, Condition};
use super::transform::Transform;

/// One value or a set of values; a set means "any of".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(vs) => vs.clone(),
        }
    }
}

/// The match block of a route. Empty fields are unconstrained; a route with
/// an empty match block matches every message.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteMatch {
    /// Exact message-type match. A message's type is its topic.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<OneOrMany<String>>,
    /// Topic match with wildcard-pattern semantics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<OneOrMany<String>>,
    /// Match against the `source` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<OneOrMany<String>>,
    /// Message must carry at least one of these tags (`tags` header).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags_any: Option<Vec<String>>,
    /// Message must carry every one of these tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags_all: Option<Vec<String>>,
    /// General predicate tree over the serialized message.
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<Condition>,
}

/// A declarative routing rule. Routes are evaluated in ascending `order`
/// (ties broken by insertion sequence) against every delivered message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Generated at add time when empty.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub order: i32,
    #[serde(rename = "match", default)]
    pub match_: RouteMatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

impl Route {
    /// A minimal enabled route with the given name; callers fill in the
    /// match block and actions.
    pub fn named(name: &str) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            enabled: true,
            order: 0,
            match_: RouteMatch::default(),
            transform: None,
            actions: Vec::new(),
        }
    }
}

/// Partial update applied by `update_route`. `None` fields are left
/// untouched; `transform: Some(..)` replaces the transform.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutePatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub order: Option<i32>,
    #[serde(rename = "match")]
    pub match_: Option<RouteMatch>,
    pub transform: Option<Transform>,
    pub actions: Option<Vec<Action>>,
}

/// Filter for `list_routes`.
#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    pub enabled: Option<bool>,
    pub name_contains: Option<String>,
}

impl RouteFilter {
    pub fn accepts(&self, route: &Route) -> bool {
        if let Some(enabled) = self.enabled
            && route.enabled != enabled
        {
            return false;
        }
        if let Some(needle) = &self.name_contains
            && !route.name.contains(needle.as_str())
        {
            return false;
        }
        true
    }
}

/// The evaluation-ready form of a [`RouteMatch`]: topic patterns parsed,
/// the predicate tree compiled.
#[derive(Debug, Clone)]
pub struct CompiledMatch {
    types: Vec<String>,
    topics: Vec<TopicPattern>,
    sources: Vec<String>,
    tags_any: Vec<String>,
    tags_all: Vec<String>,
    where_: Option<CompiledCondition>,
}

impl CompiledMatch {
    pub fn compile(spec: &RouteMatch) -> Result<Self, BusError> {
        let topics = spec
            .topic
            .as_ref()
            .map(|t| {
                t.to_vec()
                    .iter()
                    .map(|p| TopicPattern::parse(p))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            types: spec.type_.as_ref().map(OneOrMany::to_vec).unwrap_or_default(),
            topics,
            sources: spec.source.as_ref().map(OneOrMany::to_vec).unwrap_or_default(),
            tags_any: spec.tags_any.clone().unwrap_or_default(),
            tags_all: spec.tags_all.clone().unwrap_or_default(),
            where_: spec
                .where_
                .as_ref()
                .map(CompiledCondition::compile)
                .transpose()?,
        })
    }

    /// Evaluate against a message and its serialized form. All present
    /// constraints must hold.
    pub fn matches(&self, msg: &Message, doc: &Value) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| *t == msg.topic) {
            return false;
        }
        if !self.topics.is_empty() && !self.topics.iter().any(|p| p.matches(&msg.topic)) {
            return false;
        }
        if !self.sources.is_empty() {
            let Some(source) = msg.header("source") else {
                return false;
            };
            if !self.sources.iter().any(|s| s == source) {
                return false;
            }
        }
        if !self.tags_any.is_empty() || !self.tags_all.is_empty() {
            let tags = msg.tags();
            if !self.tags_any.is_empty() && !self.tags_any.iter().any(|t| tags.contains(&t.as_str()))
            {
                return false;
            }
            if !self.tags_all.iter().all(|t| tags.contains(&t.as_str())) {
                return false;
            }
        }
        if let Some(cond) = &self.where_
            && !cond.evaluate(doc)
        {
            return false;
        }
        true
    }
}
