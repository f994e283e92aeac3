//! switchyard routing engine
//!
//! Declarative match → transform → action rules evaluated against every
//! message the bus delivers. The engine is an ordinary (privileged)
//! subscriber on the global wildcard; its actions publish back into the bus.
//!
//! Public types:
//! - `RoutingEngine`: route CRUD, function registries, evaluation, stats.
//! - `Route` / `RouteMatch` / `Condition`: declarative rule definitions,
//!   serde-friendly for loading from configuration.
//! - `Transform` / `Action`: what a matched route does.

pub mod action;
pub mod condition;
pub mod engine;
pub mod route;
pub mod transform;

pub use action::{Action, ActionHandlerFn};
pub use condition::Condition;
pub use engine::{ROUTING_CLIENT, RouteStats, RoutingEngine};
pub use route::{OneOrMany, Route, RouteFilter, RouteMatch, RoutePatch};
pub use transform::{Transform, TransformFn};
