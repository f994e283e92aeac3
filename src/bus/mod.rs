//! switchyard bus core
//!
//! The bus crate-half that owns subscriptions, the retained message store,
//! delivery, rate limiting, validation, and statistics. It has no
//! dependencies beyond a clock and an id generator; the routing engine sits
//! on top of it as an ordinary (privileged) subscriber.
//!
//! Public types:
//! - `Bus`: the engine. Publish, subscribe, request/reply, error stream,
//!   maintenance, stats.
//! - `Message` / `PublishOptions`: the unit of communication.
//! - `TopicPattern`: dot-delimited wildcard patterns (`*`, trailing `**`).

pub mod engine;
pub mod message;
pub mod pattern;
pub mod ratelimit;
pub mod retained;

pub use engine::{
    Bus, BusStats, ErrorListenerGuard, Handler, HandlerResult, SubscribeOptions, Unsubscriber,
    spawn_maintenance,
};
pub use message::{Message, PublishOptions};
pub use pattern::TopicPattern;

#[cfg(test)]
mod tests;
