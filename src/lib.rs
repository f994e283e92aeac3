//! # Switchyard
//!
//! `switchyard` is an in-process publish/subscribe message bus with a
//! declarative routing engine layered on top. It is designed to be embedded
//! inside a larger host application as its real-time messaging backbone:
//! producers publish onto dot-delimited topics, subscribers match them with
//! wildcard patterns, and routing rules match, transform, and re-emit
//! messages without any of the collaborators knowing about each other.
//!
//! The bus is a single-process, in-memory broker: no persistence, no
//! cross-network delivery. Network adapters, UI layers and other outer
//! surfaces are expected to sit on top of `publish`/`subscribe`.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `bus`: the core engine. Subscriptions, wildcard matching, retained
//!   messages, rate limiting, validation, delivery, and statistics.
//! - `routing`: the rule engine. Route CRUD, predicate trees, transforms,
//!   and actions, attached to the bus as a privileged subscriber.
//! - `config`: loading and merging bus configuration.
//! - `utils`: shared utilities, the error taxonomy and tracing setup.
//!
//! ## Quick start
//!
//! ```
//! use switchyard::bus::{Bus, PublishOptions, SubscribeOptions};
//! use switchyard::config::BusSettings;
//!
//! let bus = Bus::new(BusSettings::default());
//! let sub = bus
//!     .subscribe(
//!         &["orders.*"],
//!         |msg| {
//!             println!("order event on {}", msg.topic);
//!             Ok(())
//!         },
//!         SubscribeOptions::default(),
//!     )
//!     .expect("valid pattern");
//!
//! bus.publish(
//!     "orders.created",
//!     serde_json::json!({ "id": 42 }),
//!     PublishOptions::default(),
//! );
//! sub.unsubscribe();
//! ```

pub mod bus;
pub mod config;
pub mod routing;
pub mod utils;

pub use bus::{Bus, BusStats, Message, PublishOptions, SubscribeOptions, spawn_maintenance};
pub use config::{BusSettings, Settings, load_config};
pub use routing::{Route, RouteStats, RoutingEngine};
pub use utils::error::{BusError, ErrorEvent};
