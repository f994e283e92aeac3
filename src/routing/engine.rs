//! Routing engine
//!
//! Sits above the bus core as a single privileged global-wildcard
//! subscriber. For every delivered message it evaluates the enabled routes
//! in ascending `order` and, for matches, applies the route's transform and
//! executes its actions, which may publish right back into the bus within
//! the same dispatch pass.
//!
//! Concurrency and usage notes:
//! - The route table and the function registries sit behind one `Mutex`.
//!   Evaluation snapshots the enabled routes under the lock and runs with
//!   the lock released, so CRUD during a pass is safe and only visible to
//!   the next pass.
//! - EMIT/FORWARD re-enter `Bus::publish` synchronously. A per-thread depth
//!   counter caps the resulting recursion so a route emitting a message
//!   that matches itself is a reported error instead of a stack overflow.
//! - Action and transform failures are counted, reported on the bus error
//!   stream, and never stop the remaining routes.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::bus::{Bus, Message, SubscribeOptions, Unsubscriber};
use crate::utils::error::BusError;

use super::action::{Action, ActionHandlerFn, render_template};
use super::route::{CompiledMatch, Route, RouteFilter, RoutePatch};
use super::transform::TransformFn;

/// Client id the routing engine publishes under.
pub const ROUTING_CLIENT: &str = "routing-engine";

/// Ceiling on synchronous publish → evaluate → publish recursion.
const MAX_EVAL_DEPTH: u32 = 8;

thread_local! {
    static EVAL_DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct StoredRoute {
    route: Route,
    matcher: CompiledMatch,
    /// Insertion sequence; tie-breaker for equal `order`.
    seq: u64,
}

struct RoutingInner {
    /// Kept sorted by `(order, seq)` at mutation time so evaluation only
    /// snapshots.
    routes: Vec<Arc<StoredRoute>>,
    next_seq: u64,
    transforms: HashMap<String, TransformFn>,
    handlers: HashMap<String, ActionHandlerFn>,
}

#[derive(Debug, Default)]
struct RouteCounters {
    routes_evaluated: AtomicU64,
    routes_matched: AtomicU64,
    actions_executed: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time routing statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteStats {
    pub routes_evaluated: u64,
    pub routes_matched: u64,
    pub actions_executed: u64,
    pub errors: u64,
    pub route_count: usize,
    pub enabled_route_count: usize,
}

/// The declarative message-routing engine.
///
/// Created with [`RoutingEngine::attach`]; holds only a weak reference to
/// the bus (the bus holds the engine alive through its subscription).
pub struct RoutingEngine {
    bus: Weak<Bus>,
    inner: Mutex<RoutingInner>,
    counters: RouteCounters,
    subscription: Mutex<Option<Unsubscriber>>,
}

impl RoutingEngine {
    /// Attach a routing engine to `bus` through an internal global-wildcard
    /// subscription (bypassing the `allow_global_wildcard` gate).
    pub fn attach(bus: &Arc<Bus>) -> Result<Arc<Self>, BusError> {
        let engine = Arc::new(Self {
            bus: Arc::downgrade(bus),
            inner: Mutex::new(RoutingInner {
                routes: Vec::new(),
                next_seq: 0,
                transforms: HashMap::new(),
                handlers: HashMap::new(),
            }),
            counters: RouteCounters::default(),
            subscription: Mutex::new(None),
        });

        let hook = engine.clone();
        let unsub = bus.subscribe_internal(
            &["**"],
            Arc::new(move |msg: &Arc<Message>| {
                hook.evaluate(msg);
                Ok(())
            }),
            SubscribeOptions {
                client_id: Some(ROUTING_CLIENT.to_string()),
                ..SubscribeOptions::default()
            },
        )?;
        *engine
            .subscription
            .lock()
            .expect("routing subscription lock poisoned") = Some(unsub);

        info!("routing engine attached");
        Ok(engine)
    }

    /// [`attach`](Self::attach), gated on the `routing_enabled` setting.
    /// Returns `None` when the bus is configured without routing.
    pub fn attach_if_enabled(bus: &Arc<Bus>) -> Result<Option<Arc<Self>>, BusError> {
        if !bus.settings().routing_enabled {
            return Ok(None);
        }
        Self::attach(bus).map(Some)
    }

    /// Detach from the bus. Routes stay in the table but no further
    /// messages are evaluated.
    pub fn detach(&self) {
        let guard = self
            .subscription
            .lock()
            .expect("routing subscription lock poisoned");
        if let Some(unsub) = guard.as_ref() {
            unsub.unsubscribe();
        }
    }

    // ------------------------------------------------------------------- CRUD

    /// Compile and store a route. Generates an id when absent; returns the
    /// stored route. Compile failures (bad regex, bad topic pattern) are
    /// returned, not reported: the caller is mutating configuration and
    /// can handle errors normally.
    pub fn add_route(&self, mut route: Route) -> Result<Route, BusError> {
        let matcher = CompiledMatch::compile(&route.match_)?;
        if route.id.is_empty() {
            route.id = Uuid::new_v4().to_string();
        }

        let mut inner = self.inner.lock().expect("route table lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.routes.push(Arc::new(StoredRoute {
            route: route.clone(),
            matcher,
            seq,
        }));
        Self::resort(&mut inner.routes);
        debug!(id = %route.id, name = %route.name, "route added");
        Ok(route)
    }

    /// Apply a partial update to a route, recompiling its match block.
    pub fn update_route(&self, id: &str, patch: RoutePatch) -> Result<Route, BusError> {
        let mut inner = self.inner.lock().expect("route table lock poisoned");
        let slot = inner
            .routes
            .iter()
            .position(|s| s.route.id == id)
            .ok_or_else(|| BusError::RouteNotFound { id: id.to_string() })?;

        let mut route = inner.routes[slot].route.clone();
        if let Some(name) = patch.name {
            route.name = name;
        }
        if let Some(enabled) = patch.enabled {
            route.enabled = enabled;
        }
        if let Some(order) = patch.order {
            route.order = order;
        }
        if let Some(match_) = patch.match_ {
            route.match_ = match_;
        }
        if let Some(transform) = patch.transform {
            route.transform = Some(transform);
        }
        if let Some(actions) = patch.actions {
            route.actions = actions;
        }

        // Recompile before touching the table; a bad patch leaves the
        // stored route untouched.
        let matcher = CompiledMatch::compile(&route.match_)?;
        let seq = inner.routes[slot].seq;
        inner.routes[slot] = Arc::new(StoredRoute {
            route: route.clone(),
            matcher,
            seq,
        });
        Self::resort(&mut inner.routes);
        Ok(route)
    }

    pub fn remove_route(&self, id: &str) -> Result<(), BusError> {
        let mut inner = self.inner.lock().expect("route table lock poisoned");
        let before = inner.routes.len();
        inner.routes.retain(|s| s.route.id != id);
        if inner.routes.len() == before {
            return Err(BusError::RouteNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn enable_route(&self, id: &str) -> Result<(), BusError> {
        self.set_enabled(id, true)
    }

    pub fn disable_route(&self, id: &str) -> Result<(), BusError> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), BusError> {
        let mut inner = self.inner.lock().expect("route table lock poisoned");
        let slot = inner
            .routes
            .iter()
            .position(|s| s.route.id == id)
            .ok_or_else(|| BusError::RouteNotFound { id: id.to_string() })?;
        let mut route = inner.routes[slot].route.clone();
        let matcher = inner.routes[slot].matcher.clone();
        let seq = inner.routes[slot].seq;
        route.enabled = enabled;
        inner.routes[slot] = Arc::new(StoredRoute { route, matcher, seq });
        Ok(())
    }

    /// Routes matching `filter`, in evaluation order.
    pub fn list_routes(&self, filter: &RouteFilter) -> Vec<Route> {
        let inner = self.inner.lock().expect("route table lock poisoned");
        inner
            .routes
            .iter()
            .filter(|s| filter.accepts(&s.route))
            .map(|s| s.route.clone())
            .collect()
    }

    pub fn clear_routes(&self) {
        let mut inner = self.inner.lock().expect("route table lock poisoned");
        inner.routes.clear();
    }

    // -------------------------------------------------------------- registries

    /// Register a named transform function for `map`/`custom` transforms.
    /// Re-registering a name replaces the previous function.
    pub fn register_transform_fn<F>(&self, name: &str, func: F)
    where
        F: Fn(&Value) -> Result<Value, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        let mut inner = self.inner.lock().expect("route table lock poisoned");
        inner.transforms.insert(name.to_string(), Arc::new(func));
    }

    /// Register a named CALL handler. Re-registering a name replaces the
    /// previous handler.
    pub fn register_action_handler(&self, name: &str, handler: ActionHandlerFn) {
        let mut inner = self.inner.lock().expect("route table lock poisoned");
        inner.handlers.insert(name.to_string(), handler);
    }

    fn lookup_transform(&self, name: &str) -> Option<TransformFn> {
        let inner = self.inner.lock().expect("route table lock poisoned");
        inner.transforms.get(name).cloned()
    }

    fn lookup_handler(&self, name: &str) -> Option<ActionHandlerFn> {
        let inner = self.inner.lock().expect("route table lock poisoned");
        inner.handlers.get(name).cloned()
    }

    // -------------------------------------------------------------- evaluation

    /// Evaluate every enabled route against one delivered message. Runs on
    /// the publishing thread, inside the bus dispatch loop.
    pub fn evaluate(&self, msg: &Arc<Message>) {
        let depth = EVAL_DEPTH.get();
        if depth >= MAX_EVAL_DEPTH {
            self.report(&BusError::HandlerThrew {
                detail: format!(
                    "routing recursion limit ({MAX_EVAL_DEPTH}) reached on `{}`",
                    msg.topic
                ),
            });
            return;
        }
        EVAL_DEPTH.set(depth + 1);
        let _guard = DepthGuard;

        let snapshot: Vec<Arc<StoredRoute>> = {
            let inner = self.inner.lock().expect("route table lock poisoned");
            inner
                .routes
                .iter()
                .filter(|s| s.route.enabled)
                .cloned()
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }

        let doc = match serde_json::to_value(&**msg) {
            Ok(doc) => doc,
            Err(e) => {
                self.report(&BusError::HandlerThrew {
                    detail: format!("failed to serialize message for routing: {e}"),
                });
                return;
            }
        };

        for stored in snapshot {
            self.counters.routes_evaluated.fetch_add(1, Ordering::Relaxed);
            if !stored.matcher.matches(msg, &doc) {
                continue;
            }
            self.counters.routes_matched.fetch_add(1, Ordering::Relaxed);
            trace!(route = %stored.route.name, topic = %msg.topic, "route matched");

            let (transformed, tdoc) = match self.apply_transform(&stored.route, msg, &doc) {
                Ok(pair) => pair,
                Err(err) => {
                    self.report(&err);
                    continue;
                }
            };

            for action in &stored.route.actions {
                match self.execute_action(action, &transformed, &tdoc) {
                    Ok(()) => {
                        self.counters.actions_executed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => self.report(&err),
                }
            }
        }
    }

    /// Apply the route's transform, returning the (possibly new) message and
    /// its serialized form.
    fn apply_transform(
        &self,
        route: &Route,
        msg: &Arc<Message>,
        doc: &Value,
    ) -> Result<(Arc<Message>, Value), BusError> {
        let Some(transform) = &route.transform else {
            return Ok((msg.clone(), doc.clone()));
        };

        let func = match transform.func_name() {
            Some(name) => match self.lookup_transform(name) {
                Some(func) => Some(func),
                None => {
                    return Err(BusError::TransformFunctionNotFound {
                        name: name.to_string(),
                    });
                }
            },
            None => None,
        };

        let transformed = transform.apply(msg, doc, func.as_ref())?;
        let tdoc = if Arc::ptr_eq(&transformed, msg) {
            doc.clone()
        } else {
            serde_json::to_value(&*transformed).map_err(|e| BusError::HandlerThrew {
                detail: format!("failed to serialize transformed message: {e}"),
            })?
        };
        Ok((transformed, tdoc))
    }

    fn execute_action(
        &self,
        action: &Action,
        msg: &Arc<Message>,
        doc: &Value,
    ) -> Result<(), BusError> {
        match action {
            Action::Emit {
                topic,
                payload,
                inherit,
            } => {
                let bus = self.bus()?;
                bus.publish_message(Action::emit_message(topic, payload, inherit, msg), ROUTING_CLIENT);
                Ok(())
            }
            Action::Forward { topic } => {
                let bus = self.bus()?;
                bus.publish_message(Action::forward_message(topic, msg), ROUTING_CLIENT);
                Ok(())
            }
            Action::Log { template, level } => {
                let line = render_template(template, doc);
                match level.as_deref().unwrap_or("info") {
                    "error" => error!(target: "switchyard::route", "{line}"),
                    "warn" | "warning" => warn!(target: "switchyard::route", "{line}"),
                    "debug" => debug!(target: "switchyard::route", "{line}"),
                    "trace" => trace!(target: "switchyard::route", "{line}"),
                    _ => info!(target: "switchyard::route", "{line}"),
                }
                Ok(())
            }
            Action::Call { handler } => {
                let func = self
                    .lookup_handler(handler)
                    .ok_or_else(|| BusError::ActionHandlerNotFound {
                        name: handler.clone(),
                    })?;
                self.spawn_call(handler, func, msg.clone())
            }
        }
    }

    /// Launch a CALL handler and move on. Completion is never awaited by the
    /// routing pass; failures after detachment go to the error stream.
    fn spawn_call(
        &self,
        name: &str,
        func: ActionHandlerFn,
        msg: Arc<Message>,
    ) -> Result<(), BusError> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Err(BusError::HandlerThrew {
                detail: format!("CALL action `{name}` requires a tokio runtime"),
            });
        };

        let bus = self.bus.clone();
        let name = name.to_string();
        runtime.spawn(async move {
            if let Err(e) = func(msg).await
                && let Some(bus) = bus.upgrade()
            {
                bus.report(&BusError::HandlerThrew {
                    detail: format!("action handler `{name}` failed: {e}"),
                });
            }
        });
        Ok(())
    }

    fn bus(&self) -> Result<Arc<Bus>, BusError> {
        self.bus.upgrade().ok_or_else(|| BusError::HandlerThrew {
            detail: "bus was dropped while routing".to_string(),
        })
    }

    /// Count a routing error and forward it to the bus error stream.
    fn report(&self, err: &BusError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        if let Some(bus) = self.bus.upgrade() {
            bus.report(err);
        } else {
            warn!(code = err.code(), "{err}");
        }
    }

    fn resort(routes: &mut [Arc<StoredRoute>]) {
        routes.sort_by_key(|s| (s.route.order, s.seq));
    }

    // ------------------------------------------------------------------ stats

    pub fn stats(&self) -> RouteStats {
        let inner = self.inner.lock().expect("route table lock poisoned");
        RouteStats {
            routes_evaluated: self.counters.routes_evaluated.load(Ordering::Relaxed),
            routes_matched: self.counters.routes_matched.load(Ordering::Relaxed),
            actions_executed: self.counters.actions_executed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            route_count: inner.routes.len(),
            enabled_route_count: inner.routes.iter().filter(|s| s.route.enabled).count(),
        }
    }
}

struct DepthGuard;

impl Drop for DepthGuard {
    fn drop(&mut self) {
        EVAL_DEPTH.set(EVAL_DEPTH.get().saturating_sub(1));
    }
}
