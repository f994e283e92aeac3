//! Bus engine
//!
//! This module contains the in-memory bus implementation responsible for:
//! - managing subscriptions and pattern matching
//! - validating, rate limiting and delivering published messages
//! - the retained message store and its LRU eviction
//! - the error stream and delivery/drop statistics
//! - periodic maintenance (dead subscription and stale ledger sweeps)
//!
//! Concurrency and usage notes:
//! - All shared state sits behind one `Mutex`. The lock is held only for
//!   bookkeeping: matching subscriptions are snapshotted under the lock and
//!   handlers are invoked after it is released. A handler may therefore call
//!   back into `publish` (the routing engine does exactly that) without
//!   deadlocking, and a slow subscriber cannot stall table mutation.
//! - Delivery is synchronous on the publishing thread, in registration
//!   order. A subscription removed mid-dispatch still receives the in-flight
//!   message; removal takes effect for subsequent publishes.
//! - `publish` never returns an error to the producer. Invalid and
//!   rate-limited messages are dropped, counted, and reported on the error
//!   stream.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BusSettings;
use crate::utils::error::{BusError, ErrorEvent};

use super::message::{Message, PublishOptions};
use super::pattern::TopicPattern;
use super::ratelimit::RateLimitLedger;
use super::retained::{RetainedStore, StoreOutcome};

/// Maximum topic length accepted by validation.
pub const MAX_TOPIC_LEN: usize = 256;

/// Client id charged for publishes that do not name a producer.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Result returned by subscriber handlers. An `Err` is reported on the
/// error stream as `HANDLER_THREW`; it never aborts delivery to the
/// remaining subscribers.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A subscriber callback. Invoked synchronously on the publishing thread;
/// handlers doing async work must spawn it themselves and return.
pub type Handler = Arc<dyn Fn(&Arc<Message>) -> HandlerResult + Send + Sync>;

/// A listener on the bus error stream.
pub type ErrorListener = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

/// Options for `Bus::subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Deliver matching retained messages to the new handler synchronously,
    /// before `subscribe` returns.
    pub retained: bool,
    /// Owning client; subscriptions of a disposed client are removed by the
    /// maintenance sweep.
    pub client_id: Option<String>,
}

struct SubscriptionEntry {
    id: u64,
    pattern: TopicPattern,
    handler: Handler,
    client_id: Option<String>,
}

struct BusInner {
    subscriptions: Vec<SubscriptionEntry>,
    retained: RetainedStore,
    ledger: RateLimitLedger,
    error_listeners: Vec<(u64, ErrorListener)>,
    disposed_clients: HashSet<String>,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    retained_evicted: AtomicU64,
    subscriptions_cleaned_up: AtomicU64,
    ledger_entries_swept: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub retained_evicted: u64,
    pub subscriptions_cleaned_up: u64,
    pub ledger_entries_swept: u64,
    pub errors: u64,
    pub subscription_count: usize,
    pub retained_count: usize,
}

/// The in-process message bus.
///
/// Constructed explicitly and shared by `Arc`; there is no global instance.
/// Lifecycle: `Bus::new` → `spawn_maintenance` → `shutdown`.
pub struct Bus {
    settings: BusSettings,
    inner: Mutex<BusInner>,
    counters: BusCounters,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl Bus {
    pub fn new(settings: BusSettings) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                subscriptions: Vec::new(),
                retained: RetainedStore::new(settings.max_retained),
                ledger: RateLimitLedger::new(),
                error_listeners: Vec::new(),
                disposed_clients: HashSet::new(),
            }),
            settings,
            counters: BusCounters::default(),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    // ---------------------------------------------------------------- publish

    /// Publish `payload` on `topic`. Fire-and-forget: validation failures and
    /// rate-limit drops surface on the error stream, never here.
    pub fn publish(&self, topic: &str, payload: Value, options: PublishOptions) {
        let mut msg = Message::new(topic, payload);
        msg.retain = options.retain;
        msg.headers = options.headers;
        msg.reply_topic = options.reply_topic;
        msg.correlation_id = options.correlation_id;

        let client_id = options.client_id.as_deref().unwrap_or(ANONYMOUS_CLIENT);
        self.publish_message(msg, client_id);
    }

    /// Full-message form of `publish`, charging the rate limit to
    /// `client_id`. Used internally and by the routing engine.
    pub fn publish_message(&self, mut msg: Message, client_id: &str) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.validate(&msg) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            self.report(&err);
            return;
        }

        let now = chrono::Utc::now().timestamp_millis();

        // Stamp bus-owned fields; producer-supplied values are kept as-is.
        if msg.id.is_empty() {
            msg.id = Uuid::new_v4().to_string();
        }
        if msg.created_at == 0 {
            msg.created_at = now;
        }

        let msg = Arc::new(msg);

        // Bookkeeping under the lock, delivery after it is released.
        let targets: Vec<Handler> = {
            let mut inner = self.inner.lock().expect("bus state lock poisoned");

            if !inner
                .ledger
                .allow(client_id, now, self.settings.rate_limit_per_second)
            {
                drop(inner);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.report(&BusError::RateLimitExceeded {
                    client_id: client_id.to_string(),
                });
                return;
            }

            if msg.retain {
                match inner.retained.store(msg.clone()) {
                    StoreOutcome::Evicted(topic) => {
                        self.counters.retained_evicted.fetch_add(1, Ordering::Relaxed);
                        debug!(topic, "retained message evicted");
                    }
                    StoreOutcome::Stored | StoreOutcome::Cleared => {}
                }
            }

            inner
                .subscriptions
                .iter()
                .filter(|sub| sub.pattern.matches(&msg.topic))
                .map(|sub| sub.handler.clone())
                .collect()
        };

        self.counters.published.fetch_add(1, Ordering::Relaxed);

        for handler in targets {
            self.deliver(&handler, &msg);
        }
    }

    /// Invoke one handler, catching both `Err` returns and panics so a
    /// faulty subscriber cannot abort delivery to the rest.
    fn deliver(&self, handler: &Handler, msg: &Arc<Message>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(msg)));
        match outcome {
            Ok(Ok(())) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                self.report(&BusError::HandlerThrew {
                    detail: err.to_string(),
                });
            }
            Err(_) => {
                self.report(&BusError::HandlerThrew {
                    detail: format!("handler panicked during delivery on `{}`", msg.topic),
                });
            }
        }
    }

    fn validate(&self, msg: &Message) -> Result<(), BusError> {
        let invalid = |reason: String| BusError::MessageInvalid { reason };

        if msg.topic.is_empty() {
            return Err(invalid("topic is empty".into()));
        }
        if msg.topic.len() > MAX_TOPIC_LEN {
            return Err(invalid(format!(
                "topic exceeds {MAX_TOPIC_LEN} characters"
            )));
        }

        // `Value` payloads always serialize; the size limits are the real
        // constraint being enforced here.
        let payload_len = serde_json::to_string(&msg.payload)
            .map_err(|e| invalid(format!("payload not serializable: {e}")))?
            .len();
        if payload_len > self.settings.max_payload_size_bytes {
            return Err(invalid(format!(
                "payload size {payload_len} exceeds limit {}",
                self.settings.max_payload_size_bytes
            )));
        }

        let total_len = serde_json::to_string(msg)
            .map_err(|e| invalid(format!("message not serializable: {e}")))?
            .len();
        if total_len > self.settings.max_message_size_bytes {
            return Err(invalid(format!(
                "message size {total_len} exceeds limit {}",
                self.settings.max_message_size_bytes
            )));
        }

        Ok(())
    }

    // -------------------------------------------------------------- subscribe

    /// Subscribe `handler` to one or more patterns. Returns an
    /// [`Unsubscriber`] handle; dropping the handle does NOT unsubscribe,
    /// releasing is always explicit. Rejects malformed patterns, and the
    /// global wildcard unless `allow_global_wildcard` is configured.
    pub fn subscribe<F>(
        self: &Arc<Self>,
        patterns: &[&str],
        handler: F,
        options: SubscribeOptions,
    ) -> Result<Unsubscriber, BusError>
    where
        F: Fn(&Arc<Message>) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_arc(patterns, Arc::new(handler), options, false)
    }

    /// Internal subscribe that bypasses the global-wildcard gate. Used by
    /// the routing engine and the request/reply helper.
    pub(crate) fn subscribe_internal(
        self: &Arc<Self>,
        patterns: &[&str],
        handler: Handler,
        options: SubscribeOptions,
    ) -> Result<Unsubscriber, BusError> {
        self.subscribe_arc(patterns, handler, options, true)
    }

    fn subscribe_arc(
        self: &Arc<Self>,
        patterns: &[&str],
        handler: Handler,
        options: SubscribeOptions,
        privileged: bool,
    ) -> Result<Unsubscriber, BusError> {
        if patterns.is_empty() {
            return Err(BusError::PatternInvalid {
                pattern: String::new(),
                reason: "no patterns given".to_string(),
            });
        }

        // Parse everything first so a bad pattern leaves no partial state.
        let mut parsed = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let pattern = TopicPattern::parse(raw)?;
            if pattern.is_global() && !privileged && !self.settings.allow_global_wildcard {
                return Err(BusError::PatternInvalid {
                    pattern: (*raw).to_string(),
                    reason: "global wildcard subscriptions are disabled".to_string(),
                });
            }
            parsed.push(pattern);
        }

        let mut ids = Vec::with_capacity(parsed.len());
        let mut replay: Vec<Arc<Message>> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("bus state lock poisoned");
            for pattern in parsed {
                if options.retained {
                    replay.extend(inner.retained.resolve(&pattern));
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                ids.push(id);
                inner.subscriptions.push(SubscriptionEntry {
                    id,
                    pattern,
                    handler: handler.clone(),
                    client_id: options.client_id.clone(),
                });
            }
        }

        // Retained replay happens synchronously, before subscribe returns,
        // and outside the lock like any other delivery.
        for msg in replay {
            self.deliver(&handler, &msg);
        }

        Ok(Unsubscriber::new(Arc::downgrade(self), ids))
    }

    /// Remove the subscriptions with the given ids. Missing ids are ignored,
    /// which is what makes `Unsubscriber` safe to invoke twice.
    pub(crate) fn remove_subscriptions(&self, ids: &[u64]) {
        let mut inner = self.inner.lock().expect("bus state lock poisoned");
        inner.subscriptions.retain(|sub| !ids.contains(&sub.id));
    }

    // --------------------------------------------------------- request/reply

    /// Publish a request and await the correlated reply payload.
    ///
    /// Builds a one-shot subscription on a generated reply topic, publishes
    /// with `reply_topic`/`correlation_id` set, and resolves with the first
    /// reply. Errors with [`BusError::RequestTimeout`] when no reply arrives
    /// within `timeout`; this is the only error a bus caller ever sees.
    pub async fn request(
        self: &Arc<Self>,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let reply_topic = format!("$reply.{}", Uuid::new_v4());
        let correlation_id = Uuid::new_v4().to_string();

        let (tx, rx) = oneshot::channel::<Value>();
        let slot = Mutex::new(Some(tx));
        let unsub = self.subscribe_internal(
            &[reply_topic.as_str()],
            Arc::new(move |msg: &Arc<Message>| {
                if let Some(tx) = slot.lock().expect("reply slot lock poisoned").take() {
                    let _ = tx.send(msg.payload.clone());
                }
                Ok(())
            }),
            SubscribeOptions::default(),
        )?;

        self.publish(
            topic,
            payload,
            PublishOptions {
                reply_topic: Some(reply_topic),
                correlation_id: Some(correlation_id),
                ..PublishOptions::default()
            },
        );

        let result = tokio::time::timeout(timeout, rx).await;
        unsub.unsubscribe();

        match result {
            Ok(Ok(value)) => Ok(value),
            _ => Err(BusError::RequestTimeout {
                topic: topic.to_string(),
            }),
        }
    }

    /// Publish `payload` to the reply topic of `request`, carrying its
    /// correlation id. No-op when the request did not ask for a reply.
    pub fn respond(&self, request: &Message, payload: Value) {
        let Some(reply_topic) = request.reply_topic.as_deref() else {
            return;
        };
        self.publish(
            reply_topic,
            payload,
            PublishOptions {
                correlation_id: request.correlation_id.clone(),
                ..PublishOptions::default()
            },
        );
    }

    // ----------------------------------------------------------- error stream

    /// Register a listener on the error stream. Listener panics are
    /// swallowed; the error channel must never feed back into itself.
    pub fn on_error<F>(self: &Arc<Self>, listener: F) -> ErrorListenerGuard
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock().expect("bus state lock poisoned");
            inner.error_listeners.push((id, Arc::new(listener)));
        }
        ErrorListenerGuard::new(Arc::downgrade(self), id)
    }

    pub(crate) fn remove_error_listener(&self, id: u64) {
        let mut inner = self.inner.lock().expect("bus state lock poisoned");
        inner.error_listeners.retain(|(lid, _)| *lid != id);
    }

    /// Push an error onto the error stream and count it. Listeners run
    /// outside the lock.
    pub(crate) fn report(&self, err: &BusError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!(code = err.code(), "{err}");

        let event = ErrorEvent::from(err);
        let listeners: Vec<ErrorListener> = {
            let inner = self.inner.lock().expect("bus state lock poisoned");
            inner.error_listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            let _ = catch_unwind(AssertUnwindSafe(|| listener(&event)));
        }
    }

    // ------------------------------------------------------------ maintenance

    /// Mark every subscription owned by `client_id` as dead; the next sweep
    /// removes them.
    pub fn mark_client_disposed(&self, client_id: &str) {
        let mut inner = self.inner.lock().expect("bus state lock poisoned");
        inner.disposed_clients.insert(client_id.to_string());
    }

    /// One maintenance pass: removes subscriptions of disposed clients and
    /// rate-limit windows that ended more than a window ago. Normally run by
    /// the task from [`spawn_maintenance`]; callable directly in tests.
    pub fn sweep(&self) {
        self.sweep_at(chrono::Utc::now().timestamp_millis());
    }

    pub(crate) fn sweep_at(&self, now: i64) {
        let mut inner = self.inner.lock().expect("bus state lock poisoned");

        let before = inner.subscriptions.len();
        let disposed = std::mem::take(&mut inner.disposed_clients);
        inner.subscriptions.retain(|sub| {
            sub.client_id
                .as_ref()
                .is_none_or(|owner| !disposed.contains(owner))
        });
        let removed = before - inner.subscriptions.len();

        let swept = inner.ledger.sweep(now);
        drop(inner);

        if removed > 0 {
            self.counters
                .subscriptions_cleaned_up
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "swept dead subscriptions");
        }
        if swept > 0 {
            self.counters
                .ledger_entries_swept
                .fetch_add(swept as u64, Ordering::Relaxed);
            debug!(swept, "swept stale rate-limit windows");
        }
    }

    /// Release all subscriptions, retained messages and error listeners and
    /// stop accepting publishes. The maintenance task, if running, exits on
    /// its next tick.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().expect("bus state lock poisoned");
        inner.subscriptions.clear();
        inner.retained.clear();
        inner.error_listeners.clear();
        inner.disposed_clients.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------ stats

    pub fn stats(&self) -> BusStats {
        let inner = self.inner.lock().expect("bus state lock poisoned");
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            retained_evicted: self.counters.retained_evicted.load(Ordering::Relaxed),
            subscriptions_cleaned_up: self
                .counters
                .subscriptions_cleaned_up
                .load(Ordering::Relaxed),
            ledger_entries_swept: self.counters.ledger_entries_swept.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            subscription_count: inner.subscriptions.len(),
            retained_count: inner.retained.len(),
        }
    }
}

/// Spawn the timer-driven maintenance task for `bus`. The task holds only a
/// weak reference, so it never keeps a dropped bus alive, and it exits once
/// the bus shuts down.
pub fn spawn_maintenance(bus: &Arc<Bus>) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(bus);
    let period = Duration::from_millis(bus.settings.cleanup_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of `interval` fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(bus) = weak.upgrade() else { break };
            if bus.is_shut_down() {
                break;
            }
            bus.sweep();
        }
    })
}

/// Handle for releasing a subscription. Calling [`unsubscribe`] twice is a
/// no-op; the handle holds only a weak bus reference and the subscription
/// ids, never the handler itself.
///
/// [`unsubscribe`]: Unsubscriber::unsubscribe
#[derive(Debug)]
pub struct Unsubscriber {
    bus: Weak<Bus>,
    ids: Vec<u64>,
    done: AtomicBool,
}

impl Unsubscriber {
    fn new(bus: Weak<Bus>, ids: Vec<u64>) -> Self {
        Self {
            bus,
            ids,
            done: AtomicBool::new(false),
        }
    }

    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_subscriptions(&self.ids);
        }
    }
}

/// Handle for detaching an error-stream listener. Same idempotence contract
/// as [`Unsubscriber`].
#[derive(Debug)]
pub struct ErrorListenerGuard {
    bus: Weak<Bus>,
    id: u64,
    done: AtomicBool,
}

impl ErrorListenerGuard {
    fn new(bus: Weak<Bus>, id: u64) -> Self {
        Self {
            bus,
            id,
            done: AtomicBool::new(false),
        }
    }

    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_error_listener(self.id);
        }
    }
}
