use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use super::engine::{Bus, SubscribeOptions};
use super::message::{Message, PublishOptions};
use super::pattern::TopicPattern;
use super::ratelimit::{RateLimitLedger, WINDOW_MS};
use super::retained::{RetainedStore, StoreOutcome};
use crate::config::BusSettings;

fn settings() -> BusSettings {
    BusSettings::default()
}

/// Helper: subscribe and collect received topics into a shared vector.
fn collecting_sub(
    bus: &Arc<Bus>,
    patterns: &[&str],
    options: SubscribeOptions,
) -> (Arc<Mutex<Vec<String>>>, super::engine::Unsubscriber) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let unsub = bus
        .subscribe(
            patterns,
            move |msg| {
                sink.lock().unwrap().push(msg.topic.clone());
                Ok(())
            },
            options,
        )
        .expect("valid patterns");
    (seen, unsub)
}

#[test]
fn test_pattern_single_wildcard() {
    let p = TopicPattern::parse("a.*.c").unwrap();
    assert!(p.matches("a.b.c"));
    assert!(!p.matches("a.b.b.c"));
    assert!(!p.matches("a.c"));
    assert!(!p.matches("a.b"));
}

#[test]
fn test_pattern_multi_wildcard() {
    let p = TopicPattern::parse("a.**").unwrap();
    assert!(p.matches("a"));
    assert!(p.matches("a.b"));
    assert!(p.matches("a.b.c"));
    assert!(!p.matches("b.a"));

    let global = TopicPattern::parse("**").unwrap();
    assert!(global.is_global());
    assert!(global.matches("anything.at.all"));
}

#[test]
fn test_pattern_invalid_forms_rejected() {
    assert!(TopicPattern::parse("").is_err());
    assert!(TopicPattern::parse("a..b").is_err());
    assert!(TopicPattern::parse("a.**.c").is_err());
    assert!(TopicPattern::parse("us*r").is_err());
    assert!(TopicPattern::parse("**.a").is_err());
}

#[test]
fn test_pattern_exact_topic() {
    assert_eq!(
        TopicPattern::parse("a.b.c").unwrap().exact_topic(),
        Some("a.b.c")
    );
    assert_eq!(TopicPattern::parse("a.*").unwrap().exact_topic(), None);
}

#[test]
fn test_publish_and_receive() {
    let bus = Bus::new(settings());
    let (seen, _unsub) = collecting_sub(&bus, &["orders.created"], SubscribeOptions::default());

    bus.publish("orders.created", json!({"id": 1}), PublishOptions::default());

    assert_eq!(seen.lock().unwrap().as_slice(), ["orders.created"]);
    let stats = bus.stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dropped, 0);
}

#[test]
fn test_message_id_and_timestamp_stamped() {
    let bus = Bus::new(settings());
    let captured = Arc::new(Mutex::new(Vec::<Message>::new()));
    let sink = captured.clone();
    let _unsub = bus
        .subscribe(
            &["t"],
            move |msg| {
                sink.lock().unwrap().push((**msg).clone());
                Ok(())
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    bus.publish("t", json!(1), PublishOptions::default());

    let captured = captured.lock().unwrap();
    assert!(!captured[0].id.is_empty());
    assert!(captured[0].created_at > 0);
}

#[test]
fn test_producer_supplied_id_is_kept() {
    let bus = Bus::new(settings());
    let captured = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = captured.clone();
    let _unsub = bus
        .subscribe(
            &["t"],
            move |msg| {
                sink.lock().unwrap().push(msg.id.clone());
                Ok(())
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    let mut msg = Message::new("t", json!(1));
    msg.id = "my-id".to_string();
    bus.publish_message(msg, "client-a");

    assert_eq!(captured.lock().unwrap().as_slice(), ["my-id"]);
}

#[test]
fn test_global_wildcard_gated_by_config() {
    let bus = Bus::new(settings());
    let err = bus
        .subscribe(&["**"], |_| Ok(()), SubscribeOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), "PATTERN_INVALID");

    let mut open = settings();
    open.allow_global_wildcard = true;
    let bus = Bus::new(open);
    assert!(
        bus.subscribe(&["**"], |_| Ok(()), SubscribeOptions::default())
            .is_ok()
    );
}

#[test]
fn test_unsubscribe_is_idempotent() {
    let bus = Bus::new(settings());
    let (seen, unsub) = collecting_sub(&bus, &["t"], SubscribeOptions::default());

    unsub.unsubscribe();
    unsub.unsubscribe(); // second call is a no-op, not an error

    bus.publish("t", json!(1), PublishOptions::default());
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(bus.stats().subscription_count, 0);
}

#[test]
fn test_retained_replay_on_subscribe() {
    let bus = Bus::new(settings());
    bus.publish("config.theme", json!("dark"), PublishOptions::retained());

    // Delivery happens synchronously, before subscribe returns.
    let (seen, _unsub) = collecting_sub(
        &bus,
        &["config.theme"],
        SubscribeOptions {
            retained: true,
            client_id: None,
        },
    );
    assert_eq!(seen.lock().unwrap().as_slice(), ["config.theme"]);
}

#[test]
fn test_retained_replay_respects_wildcards() {
    let bus = Bus::new(settings());
    bus.publish("config.theme", json!("dark"), PublishOptions::retained());
    bus.publish("config.lang", json!("en"), PublishOptions::retained());
    bus.publish("other.topic", json!(0), PublishOptions::retained());

    let (seen, _unsub) = collecting_sub(
        &bus,
        &["config.*"],
        SubscribeOptions {
            retained: true,
            client_id: None,
        },
    );
    let mut topics = seen.lock().unwrap().clone();
    topics.sort();
    assert_eq!(topics, ["config.lang", "config.theme"]);
}

#[test]
fn test_retained_eviction_is_lru() {
    let mut s = settings();
    s.max_retained = 3;
    let bus = Bus::new(s);

    for topic in ["t.1", "t.2", "t.3", "t.4"] {
        bus.publish(topic, json!(topic), PublishOptions::retained());
    }

    let stats = bus.stats();
    assert_eq!(stats.retained_count, 3);
    assert_eq!(stats.retained_evicted, 1);

    // The least-recently-touched topic (t.1) is the one gone.
    let (seen, _unsub) = collecting_sub(
        &bus,
        &["t.1"],
        SubscribeOptions {
            retained: true,
            client_id: None,
        },
    );
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_retained_tombstone_clears_topic() {
    let bus = Bus::new(settings());
    bus.publish("state.x", json!(1), PublishOptions::retained());
    assert_eq!(bus.stats().retained_count, 1);

    bus.publish("state.x", serde_json::Value::Null, PublishOptions::retained());
    assert_eq!(bus.stats().retained_count, 0);
}

#[test]
fn test_rate_limit_drops_and_reports() {
    let mut s = settings();
    s.rate_limit_per_second = 5;
    let bus = Bus::new(s);

    let (seen, _unsub) = collecting_sub(&bus, &["t"], SubscribeOptions::default());
    let rate_errors = Arc::new(AtomicUsize::new(0));
    let counter = rate_errors.clone();
    let _guard = bus.on_error(move |event| {
        if event.code == "RATE_LIMIT_EXCEEDED" {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    for _ in 0..8 {
        bus.publish("t", json!(1), PublishOptions::from_client("producer-1"));
    }

    assert_eq!(seen.lock().unwrap().len(), 5);
    assert_eq!(rate_errors.load(Ordering::SeqCst), 3);
    let stats = bus.stats();
    assert_eq!(stats.published, 5);
    assert_eq!(stats.dropped, 3);
}

#[test]
fn test_invalid_message_dropped_silently() {
    let bus = Bus::new(settings());
    let (seen, _unsub) = collecting_sub(&bus, &["t"], SubscribeOptions::default());

    let codes = Arc::new(Mutex::new(Vec::new()));
    let sink = codes.clone();
    let _guard = bus.on_error(move |event| sink.lock().unwrap().push(event.code));

    bus.publish("", json!(1), PublishOptions::default());
    bus.publish(&"x".repeat(300), json!(1), PublishOptions::default());

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(
        codes.lock().unwrap().as_slice(),
        ["MESSAGE_INVALID", "MESSAGE_INVALID"]
    );
    assert_eq!(bus.stats().dropped, 2);
}

#[test]
fn test_payload_size_limit() {
    let mut s = settings();
    s.max_payload_size_bytes = 16;
    let bus = Bus::new(s);
    let (seen, _unsub) = collecting_sub(&bus, &["t"], SubscribeOptions::default());

    bus.publish("t", json!("small"), PublishOptions::default());
    bus.publish(
        "t",
        json!("a much longer payload that blows the limit"),
        PublishOptions::default(),
    );

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(bus.stats().dropped, 1);
}

#[test]
fn test_single_producer_ordering() {
    let mut s = settings();
    s.allow_global_wildcard = true;
    let bus = Bus::new(s);
    let (seen, _unsub) = collecting_sub(&bus, &["**"], SubscribeOptions::default());

    bus.publish("t1", json!(1), PublishOptions::default());
    bus.publish("t2", json!(2), PublishOptions::default());
    bus.publish("t3", json!(3), PublishOptions::default());

    assert_eq!(seen.lock().unwrap().as_slice(), ["t1", "t2", "t3"]);
}

#[test]
fn test_failing_handler_does_not_stop_delivery() {
    let bus = Bus::new(settings());
    let _bad = bus
        .subscribe(&["t"], |_| Err("boom".into()), SubscribeOptions::default())
        .unwrap();
    let (seen, _unsub) = collecting_sub(&bus, &["t"], SubscribeOptions::default());

    let codes = Arc::new(Mutex::new(Vec::new()));
    let sink = codes.clone();
    let _guard = bus.on_error(move |event| sink.lock().unwrap().push(event.code));

    bus.publish("t", json!(1), PublishOptions::default());

    assert_eq!(seen.lock().unwrap().as_slice(), ["t"]);
    assert_eq!(codes.lock().unwrap().as_slice(), ["HANDLER_THREW"]);
}

#[test]
fn test_panicking_handler_is_caught() {
    let bus = Bus::new(settings());
    let _bad = bus
        .subscribe(
            &["t"],
            |_| panic!("handler panic"),
            SubscribeOptions::default(),
        )
        .unwrap();
    let (seen, _unsub) = collecting_sub(&bus, &["t"], SubscribeOptions::default());

    bus.publish("t", json!(1), PublishOptions::default());

    assert_eq!(seen.lock().unwrap().as_slice(), ["t"]);
    assert_eq!(bus.stats().errors, 1);
}

#[test]
fn test_handler_may_publish_reentrantly() {
    let bus = Bus::new(settings());
    let inner_bus = bus.clone();
    let _relay = bus
        .subscribe(
            &["first"],
            move |_| {
                inner_bus.publish("second", json!(2), PublishOptions::default());
                Ok(())
            },
            SubscribeOptions::default(),
        )
        .unwrap();
    let (seen, _unsub) = collecting_sub(&bus, &["second"], SubscribeOptions::default());

    bus.publish("first", json!(1), PublishOptions::default());

    assert_eq!(seen.lock().unwrap().as_slice(), ["second"]);
}

#[test]
fn test_sweep_removes_disposed_client_subscriptions() {
    let bus = Bus::new(settings());
    let (seen, _unsub) = collecting_sub(
        &bus,
        &["t"],
        SubscribeOptions {
            retained: false,
            client_id: Some("widget-7".to_string()),
        },
    );

    bus.mark_client_disposed("widget-7");
    bus.sweep();

    bus.publish("t", json!(1), PublishOptions::default());
    assert!(seen.lock().unwrap().is_empty());
    let stats = bus.stats();
    assert_eq!(stats.subscriptions_cleaned_up, 1);
    assert_eq!(stats.subscription_count, 0);
}

#[test]
fn test_sweep_counts_stale_ledger_entries() {
    let bus = Bus::new(settings());
    bus.publish("t", json!(1), PublishOptions::from_client("quiet-client"));

    // Well past the window the client's entry was opened in.
    bus.sweep_at(chrono::Utc::now().timestamp_millis() + 3 * WINDOW_MS);

    assert_eq!(bus.stats().ledger_entries_swept, 1);
}

#[test]
fn test_shutdown_releases_everything() {
    let bus = Bus::new(settings());
    let (seen, _unsub) = collecting_sub(&bus, &["t"], SubscribeOptions::default());
    bus.publish("keep", json!(1), PublishOptions::retained());

    bus.shutdown();

    bus.publish("t", json!(1), PublishOptions::default());
    assert!(seen.lock().unwrap().is_empty());
    let stats = bus.stats();
    assert_eq!(stats.subscription_count, 0);
    assert_eq!(stats.retained_count, 0);
}

#[test]
fn test_error_listener_unsubscribe() {
    let bus = Bus::new(settings());
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let guard = bus.on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    bus.publish("", json!(1), PublishOptions::default());
    guard.unsubscribe();
    guard.unsubscribe();
    bus.publish("", json!(1), PublishOptions::default());

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let bus = Bus::new(settings());
    let responder = bus.clone();
    let _svc = bus
        .subscribe(
            &["math.double"],
            move |msg| {
                let n = msg.payload.as_i64().unwrap_or(0);
                responder.respond(msg, json!(n * 2));
                Ok(())
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    let reply = bus
        .request("math.double", json!(21), Duration::from_millis(200))
        .await
        .expect("reply should arrive");
    assert_eq!(reply, json!(42));
}

#[tokio::test]
async fn test_request_times_out_without_responder() {
    let bus = Bus::new(settings());
    let err = bus
        .request("nobody.home", json!(1), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "REQUEST_TIMEOUT");
    // The one-shot reply subscription is gone.
    assert_eq!(bus.stats().subscription_count, 0);
}

#[tokio::test]
async fn test_maintenance_task_sweeps() {
    let mut s = settings();
    s.cleanup_interval_ms = 20;
    let bus = Bus::new(s);
    let (_seen, _unsub) = collecting_sub(
        &bus,
        &["t"],
        SubscribeOptions {
            retained: false,
            client_id: Some("gone".to_string()),
        },
    );
    bus.mark_client_disposed("gone");

    let handle = super::engine::spawn_maintenance(&bus);
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(bus.stats().subscription_count, 0);
    bus.shutdown();
    let _ = handle.await;
}

// --- retained store unit tests -------------------------------------------

#[test]
fn test_retained_store_eviction_order() {
    let mut store = RetainedStore::new(2);
    store.store(Arc::new(Message::new("a", json!(1))));
    store.store(Arc::new(Message::new("b", json!(2))));

    // Touch `a` so `b` becomes least-recently-touched.
    let pattern = TopicPattern::parse("a").unwrap();
    assert_eq!(store.resolve(&pattern).len(), 1);

    let outcome = store.store(Arc::new(Message::new("c", json!(3))));
    assert_eq!(outcome, StoreOutcome::Evicted("b".to_string()));
    assert_eq!(store.len(), 2);
}

#[test]
fn test_retained_store_replace_is_not_eviction() {
    let mut store = RetainedStore::new(2);
    store.store(Arc::new(Message::new("a", json!(1))));
    let outcome = store.store(Arc::new(Message::new("a", json!(2))));
    assert_eq!(outcome, StoreOutcome::Stored);
    assert_eq!(store.len(), 1);
}

// --- rate limit ledger unit tests ----------------------------------------

#[test]
fn test_ledger_allows_up_to_limit() {
    let mut ledger = RateLimitLedger::new();
    let now = 1_000_000;
    for _ in 0..3 {
        assert!(ledger.allow("c", now, 3));
    }
    assert!(!ledger.allow("c", now, 3));
}

#[test]
fn test_ledger_resets_each_window() {
    let mut ledger = RateLimitLedger::new();
    let now = 1_000_000;
    for _ in 0..3 {
        ledger.allow("c", now, 2);
    }
    assert!(ledger.allow("c", now + WINDOW_MS, 2));
}

#[test]
fn test_ledger_sweep_drops_stale_entries() {
    let mut ledger = RateLimitLedger::new();
    let now = 1_000_000;
    ledger.allow("old", now, 10);
    ledger.allow("fresh", now + 3 * WINDOW_MS, 10);

    let swept = ledger.sweep(now + 3 * WINDOW_MS);
    assert_eq!(swept, 1);
    assert_eq!(ledger.len(), 1);
}
