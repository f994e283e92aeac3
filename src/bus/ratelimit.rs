//! Per-client publish rate limiting
//!
//! A sliding one-second window per client id: the first publish in a window
//! records the window start, subsequent publishes increment the counter, and
//! a publish past the ceiling is rejected. A publish after the window has
//! elapsed resets it. Independent of subscription state.
//!
//! Ledger entries for clients that have gone quiet are swept by the bus's
//! periodic maintenance pass.

use std::collections::HashMap;

/// Length of one rate-limit window in milliseconds.
pub const WINDOW_MS: i64 = 1_000;

#[derive(Debug, Clone)]
struct WindowCounter {
    window_start: i64,
    count: u32,
}

#[derive(Debug, Default)]
pub struct RateLimitLedger {
    windows: HashMap<String, WindowCounter>,
}

impl RateLimitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a publish attempt by `client_id` at `now` (epoch millis).
    /// Returns false when the client has exceeded `limit` for the current
    /// window; the attempt still counts against the window.
    pub fn allow(&mut self, client_id: &str, now: i64, limit: u32) -> bool {
        let counter = self
            .windows
            .entry(client_id.to_string())
            .or_insert(WindowCounter {
                window_start: now,
                count: 0,
            });

        if now - counter.window_start >= WINDOW_MS {
            counter.window_start = now;
            counter.count = 0;
        }

        counter.count += 1;
        counter.count <= limit
    }

    /// Drop entries whose window ended more than one full window ago.
    /// Returns the number of entries removed.
    pub fn sweep(&mut self, now: i64) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, counter| now - counter.window_start < 2 * WINDOW_MS);
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
