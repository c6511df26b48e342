// =============================================================================
// Broadcast Hub — fan-out of normalized ticks to live subscribers
// =============================================================================
//
// Each event is serialized once and pushed into a bounded tokio broadcast
// channel.  Publishing never waits on a subscriber: a receiver that falls
// more than `capacity` messages behind gets `Lagged` and skips ahead, so one
// slow socket cannot back up the feed or other subscribers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{iso_millis, now_ms, NormalizedTick};

#[derive(Serialize)]
struct PriceData<'a> {
    symbol: &'a str,
    ts: String,
    value: f64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutboundEvent<'a> {
    Price { data: PriceData<'a> },
    Ping { ts: String },
    Info { message: &'a str },
}

impl OutboundEvent<'_> {
    fn encode(&self) -> Arc<str> {
        // These shapes cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default().into()
    }
}

pub const WELCOME_MESSAGE: &str = "Connected to prices stream";

pub struct BroadcastHub {
    tx: broadcast::Sender<Arc<str>>,
    subscribers: Arc<AtomicUsize>,
    published: AtomicU64,
}

/// A live subscriber. Dropping it removes the subscriber from the hub.
pub struct Subscription {
    pub rx: broadcast::Receiver<Arc<str>>,
    subscribers: Arc<AtomicUsize>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.fetch_sub(1, Ordering::Relaxed);
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            subscribers: Arc::new(AtomicUsize::new(0)),
            published: AtomicU64::new(0),
        }
    }

    pub fn join(&self) -> Subscription {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
        Subscription {
            rx: self.tx.subscribe(),
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Push one tick to every subscriber. Returns the number of receivers
    /// the event was queued for (0 with nobody listening).
    pub fn publish_tick(&self, tick: &NormalizedTick) -> usize {
        let event = OutboundEvent::Price {
            data: PriceData {
                symbol: &tick.symbol,
                ts: tick.ts_iso(),
                value: tick.price,
                open: tick.open,
                high: tick.high,
                low: tick.low,
                close: tick.close,
                volume: tick.volume,
            },
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        self.send(event.encode())
    }

    /// Liveness ping, independent of tick flow.
    pub fn publish_ping(&self) -> usize {
        self.send(OutboundEvent::Ping { ts: iso_millis(now_ms()) }.encode())
    }

    fn send(&self, payload: Arc<str>) -> usize {
        // Err only means there are no receivers right now.
        self.tx.send(payload).unwrap_or(0)
    }
}

pub fn welcome_message() -> Arc<str> {
    OutboundEvent::Info {
        message: WELCOME_MESSAGE,
    }
    .encode()
}
