// =============================================================================
// Tick Pipeline — frame receipt path and the aggregation worker
// =============================================================================
//
// Decoding, normalization, cache and ranking writes and the broadcast all run
// inline on the receipt path; none of them awaits.  Candle aggregation is the
// only stateful step and runs on a dedicated worker that owns the
// `CandleAggregator`.  Ticks reach it over a bounded queue with `try_send`,
// so a backed-up worker costs candle fidelity, never feed throughput.  The
// sweep and shutdown commands share the same queue, which serializes every
// mutation of a symbol's live candle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::broadcast::BroadcastHub;
use crate::market_data::candle_aggregator::{AggregatorStats, CandleAggregator};
use crate::market_data::decoder;
use crate::market_data::movers::MoversRanker;
use crate::market_data::normalizer::{DropStats, TickNormalizer};
use crate::market_data::price_cache::LatestPriceCache;
use crate::market_data::token_map::TokenMap;
use crate::types::NormalizedTick;

// ---------------------------------------------------------------------------
// Aggregation worker
// ---------------------------------------------------------------------------

pub enum AggregatorCommand {
    Tick(NormalizedTick),
    Sweep(i64),
    Stats(oneshot::Sender<AggregatorStats>),
    /// Flush everything and stop. Replies with the number of candles flushed.
    Shutdown(oneshot::Sender<usize>),
}

/// How long a stats request may wait behind queued ticks.
const STATS_TIMEOUT: Duration = Duration::from_millis(500);

/// Why a tick did not reach the aggregation worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotQueued {
    Full,
    WorkerGone,
}

/// Cloneable handle to the aggregation worker.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggregatorCommand>,
}

impl AggregatorHandle {
    /// Start the worker on a blocking thread; it owns `aggregator` until
    /// shutdown or until every handle is dropped.
    pub fn spawn(mut aggregator: CandleAggregator, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let join = tokio::task::spawn_blocking(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    AggregatorCommand::Tick(tick) => {
                        aggregator.on_normalized(&tick);
                    }
                    AggregatorCommand::Sweep(now) => {
                        aggregator.sweep(now);
                    }
                    AggregatorCommand::Stats(reply) => {
                        let _ = reply.send(aggregator.stats());
                    }
                    AggregatorCommand::Shutdown(reply) => {
                        let flushed = aggregator.flush_all();
                        info!(flushed, "aggregation worker stopped");
                        let _ = reply.send(flushed);
                        return;
                    }
                }
            }
            let flushed = aggregator.flush_all();
            warn!(flushed, "aggregation worker stopped without shutdown, all handles dropped");
        });
        (Self { tx }, join)
    }

    /// Non-blocking enqueue.
    pub fn try_tick(&self, tick: NormalizedTick) -> Result<(), NotQueued> {
        self.tx
            .try_send(AggregatorCommand::Tick(tick))
            .map_err(|e| match e {
                TrySendError::Full(_) => NotQueued::Full,
                TrySendError::Closed(_) => NotQueued::WorkerGone,
            })
    }

    pub async fn sweep(&self, now_ms: i64) -> Result<()> {
        self.tx
            .send(AggregatorCommand::Sweep(now_ms))
            .await
            .context("aggregation worker is gone")
    }

    /// Worker counters. Never waits for queue space and gives up after a
    /// short timeout, so a backed-up worker yields an error rather than a
    /// stalled caller.
    pub async fn stats(&self) -> Result<AggregatorStats> {
        let (reply, rx) = oneshot::channel();
        match self.tx.try_send(AggregatorCommand::Stats(reply)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => bail!("aggregation queue full"),
            Err(TrySendError::Closed(_)) => bail!("aggregation worker is gone"),
        }
        tokio::time::timeout(STATS_TIMEOUT, rx)
            .await
            .context("aggregation worker busy")?
            .context("aggregation worker dropped stats reply")
    }

    /// A handle whose queue nobody drains; the receiver stands in for the
    /// worker.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<AggregatorCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn shutdown(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Shutdown(reply))
            .await
            .context("aggregation worker is gone")?;
        rx.await.context("aggregation worker dropped shutdown reply")
    }
}

// ---------------------------------------------------------------------------
// Receipt path
// ---------------------------------------------------------------------------

pub struct TickPipeline {
    tokens: Arc<TokenMap>,
    normalizer: TickNormalizer,
    cache: Arc<LatestPriceCache>,
    movers: Arc<MoversRanker>,
    hub: Arc<BroadcastHub>,
    aggregator: AggregatorHandle,
    drops: Arc<DropStats>,
}

impl TickPipeline {
    pub fn new(
        tokens: Arc<TokenMap>,
        normalizer: TickNormalizer,
        cache: Arc<LatestPriceCache>,
        movers: Arc<MoversRanker>,
        hub: Arc<BroadcastHub>,
        aggregator: AggregatorHandle,
        drops: Arc<DropStats>,
    ) -> Self {
        Self {
            tokens,
            normalizer,
            cache,
            movers,
            hub,
            aggregator,
            drops,
        }
    }

    /// Process one raw feed frame. Malformed or rejected input is counted
    /// and dropped; nothing here can stop the stream.
    pub fn handle_frame(&self, frame: &[u8], arrival_ms: i64) -> Option<NormalizedTick> {
        let raw = match decoder::decode(frame) {
            Ok(raw) => raw,
            Err(e) => {
                self.drops.record_decode_error(&e, frame.len());
                return None;
            }
        };
        let tick = match self.normalizer.normalize(&raw, &self.tokens, arrival_ms) {
            Ok(tick) => tick,
            Err(rejection) => {
                self.drops.record_rejection(&rejection);
                return None;
            }
        };
        self.drops.record_accepted();
        self.dispatch(&tick);
        Some(tick)
    }

    /// Fan a normalized tick out to the cache, the movers ranking, live
    /// subscribers and the candle worker.
    pub fn dispatch(&self, tick: &NormalizedTick) {
        let prev_close = self.cache.set(tick);
        if prev_close > 0.0 {
            let change = tick.price - prev_close;
            let percent = change / prev_close * 100.0;
            self.movers.upsert(&tick.symbol, percent, tick.price, change);
        }

        self.hub.publish_tick(tick);

        match self.aggregator.try_tick(tick.clone()) {
            Ok(()) => {}
            Err(NotQueued::Full) => self.drops.record_queue_full(&tick.symbol),
            Err(NotQueued::WorkerGone) => self.drops.record_worker_gone(&tick.symbol),
        }
    }

    pub fn drops(&self) -> &DropStats {
        &self.drops
    }
}

/// Log the cumulative drop counters; called once per snapshot cycle.
pub fn log_drop_summary(drops: &DropStats) {
    let s = drops.snapshot();
    if s.decode_errors + s.rejected + s.unknown_tokens + s.queue_full + s.worker_gone == 0 {
        info!(accepted = s.accepted, "tick pipeline summary");
    } else {
        warn!(
            accepted = s.accepted,
            decode_errors = s.decode_errors,
            rejected = s.rejected,
            unknown_tokens = s.unknown_tokens,
            queue_full = s.queue_full,
            worker_gone = s.worker_gone,
            "tick pipeline summary (drops)"
        );
    }
}
