//! Snapshot capture: poll order books for active markets and persist
//! point-in-time ladders.
//!
//! Batch error policy: a TOO_MUCH_DATA response discards the batch (shrink
//! the depth or batch size, the markets are fine); a 400 marks the batch's
//! markets CLOSED because their ids have gone stale upstream; anything else
//! counts an error and the run moves on to the next batch.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::exchange::types::MarketBook;
use crate::exchange::{ApiError, ExchangeClient};
use crate::models::{LadderData, MarketStatus, PriceLevel, RunnerLadder};
use crate::storage::Database;

/// Exchange tick table: (inclusive upper price bound, tick increment).
const TICK_INCREMENTS: [(f64, f64); 10] = [
    (2.0, 0.01),
    (3.0, 0.02),
    (4.0, 0.05),
    (6.0, 0.10),
    (10.0, 0.20),
    (20.0, 0.50),
    (30.0, 1.00),
    (50.0, 2.00),
    (100.0, 5.00),
    (1000.0, 10.00),
];

/// Tick increment at a given price.
pub fn tick_size(price: f64) -> f64 {
    for (max_price, increment) in TICK_INCREMENTS {
        if price <= max_price {
            return increment;
        }
    }
    10.0
}

/// Spread in tick increments, using the mid price to pick the tick band.
pub fn spread_in_ticks(back_price: f64, lay_price: f64) -> f64 {
    if back_price <= 0.0 || lay_price <= 0.0 {
        return 0.0;
    }
    let spread = lay_price - back_price;
    if spread <= 0.0 {
        return 0.0;
    }
    let mid = (back_price + lay_price) / 2.0;
    spread / tick_size(mid)
}

/// Sum of implied probabilities over best back prices, rounded to 4 dp.
/// Above 1.0 the book carries a margin.
pub fn overround(best_backs: &[f64]) -> f64 {
    if best_backs.is_empty() || best_backs.iter().any(|p| *p <= 0.0) {
        return 0.0;
    }
    let total: f64 = best_backs.iter().map(|p| 1.0 / p).sum();
    (total * 10_000.0).round() / 10_000.0
}

/// Build the persisted ladder payload from a live book.
pub fn build_ladder(book: &MarketBook) -> LadderData {
    let mut runners = Vec::with_capacity(book.runners.len());
    let mut best_backs = Vec::new();

    for runner in &book.runners {
        if let Some(best) = runner.back_prices.first() {
            best_backs.push(best.price);
        }
        runners.push(RunnerLadder {
            runner_id: runner.selection_id,
            last_traded: runner.last_price_traded,
            total_matched: runner.total_matched,
            back: runner
                .back_prices
                .iter()
                .map(|p| PriceLevel { price: p.price, size: p.size })
                .collect(),
            lay: runner
                .lay_prices
                .iter()
                .map(|p| PriceLevel { price: p.price, size: p.size })
                .collect(),
        });
    }

    LadderData {
        runners,
        overround: overround(&best_backs),
        total_available: book.total_available,
    }
}

/// Per-snapshot metrics the profiler aggregates.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotMetrics {
    pub spread_ticks: f64,
    pub best_depth: f64,
    pub depth_5_ticks: f64,
    pub mid_price: f64,
}

/// Extract market-level metrics from a ladder: spread averaged across
/// runners, summed best depth, depth within five ticks of best on either
/// side, and the mean mid price.
pub fn extract_snapshot_metrics(ladder: &LadderData) -> SnapshotMetrics {
    let mut total_spread = 0.0;
    let mut total_best_depth = 0.0;
    let mut total_depth_5 = 0.0;
    let mut mid_prices = Vec::new();
    let mut valid_runners = 0usize;

    for runner in &ladder.runners {
        let (best_back, best_lay) = match (runner.back.first(), runner.lay.first()) {
            (Some(b), Some(l)) => (b, l),
            _ => continue,
        };

        total_spread += spread_in_ticks(best_back.price, best_lay.price);
        total_best_depth += best_back.size + best_lay.size;

        let tick = tick_size((best_back.price + best_lay.price) / 2.0);
        for level in &runner.back {
            if best_back.price - level.price <= 5.0 * tick {
                total_depth_5 += level.size;
            }
        }
        for level in &runner.lay {
            if level.price - best_lay.price <= 5.0 * tick {
                total_depth_5 += level.size;
            }
        }

        mid_prices.push((best_back.price + best_lay.price) / 2.0);
        valid_runners += 1;
    }

    if valid_runners == 0 {
        return SnapshotMetrics::default();
    }

    SnapshotMetrics {
        spread_ticks: total_spread / valid_runners as f64,
        best_depth: total_best_depth,
        depth_5_ticks: total_depth_5,
        mid_price: mid_prices.iter().sum::<f64>() / mid_prices.len() as f64,
    }
}

#[derive(Debug, Default, Serialize)]
pub struct SnapshotStats {
    pub markets_queried: usize,
    pub snapshots_stored: usize,
    pub markets_suspended: usize,
    pub batches_processed: usize,
    pub batches_failed: usize,
    pub batches_skipped_soft_limit: usize,
    pub errors: usize,
}

/// Past this point the run stops launching new batches and returns partial
/// stats; the hard limit (enforced by the scheduler) would abort it.
const SOFT_TIME_LIMIT: std::time::Duration = std::time::Duration::from_secs(45);

pub struct SnapshotService {
    client: Arc<ExchangeClient>,
    db: Database,
    ladder_depth: usize,
    batch_size: usize,
}

impl SnapshotService {
    pub fn new(client: Arc<ExchangeClient>, db: Database, ladder_depth: usize, batch_size: usize) -> Self {
        Self {
            client,
            db,
            ladder_depth,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn capture_snapshots(&self) -> anyhow::Result<SnapshotStats> {
        let mut stats = SnapshotStats::default();

        let markets = self.db.active_markets()?;
        if markets.is_empty() {
            debug!("no_active_markets");
            return Ok(stats);
        }
        stats.markets_queried = markets.len();

        let id_map: std::collections::HashMap<&str, i64> = markets
            .iter()
            .map(|m| (m.exchange_id.as_str(), m.market_id))
            .collect();

        let total_batches = markets.len().div_ceil(self.batch_size);
        info!(
            total_markets = markets.len(),
            total_batches,
            batch_size = self.batch_size,
            "snapshot_capture_starting"
        );

        let run_started = std::time::Instant::now();
        for (index, batch) in markets.chunks(self.batch_size).enumerate() {
            let batch_num = index + 1;
            if run_started.elapsed() > SOFT_TIME_LIMIT {
                stats.batches_skipped_soft_limit = total_batches - index;
                warn!(
                    completed = index,
                    remaining = stats.batches_skipped_soft_limit,
                    "snapshot_soft_limit_reached"
                );
                break;
            }
            let ids: Vec<String> = batch.iter().map(|m| m.exchange_id.clone()).collect();

            match self.client.list_market_book(&ids, self.ladder_depth).await {
                Ok(books) => {
                    let mut batch_stored = 0usize;
                    let mut batch_suspended = 0usize;
                    for book in books {
                        let Some(&market_id) = id_map.get(book.market_id.as_str()) else {
                            continue;
                        };
                        match self.store_book(market_id, &book, &mut stats)? {
                            StoreOutcome::Stored => batch_stored += 1,
                            StoreOutcome::Suspended => batch_suspended += 1,
                            StoreOutcome::Duplicate => {}
                        }
                    }
                    stats.batches_processed += 1;

                    if batch_num == 1 || batch_num == total_batches || batch_num % 100 == 0 {
                        info!(
                            batch = batch_num,
                            total_batches,
                            batch_stored,
                            batch_suspended,
                            total_stored = stats.snapshots_stored,
                            "snapshot_batch_progress"
                        );
                    }
                }
                Err(err) => {
                    stats.batches_failed += 1;
                    match err.downcast_ref::<ApiError>() {
                        Some(api) if api.is_too_much_data() => {
                            // Batch too heavy; drop it and let the next
                            // cadence retry at this size or smaller.
                            warn!(batch = batch_num, total_batches, "snapshot_batch_too_much_data");
                            stats.errors += 1;
                        }
                        Some(api) if api.is_invalid_input() => {
                            warn!(
                                batch = batch_num,
                                total_batches,
                                error = %api,
                                "snapshot_batch_stale_markets"
                            );
                            for market in batch {
                                self.db
                                    .set_market_status(market.market_id, MarketStatus::Closed)?;
                                stats.markets_suspended += 1;
                            }
                        }
                        _ => {
                            warn!(batch = batch_num, total_batches, error = %err, "snapshot_batch_error");
                            stats.errors += 1;
                        }
                    }
                }
            }
        }

        info!(
            markets = stats.markets_queried,
            stored = stats.snapshots_stored,
            suspended = stats.markets_suspended,
            "snapshots_captured"
        );
        Ok(stats)
    }

    fn store_book(
        &self,
        market_id: i64,
        book: &MarketBook,
        stats: &mut SnapshotStats,
    ) -> anyhow::Result<StoreOutcome> {
        if book.status != "OPEN" {
            stats.markets_suspended += 1;
            self.db
                .set_market_status(market_id, MarketStatus::parse(&book.status))?;
            return Ok(StoreOutcome::Suspended);
        }
        if book.in_play {
            stats.markets_suspended += 1;
            self.db.set_market_in_play(market_id)?;
            return Ok(StoreOutcome::Suspended);
        }

        let ladder = build_ladder(book);
        let inserted = self.db.insert_snapshot(
            market_id,
            Utc::now(),
            book.total_matched,
            book.total_available,
            ladder.overround,
            &ladder,
        )?;
        if inserted.is_some() {
            stats.snapshots_stored += 1;
            Ok(StoreOutcome::Stored)
        } else {
            Ok(StoreOutcome::Duplicate)
        }
    }
}

enum StoreOutcome {
    Stored,
    Suspended,
    Duplicate,
}
