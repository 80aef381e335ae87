//! Discovery and snapshot capture against the exchange.

pub mod discovery;
pub mod snapshots;

pub use discovery::{should_exclude_competition, DiscoveryService, DiscoveryStats};
pub use snapshots::{
    build_ladder, extract_snapshot_metrics, overround, spread_in_ticks, tick_size,
    SnapshotMetrics, SnapshotService, SnapshotStats,
};
