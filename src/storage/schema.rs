//! Database schema.
//!
//! Timestamps are stored as fixed-width UTC text (`%Y-%m-%dT%H:%M:%S%.6fZ`)
//! so lexicographic comparison matches chronological order; dates as
//! `%Y-%m-%d`. Ladder data, closing odds, settlement results, entry
//! criteria and job metadata are JSON columns: the in-memory types are
//! strongly typed and validated at the boundary, the columns stay flexible.

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS competitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_id TEXT NOT NULL UNIQUE,
    sport_id INTEGER NOT NULL REFERENCES sports(id),
    name TEXT NOT NULL,
    country_code TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    tier TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_id TEXT NOT NULL UNIQUE,
    competition_id INTEGER NOT NULL REFERENCES competitions(id),
    name TEXT NOT NULL,
    scheduled_start TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'SCHEDULED',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_scheduled
    ON events(scheduled_start) WHERE status = 'SCHEDULED';

CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_id TEXT NOT NULL UNIQUE,
    event_id INTEGER NOT NULL REFERENCES events(id),
    name TEXT NOT NULL,
    market_type TEXT NOT NULL,
    total_matched REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'OPEN',
    in_play INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_markets_status ON markets(status, event_id);

CREATE TABLE IF NOT EXISTS runners (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    selection_id INTEGER NOT NULL,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    name TEXT NOT NULL,
    sort_priority INTEGER,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    UNIQUE(selection_id, market_id)
);

-- Append-only. The unique constraint makes retried snapshot jobs no-ops
-- instead of duplicate writers.
CREATE TABLE IF NOT EXISTS market_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    captured_at TEXT NOT NULL,
    total_matched REAL NOT NULL DEFAULT 0,
    total_available REAL NOT NULL DEFAULT 0,
    overround REAL NOT NULL DEFAULT 0,
    ladder_json TEXT NOT NULL,
    UNIQUE(market_id, captured_at)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_market_time
    ON market_snapshots(market_id, captured_at DESC);
CREATE INDEX IF NOT EXISTS idx_snapshots_time ON market_snapshots(captured_at);

CREATE TABLE IF NOT EXISTS market_profiles_daily (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    profile_date TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    avg_spread_ticks REAL NOT NULL DEFAULT 0,
    spread_volatility REAL NOT NULL DEFAULT 0,
    avg_depth_best REAL NOT NULL DEFAULT 0,
    depth_5_ticks REAL NOT NULL DEFAULT 0,
    total_matched_volume REAL NOT NULL DEFAULT 0,
    update_rate_per_min REAL NOT NULL DEFAULT 0,
    price_volatility REAL NOT NULL DEFAULT 0,
    mean_price REAL NOT NULL DEFAULT 0,
    snapshot_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE(market_id, profile_date, time_bucket)
);

CREATE TABLE IF NOT EXISTS exploitability_scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    scored_at TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    odds_band TEXT NOT NULL,
    spread_score REAL NOT NULL DEFAULT 0,
    volatility_score REAL NOT NULL DEFAULT 0,
    update_score REAL NOT NULL DEFAULT 0,
    depth_score REAL NOT NULL DEFAULT 0,
    volume_penalty REAL NOT NULL DEFAULT 0,
    total_score REAL NOT NULL,
    guards_failed TEXT,
    config_version_id INTEGER REFERENCES config_versions(id),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scores_market_time
    ON exploitability_scores(market_id, scored_at DESC);
CREATE INDEX IF NOT EXISTS idx_scores_total
    ON exploitability_scores(total_score DESC) WHERE total_score > 50;

CREATE TABLE IF NOT EXISTS config_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    config_type TEXT NOT NULL,
    config_json TEXT NOT NULL,
    created_by TEXT,
    created_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS competition_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    competition_id INTEGER NOT NULL REFERENCES competitions(id),
    stats_date TEXT NOT NULL,
    markets_scored INTEGER NOT NULL DEFAULT 0,
    avg_score REAL NOT NULL DEFAULT 0,
    max_score REAL NOT NULL DEFAULT 0,
    min_score REAL NOT NULL DEFAULT 0,
    score_std_dev REAL NOT NULL DEFAULT 0,
    markets_above_40 INTEGER NOT NULL DEFAULT 0,
    markets_above_55 INTEGER NOT NULL DEFAULT 0,
    markets_above_70 INTEGER NOT NULL DEFAULT 0,
    rolling_30d_avg_score REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(competition_id, stats_date)
);

CREATE TABLE IF NOT EXISTS market_closing_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL UNIQUE REFERENCES markets(id),
    final_score_id INTEGER REFERENCES exploitability_scores(id),
    final_score REAL,
    score_captured_at TEXT,
    closing_snapshot_id INTEGER REFERENCES market_snapshots(id),
    closing_odds_json TEXT,
    odds_captured_at TEXT,
    minutes_to_start INTEGER,
    settled_at TEXT,
    result_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_closing_unsettled
    ON market_closing_data(market_id) WHERE settled_at IS NULL;

CREATE TABLE IF NOT EXISTS event_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL UNIQUE REFERENCES events(id),
    status TEXT NOT NULL DEFAULT 'PENDING',
    completed_at TEXT,
    home_score INTEGER,
    away_score INTEGER,
    total_goals INTEGER,
    btts INTEGER,
    statistics_json TEXT,
    source TEXT NOT NULL DEFAULT 'exchange',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trading_hypotheses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    description TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    entry_criteria_json TEXT NOT NULL,
    selection_logic TEXT NOT NULL DEFAULT 'momentum',
    decision_side TEXT NOT NULL DEFAULT 'BACK',
    total_decisions INTEGER NOT NULL DEFAULT 0,
    total_wins INTEGER NOT NULL DEFAULT 0,
    total_losses INTEGER NOT NULL DEFAULT 0,
    total_pnl REAL NOT NULL DEFAULT 0,
    avg_clv REAL,
    last_decision_at TEXT,
    created_at TEXT NOT NULL
);

-- The unique pair is the idempotence guarantee: at most one decision per
-- (market, hypothesis) no matter how often the engine runs.
CREATE TABLE IF NOT EXISTS shadow_decisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    runner_id INTEGER NOT NULL REFERENCES runners(id),
    side TEXT NOT NULL,
    score_id INTEGER REFERENCES exploitability_scores(id),
    trigger_score REAL NOT NULL DEFAULT 0,
    trigger_reason TEXT NOT NULL DEFAULT '',
    decision_at TEXT NOT NULL,
    minutes_to_start INTEGER NOT NULL,
    entry_back_price REAL NOT NULL,
    entry_lay_price REAL NOT NULL,
    entry_spread REAL NOT NULL,
    available_to_back REAL NOT NULL DEFAULT 0,
    available_to_lay REAL NOT NULL DEFAULT 0,
    theoretical_stake REAL NOT NULL DEFAULT 10.0,
    hypothesis_id INTEGER NOT NULL REFERENCES trading_hypotheses(id),
    hypothesis_name TEXT NOT NULL,
    price_change_30m REAL,
    price_change_1h REAL,
    price_change_2h REAL,
    niche TEXT NOT NULL DEFAULT '',
    competition_id INTEGER REFERENCES competitions(id),
    closing_back_price REAL,
    closing_lay_price REAL,
    closing_mid_price REAL,
    clv_percent REAL,
    outcome TEXT NOT NULL DEFAULT 'PENDING',
    settled_at TEXT,
    gross_pnl REAL,
    commission REAL,
    spread_cost REAL,
    net_pnl REAL,
    max_loss REAL,
    return_on_risk REAL,
    created_at TEXT NOT NULL,
    UNIQUE(market_id, hypothesis_id)
);

CREATE INDEX IF NOT EXISTS idx_decisions_pending
    ON shadow_decisions(market_id) WHERE outcome = 'PENDING';
CREATE INDEX IF NOT EXISTS idx_decisions_niche ON shadow_decisions(niche, outcome);
CREATE INDEX IF NOT EXISTS idx_decisions_date ON shadow_decisions(decision_at);

CREATE TABLE IF NOT EXISTS job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    records_processed INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    metadata_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_runs_name ON job_runs(job_name, started_at DESC);
"#;
