//! Wire types and domain records for the exchange betting API.
//!
//! The wire structs mirror the JSON the exchange actually sends (camelCase,
//! nested envelopes, optional everything); the `*Record` types are what the
//! rest of the pipeline consumes. Translation happens once, in the client.

use chrono::{DateTime, Utc};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Domain records
// ---------------------------------------------------------------------------

/// A sport / event type.
#[derive(Debug, Clone)]
pub struct EventTypeRecord {
    pub id: String,
    pub name: String,
    pub market_count: i64,
}

/// A league / competition.
#[derive(Debug, Clone)]
pub struct CompetitionRecord {
    pub id: String,
    pub name: String,
    pub region: Option<String>,
    pub market_count: i64,
}

/// A match / event.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: String,
    pub name: String,
    pub venue: Option<String>,
    pub open_date: Option<DateTime<Utc>>,
    pub market_count: i64,
}

/// A selection within a market catalogue entry.
#[derive(Debug, Clone)]
pub struct RunnerRecord {
    pub selection_id: i64,
    pub name: String,
    pub handicap: f64,
    pub sort_priority: i64,
}

/// Market metadata.
#[derive(Debug, Clone)]
pub struct MarketCatalogueRecord {
    pub market_id: String,
    pub market_name: String,
    pub market_type: String,
    pub event_id: String,
    pub event_name: String,
    pub competition_id: Option<String>,
    pub total_matched: f64,
    pub runners: Vec<RunnerRecord>,
}

/// Price and size at one ladder level.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PriceSize {
    pub price: f64,
    pub size: f64,
}

/// Live prices and volumes for one runner. Ladders are sorted best-first by
/// the exchange: back descending in implied probability, lay ascending.
#[derive(Debug, Clone)]
pub struct RunnerBook {
    pub selection_id: i64,
    pub status: String,
    pub last_price_traded: Option<f64>,
    pub total_matched: f64,
    pub back_prices: Vec<PriceSize>,
    pub lay_prices: Vec<PriceSize>,
}

/// Live market state.
#[derive(Debug, Clone)]
pub struct MarketBook {
    pub market_id: String,
    pub is_market_data_delayed: bool,
    pub status: String,
    pub in_play: bool,
    pub total_matched: f64,
    pub total_available: f64,
    pub runners: Vec<RunnerBook>,
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct WireEventTypeEnvelope {
    #[serde(rename = "eventType")]
    pub event_type: WireIdName,
    #[serde(rename = "marketCount", default)]
    pub market_count: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireIdName {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireCompetitionEnvelope {
    pub competition: WireIdName,
    #[serde(rename = "competitionRegion", default)]
    pub competition_region: Option<String>,
    #[serde(rename = "marketCount", default)]
    pub market_count: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireEventEnvelope {
    pub event: WireEvent,
    #[serde(rename = "marketCount", default)]
    pub market_count: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireEvent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(rename = "openDate", default)]
    pub open_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMarketCatalogue {
    #[serde(rename = "marketId")]
    pub market_id: String,
    #[serde(rename = "marketName", default)]
    pub market_name: String,
    #[serde(rename = "totalMatched", default)]
    pub total_matched: f64,
    #[serde(default)]
    pub event: Option<WireEvent>,
    #[serde(default)]
    pub competition: Option<WireIdName>,
    #[serde(default)]
    pub description: Option<WireMarketDescription>,
    #[serde(default)]
    pub runners: Vec<WireCatalogueRunner>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMarketDescription {
    #[serde(rename = "marketType", default)]
    pub market_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireCatalogueRunner {
    #[serde(rename = "selectionId")]
    pub selection_id: i64,
    #[serde(rename = "runnerName", default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub handicap: f64,
    #[serde(rename = "sortPriority", default)]
    pub sort_priority: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMarketBook {
    #[serde(rename = "marketId")]
    pub market_id: String,
    #[serde(rename = "isMarketDataDelayed", default)]
    pub is_market_data_delayed: bool,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub inplay: bool,
    #[serde(rename = "totalMatched", default)]
    pub total_matched: f64,
    #[serde(rename = "totalAvailable", default)]
    pub total_available: f64,
    #[serde(default)]
    pub runners: Vec<WireRunnerBook>,
}

fn default_status() -> String {
    "OPEN".to_string()
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireRunnerBook {
    #[serde(rename = "selectionId")]
    pub selection_id: i64,
    #[serde(default = "default_runner_status")]
    pub status: String,
    #[serde(rename = "lastPriceTraded", default)]
    pub last_price_traded: Option<f64>,
    #[serde(rename = "totalMatched", default)]
    pub total_matched: f64,
    #[serde(default)]
    pub ex: Option<WireExchangePrices>,
}

fn default_runner_status() -> String {
    "ACTIVE".to_string()
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct WireExchangePrices {
    #[serde(rename = "availableToBack", default)]
    pub available_to_back: Vec<PriceSize>,
    #[serde(rename = "availableToLay", default)]
    pub available_to_lay: Vec<PriceSize>,
}

// ---------------------------------------------------------------------------
// Wire -> domain translation
// ---------------------------------------------------------------------------

impl From<WireEventTypeEnvelope> for EventTypeRecord {
    fn from(w: WireEventTypeEnvelope) -> Self {
        Self {
            id: w.event_type.id,
            name: w.event_type.name,
            market_count: w.market_count,
        }
    }
}

impl From<WireCompetitionEnvelope> for CompetitionRecord {
    fn from(w: WireCompetitionEnvelope) -> Self {
        Self {
            id: w.competition.id,
            name: w.competition.name,
            region: w.competition_region,
            market_count: w.market_count,
        }
    }
}

impl From<WireEventEnvelope> for EventRecord {
    fn from(w: WireEventEnvelope) -> Self {
        let open_date = w
            .event
            .open_date
            .as_deref()
            .and_then(parse_exchange_timestamp);
        Self {
            id: w.event.id,
            name: w.event.name,
            venue: w.event.venue,
            open_date,
            market_count: w.market_count,
        }
    }
}

impl From<WireMarketCatalogue> for MarketCatalogueRecord {
    fn from(w: WireMarketCatalogue) -> Self {
        let runners = w
            .runners
            .into_iter()
            .map(|r| RunnerRecord {
                selection_id: r.selection_id,
                name: r.runner_name.unwrap_or_else(|| "Unknown".to_string()),
                handicap: r.handicap,
                sort_priority: r.sort_priority,
            })
            .collect();
        Self {
            market_id: w.market_id,
            market_name: w.market_name,
            market_type: w
                .description
                .and_then(|d| d.market_type)
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            event_id: w.event.as_ref().map(|e| e.id.clone()).unwrap_or_default(),
            event_name: w.event.map(|e| e.name).unwrap_or_default(),
            competition_id: w.competition.map(|c| c.id),
            total_matched: w.total_matched,
            runners,
        }
    }
}

impl From<WireMarketBook> for MarketBook {
    fn from(w: WireMarketBook) -> Self {
        let runners = w
            .runners
            .into_iter()
            .map(|r| {
                let ex = r.ex.unwrap_or_default();
                RunnerBook {
                    selection_id: r.selection_id,
                    status: r.status,
                    last_price_traded: r.last_price_traded,
                    total_matched: r.total_matched,
                    back_prices: ex.available_to_back,
                    lay_prices: ex.available_to_lay,
                }
            })
            .collect();
        Self {
            market_id: w.market_id,
            is_market_data_delayed: w.is_market_data_delayed,
            status: w.status,
            in_play: w.inplay,
            total_matched: w.total_matched,
            total_available: w.total_available,
            runners,
        }
    }
}

/// The exchange sends ISO timestamps with a trailing Z and no offset.
pub(crate) fn parse_exchange_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_book_parses_from_wire_json() {
        let json = r#"{
            "marketId": "1.2345",
            "isMarketDataDelayed": false,
            "status": "OPEN",
            "inplay": false,
            "totalMatched": 15000.5,
            "totalAvailable": 4200.0,
            "runners": [
                {
                    "selectionId": 47972,
                    "status": "ACTIVE",
                    "lastPriceTraded": 2.5,
                    "totalMatched": 8420.5,
                    "ex": {
                        "availableToBack": [
                            {"price": 2.44, "size": 320.0},
                            {"price": 2.42, "size": 580.0}
                        ],
                        "availableToLay": [
                            {"price": 2.54, "size": 280.0}
                        ]
                    }
                }
            ]
        }"#;
        let wire: WireMarketBook = serde_json::from_str(json).unwrap();
        let book = MarketBook::from(wire);
        assert_eq!(book.market_id, "1.2345");
        assert!(!book.in_play);
        assert_eq!(book.runners.len(), 1);
        let runner = &book.runners[0];
        assert_eq!(runner.selection_id, 47972);
        assert_eq!(runner.back_prices[0].price, 2.44);
        assert_eq!(runner.lay_prices.len(), 1);
    }

    #[test]
    fn market_book_tolerates_missing_ex_block() {
        let json = r#"{
            "marketId": "1.1",
            "runners": [{"selectionId": 1}]
        }"#;
        let wire: WireMarketBook = serde_json::from_str(json).unwrap();
        let book = MarketBook::from(wire);
        assert_eq!(book.status, "OPEN");
        assert!(book.runners[0].back_prices.is_empty());
    }

    #[test]
    fn catalogue_falls_back_to_unknown_market_type() {
        let json = r#"{"marketId": "1.9", "marketName": "Match Odds"}"#;
        let wire: WireMarketCatalogue = serde_json::from_str(json).unwrap();
        let record = MarketCatalogueRecord::from(wire);
        assert_eq!(record.market_type, "UNKNOWN");
    }

    #[test]
    fn event_open_date_parses() {
        let json = r#"{"event": {"id": "31", "name": "A v B", "openDate": "2026-08-01T17:00:00.000Z"}}"#;
        let wire: WireEventEnvelope = serde_json::from_str(json).unwrap();
        let record = EventRecord::from(wire);
        assert!(record.open_date.is_some());
    }
}
