//! Market discovery: competitions, events, markets and runners.
//!
//! Ingest broadly, filter by score. Competitions are never pre-judged by
//! name for market quality; the scoring engine's volume penalty demotes
//! efficient leagues on its own. The only name-based filtering is the hard
//! exclusion list, which exists to stop burning API quota on friendlies,
//! youth football and the like.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Settings;
use crate::exchange::ExchangeClient;
use crate::storage::Database;

/// Exchange ids for the sports we know how to name.
fn sport_exchange_id(name: &str) -> Option<&'static str> {
    match name.to_lowercase().as_str() {
        "soccer" => Some("1"),
        "tennis" => Some("2"),
        "golf" => Some("3"),
        "cricket" => Some("4"),
        "rugby_union" => Some("5"),
        "boxing" => Some("6"),
        "horse_racing" => Some("7"),
        "motor_sport" => Some("8"),
        _ => None,
    }
}

/// Case-insensitive substring match against the hard-exclusion patterns.
pub fn should_exclude_competition(name: &str, patterns: &[String]) -> bool {
    let name_lower = name.to_lowercase();
    for pattern in patterns {
        if name_lower.contains(&pattern.to_lowercase()) {
            debug!(name, pattern = pattern.as_str(), "competition_hard_excluded");
            return true;
        }
    }
    false
}

#[derive(Debug, Default, Serialize)]
pub struct DiscoveryStats {
    pub sports: usize,
    pub competitions: usize,
    pub competitions_excluded: usize,
    pub events: usize,
    pub markets: usize,
    pub runners: usize,
    pub stale_events_closed: usize,
}

pub struct DiscoveryService {
    client: Arc<ExchangeClient>,
    db: Database,
    enabled_sports: Vec<String>,
    market_types: Vec<String>,
    lookahead_hours: i64,
    exclusion_patterns: Vec<String>,
}

impl DiscoveryService {
    pub fn new(client: Arc<ExchangeClient>, db: Database, settings: &Settings) -> Self {
        Self {
            client,
            db,
            enabled_sports: settings.enabled_sports.clone(),
            market_types: settings.enabled_market_types.clone(),
            lookahead_hours: settings.lookahead_hours,
            exclusion_patterns: crate::config::default_exclusion_patterns(),
        }
    }

    pub fn with_exclusions(mut self, patterns: Vec<String>) -> Self {
        self.exclusion_patterns = patterns;
        self
    }

    /// Full discovery pass: sports, competitions, events, markets, runners,
    /// then stale-event cleanup.
    pub async fn discover_all(&self) -> anyhow::Result<DiscoveryStats> {
        let mut stats = DiscoveryStats::default();

        let sports = self.discover_sports()?;
        stats.sports = sports.len();

        let competitions = self.discover_competitions(&sports, &mut stats).await?;

        let enabled: Vec<(String, i64)> = competitions
            .iter()
            .filter(|c| c.enabled)
            .map(|c| (c.exchange_id.clone(), c.db_id))
            .collect();
        let event_ids = self.discover_events(&enabled, &mut stats).await?;

        self.discover_markets(&event_ids, &mut stats).await?;

        stats.stale_events_closed = self.db.mark_stale_events(Utc::now() - Duration::hours(4))?;

        info!(
            sports = stats.sports,
            competitions = stats.competitions,
            excluded = stats.competitions_excluded,
            events = stats.events,
            markets = stats.markets,
            runners = stats.runners,
            stale_closed = stats.stale_events_closed,
            "discovery_complete"
        );
        Ok(stats)
    }

    fn discover_sports(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let mut sports = Vec::new();
        for name in &self.enabled_sports {
            let Some(exchange_id) = sport_exchange_id(name) else {
                continue;
            };
            // Title-case for display; the exchange id is what matters.
            let mut display = name.clone();
            if let Some(first) = display.get_mut(..1) {
                first.make_ascii_uppercase();
            }
            let db_id = self.db.upsert_sport(exchange_id, &display, true)?;
            sports.push((exchange_id.to_string(), db_id));
        }
        Ok(sports)
    }

    async fn discover_competitions(
        &self,
        sports: &[(String, i64)],
        stats: &mut DiscoveryStats,
    ) -> anyhow::Result<Vec<DiscoveredCompetition>> {
        let sport_ids: Vec<String> = sports.iter().map(|(id, _)| id.clone()).collect();
        let default_sport = sports.first().map(|(_, id)| *id).unwrap_or(1);

        let records = self.client.list_competitions(Some(&sport_ids), None).await?;

        let mut competitions = Vec::with_capacity(records.len());
        for record in records {
            let excluded = should_exclude_competition(&record.name, &self.exclusion_patterns);
            let tier = if excluded { "excluded" } else { "active" };
            let db_id = self.db.upsert_competition(
                &record.id,
                default_sport,
                &record.name,
                record.region.as_deref(),
                !excluded,
                tier,
            )?;
            if excluded {
                stats.competitions_excluded += 1;
            } else {
                stats.competitions += 1;
            }
            competitions.push(DiscoveredCompetition {
                exchange_id: record.id,
                db_id,
                enabled: !excluded,
            });
        }
        Ok(competitions)
    }

    async fn discover_events(
        &self,
        competitions: &[(String, i64)],
        stats: &mut DiscoveryStats,
    ) -> anyhow::Result<Vec<String>> {
        let now = Utc::now();
        let to = now + Duration::hours(self.lookahead_hours);
        let comp_map: HashMap<&str, i64> =
            competitions.iter().map(|(id, db_id)| (id.as_str(), *db_id)).collect();

        let mut event_ids = Vec::new();

        // Competition ids go up in batches to keep request payloads sane.
        for batch in competitions.chunks(20) {
            let ids: Vec<String> = batch.iter().map(|(id, _)| id.clone()).collect();
            let records = self
                .client
                .list_events(Some(&ids), None, Some(now), Some(to))
                .await?;

            // The response does not echo which competition each event came
            // from; all of this batch's events belong to this batch, and the
            // catalogue pass re-links markets precisely by event id.
            let fallback_comp = ids
                .first()
                .and_then(|id| comp_map.get(id.as_str()))
                .copied()
                .unwrap_or(1);

            for record in records {
                let start = record.open_date.unwrap_or(now);
                self.db
                    .upsert_event(&record.id, fallback_comp, &record.name, start)?;
                stats.events += 1;
                event_ids.push(record.id);
            }
        }
        Ok(event_ids)
    }

    async fn discover_markets(
        &self,
        event_ids: &[String],
        stats: &mut DiscoveryStats,
    ) -> anyhow::Result<()> {
        for batch in event_ids.chunks(50) {
            let ids: Vec<String> = batch.to_vec();
            let records = self
                .client
                .list_market_catalogue(Some(&ids), None, Some(&self.market_types), 200)
                .await?;

            for record in records {
                let Some(event_db_id) = self.db.event_id_by_exchange_id(&record.event_id)? else {
                    continue;
                };
                let market_id = self.db.upsert_market(
                    &record.market_id,
                    event_db_id,
                    &record.market_name,
                    &record.market_type,
                    record.total_matched,
                )?;
                stats.markets += 1;

                for runner in &record.runners {
                    self.db.upsert_runner(
                        runner.selection_id,
                        market_id,
                        &runner.name,
                        Some(runner.sort_priority),
                    )?;
                    stats.runners += 1;
                }
            }
        }
        Ok(())
    }
}

struct DiscoveredCompetition {
    exchange_id: String,
    db_id: i64,
    enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_exclusion_patterns;

    #[test]
    fn youth_and_friendly_competitions_are_excluded() {
        let patterns = default_exclusion_patterns();
        for name in [
            "Club Friendlies",
            "International Friendly Matches",
            "English U21 Development League",
            "Spanish Segunda B U19",
            "Serie A Women",
            "Bundesliga Reserve League",
            "Sunday Amateur Cup",
        ] {
            assert!(should_exclude_competition(name, &patterns), "{name} should be excluded");
        }
    }

    #[test]
    fn top_leagues_are_not_name_excluded() {
        // Efficiency filtering is the volume penalty's job, not discovery's.
        let patterns = default_exclusion_patterns();
        for name in [
            "English Premier League",
            "UEFA Champions League",
            "Spanish La Liga",
            "Portuguese Segunda Liga",
        ] {
            assert!(!should_exclude_competition(name, &patterns), "{name} should be ingested");
        }
    }

    #[test]
    fn exclusion_is_case_insensitive() {
        let patterns = default_exclusion_patterns();
        assert!(should_exclude_competition("CLUB FRIENDLIES", &patterns));
        assert!(should_exclude_competition("premier league womEN", &patterns));
    }

    #[test]
    fn sport_ids_map() {
        assert_eq!(sport_exchange_id("soccer"), Some("1"));
        assert_eq!(sport_exchange_id("Tennis"), Some("2"));
        assert_eq!(sport_exchange_id("esports"), None);
    }
}
