//! Exchange betting API client.
//!
//! Wraps the six endpoints the pipeline needs behind typed records, with
//! rate limiting, session management and classified retry. Callers see
//! either a domain record or an `ApiError` whose kind tells them what to do
//! next (shrink the batch, prune ids, or just log and move on).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::auth::SessionManager;
use super::error::{classify_error_code, ApiError, ApiErrorKind};
use super::rate_limiter::RateLimiter;
use super::types::*;

const BETTING_API_URL: &str = "https://api.betfair.com/exchange/betting/rest/v1.0";
const MAX_RETRIES: u32 = 3;

pub struct ExchangeClient {
    http: reqwest::Client,
    auth: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    base_url: String,
}

impl ExchangeClient {
    pub fn new(auth: Arc<SessionManager>, limiter: Arc<RateLimiter>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("RidgeRadar/0.1 (market observation)")
            .build()
            .expect("HTTP client construction cannot fail with static config");
        Self {
            http,
            auth,
            limiter,
            base_url: BETTING_API_URL.to_string(),
        }
    }

    /// Make one API request with rate limiting, auth and classified retry.
    async fn request(
        &self,
        endpoint: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/{}/", self.base_url, endpoint);

        for attempt in 0..=MAX_RETRIES {
            self.limiter.wait_if_needed(endpoint).await;

            let token = self.auth.session_token().await?;

            let response = match self
                .http
                .post(&url)
                .json(&params)
                .header("X-Application", self.auth.app_key())
                .header("X-Authentication", &token)
                .header("Accept", "application/json")
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    if attempt < MAX_RETRIES {
                        let wait = 2u64.pow(attempt);
                        warn!(endpoint, attempt, wait_secs = wait, "timeout_retrying");
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                        continue;
                    }
                    return Err(
                        ApiError::new(ApiErrorKind::Timeout, "request timeout", true).into()
                    );
                }
                Err(e) => {
                    return Err(ApiError::new(ApiErrorKind::Unknown, e.to_string(), false).into())
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                if attempt < MAX_RETRIES {
                    let wait = 2u64.pow(attempt);
                    warn!(endpoint, attempt, wait_secs = wait, "rate_limited_retrying");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                return Err(ApiError::new(ApiErrorKind::RateLimited, "rate limited", true).into());
            }
            if status.as_u16() == 400 {
                let text = response.text().await.unwrap_or_default();
                warn!(endpoint, body = %text.chars().take(200).collect::<String>(), "bad_request");
                return Err(ApiError::new(
                    ApiErrorKind::InvalidInput,
                    format!("400 Bad Request: {}", text.chars().take(200).collect::<String>()),
                    false,
                )
                .into());
            }
            if status.is_server_error() {
                if attempt < MAX_RETRIES {
                    let wait = 2u64.pow(attempt);
                    warn!(endpoint, attempt, status = status.as_u16(), "server_error_retrying");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                return Err(ApiError::new(
                    ApiErrorKind::ServiceUnavailable,
                    format!("server error: {status}"),
                    true,
                )
                .into());
            }

            let data: serde_json::Value = response.json().await.map_err(|e| {
                ApiError::new(ApiErrorKind::Unknown, format!("unreadable response: {e}"), false)
            })?;

            // API-level errors arrive as a JSON object with an error block
            // even on HTTP 200.
            if let Some(err) = data.as_object().and_then(|o| o.get("error")) {
                let code = err
                    .get("code")
                    .and_then(|c| c.as_str())
                    .unwrap_or("UNKNOWN")
                    .to_string();
                let message = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                let (kind, retryable) = classify_error_code(&code);

                if kind == ApiErrorKind::InvalidSession {
                    warn!(endpoint, attempt, "session_invalid_reauthenticating");
                    self.auth.logout().await;
                    self.auth.login().await?;
                    continue;
                }

                if retryable && attempt < MAX_RETRIES {
                    let wait = 2u64.pow(attempt);
                    warn!(endpoint, code = %code, attempt, wait_secs = wait, "api_error_retrying");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }

                return Err(ApiError::new(kind, message, retryable).into());
            }

            return Ok(data);
        }

        Err(ApiError::new(ApiErrorKind::Unknown, "retries exhausted", false).into())
    }

    /// Fetch all sports / event types.
    pub async fn list_event_types(&self) -> anyhow::Result<Vec<EventTypeRecord>> {
        let data = self.request("listEventTypes", json!({"filter": {}})).await?;
        let wire: Vec<WireEventTypeEnvelope> = serde_json::from_value(data)?;
        Ok(wire.into_iter().map(EventTypeRecord::from).collect())
    }

    /// Fetch competitions, optionally filtered by sport and country.
    pub async fn list_competitions(
        &self,
        sport_ids: Option<&[String]>,
        country_codes: Option<&[String]>,
    ) -> anyhow::Result<Vec<CompetitionRecord>> {
        let mut filter = serde_json::Map::new();
        if let Some(ids) = sport_ids {
            filter.insert("eventTypeIds".into(), json!(ids));
        }
        if let Some(codes) = country_codes {
            filter.insert("marketCountries".into(), json!(codes));
        }

        let data = self
            .request("listCompetitions", json!({ "filter": filter }))
            .await?;
        let wire: Vec<WireCompetitionEnvelope> = serde_json::from_value(data)?;
        let competitions: Vec<CompetitionRecord> =
            wire.into_iter().map(CompetitionRecord::from).collect();
        debug!(count = competitions.len(), "competitions_fetched");
        Ok(competitions)
    }

    /// Fetch events within a time window.
    pub async fn list_events(
        &self,
        competition_ids: Option<&[String]>,
        sport_ids: Option<&[String]>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<EventRecord>> {
        let mut filter = serde_json::Map::new();
        if let Some(ids) = competition_ids {
            filter.insert("competitionIds".into(), json!(ids));
        }
        if let Some(ids) = sport_ids {
            filter.insert("eventTypeIds".into(), json!(ids));
        }
        if from.is_some() || to.is_some() {
            let mut window = serde_json::Map::new();
            if let Some(from) = from {
                window.insert("from".into(), json!(from.to_rfc3339()));
            }
            if let Some(to) = to {
                window.insert("to".into(), json!(to.to_rfc3339()));
            }
            filter.insert("marketStartTime".into(), serde_json::Value::Object(window));
        }

        let data = self.request("listEvents", json!({ "filter": filter })).await?;
        let wire: Vec<WireEventEnvelope> = serde_json::from_value(data)?;
        Ok(wire.into_iter().map(EventRecord::from).collect())
    }

    /// Fetch market metadata including runner descriptions.
    pub async fn list_market_catalogue(
        &self,
        event_ids: Option<&[String]>,
        competition_ids: Option<&[String]>,
        market_types: Option<&[String]>,
        max_results: usize,
    ) -> anyhow::Result<Vec<MarketCatalogueRecord>> {
        let mut filter = serde_json::Map::new();
        if let Some(ids) = event_ids {
            filter.insert("eventIds".into(), json!(ids));
        }
        if let Some(ids) = competition_ids {
            filter.insert("competitionIds".into(), json!(ids));
        }
        if let Some(types) = market_types {
            filter.insert("marketTypeCodes".into(), json!(types));
        }

        let data = self
            .request(
                "listMarketCatalogue",
                json!({
                    "filter": filter,
                    "maxResults": max_results.to_string(),
                    "marketProjection": [
                        "EVENT",
                        "COMPETITION",
                        "RUNNER_DESCRIPTION",
                        "MARKET_DESCRIPTION",
                    ],
                }),
            )
            .await?;
        let wire: Vec<WireMarketCatalogue> = serde_json::from_value(data)?;
        Ok(wire.into_iter().map(MarketCatalogueRecord::from).collect())
    }

    /// Fetch live prices and depth for a batch of markets.
    pub async fn list_market_book(
        &self,
        market_ids: &[String],
        price_depth: usize,
    ) -> anyhow::Result<Vec<MarketBook>> {
        let data = self
            .request(
                "listMarketBook",
                json!({
                    "marketIds": market_ids,
                    "priceProjection": {
                        "priceData": ["EX_BEST_OFFERS", "EX_TRADED"],
                        "exBestOffersOverrides": {
                            "bestPricesDepth": price_depth,
                        },
                    },
                }),
            )
            .await?;
        let wire: Vec<WireMarketBook> = serde_json::from_value(data)?;
        Ok(wire.into_iter().map(MarketBook::from).collect())
    }

    /// True when the API answers a cheap catalogue request.
    pub async fn health_check(&self) -> bool {
        match self.list_event_types().await {
            Ok(types) => {
                info!(sports = types.len(), "exchange_health_ok");
                true
            }
            Err(e) => {
                error!(error = %e, "exchange_health_check_failed");
                false
            }
        }
    }
}
