//! Authenticated, rate-limited, retrying client over the exchange betting
//! API. Owns the session-token lifecycle.

pub mod auth;
pub mod client;
pub mod error;
pub mod rate_limiter;
pub mod types;

pub use auth::{LoginMethod, MemoryTokenStore, SessionManager, TokenStore};
pub use client::ExchangeClient;
pub use error::{ApiError, ApiErrorKind};
pub use rate_limiter::{RateLimiter, DEFAULT_BURST, DEFAULT_RATE};
pub use types::{
    CompetitionRecord, EventRecord, EventTypeRecord, MarketBook, MarketCatalogueRecord, PriceSize,
    RunnerBook, RunnerRecord,
};
