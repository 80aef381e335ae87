//! Session-token lifecycle for the exchange identity service.
//!
//! Two login paths exist: certificate login (used whenever a client
//! certificate is configured, no interactive challenge) and interactive
//! login as the fallback. Tokens live for four hours in-process and in the
//! backing token store; a single writer refreshes at a time while readers
//! see the cached value.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Settings;

const CERT_LOGIN_URL: &str = "https://identitysso-cert.betfair.com/api/certlogin";
const INTERACTIVE_LOGIN_URL: &str = "https://identitysso.betfair.com/api/login";
const LOGOUT_URL: &str = "https://identitysso.betfair.com/api/logout";
const KEEPALIVE_URL: &str = "https://identitysso.betfair.com/api/keepAlive";

/// Tokens are refreshed half-way through their upstream 8 h lifetime.
pub const TOKEN_TTL: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug)]
pub struct AuthError(pub String);

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "authentication failed: {}", self.0)
    }
}

impl std::error::Error for AuthError {}

/// How to authenticate. Chosen once at construction from the presence of a
/// certificate path in configuration.
#[derive(Debug, Clone)]
pub enum LoginMethod {
    Certificate { cert_path: String, key_path: String },
    Interactive,
}

impl LoginMethod {
    pub fn from_settings(settings: &Settings) -> Self {
        match &settings.exchange_cert_path {
            Some(cert_path) => {
                let key_path = settings
                    .exchange_cert_key_path
                    .clone()
                    .unwrap_or_else(|| cert_path.replace(".crt", ".key"));
                LoginMethod::Certificate {
                    cert_path: cert_path.clone(),
                    key_path,
                }
            }
            None => LoginMethod::Interactive,
        }
    }
}

/// Shared cache seam for the session token. The in-memory store is the
/// production implementation here; get/put errors are survivable (the
/// manager falls back to a fresh login).
pub trait TokenStore: Send + Sync {
    fn get(&self) -> anyhow::Result<Option<(String, DateTime<Utc>)>>;
    fn put(&self, token: &str, expires_at: DateTime<Utc>) -> anyhow::Result<()>;
    fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> anyhow::Result<Option<(String, DateTime<Utc>)>> {
        Ok(self.slot.lock().clone())
    }

    fn put(&self, token: &str, expires_at: DateTime<Utc>) -> anyhow::Result<()> {
        *self.slot.lock() = Some((token.to_string(), expires_at));
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct LoginResponse {
    #[serde(rename = "loginStatus", default)]
    login_status: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "sessionToken", default)]
    session_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct SessionManager {
    app_key: String,
    username: String,
    password: String,
    method: LoginMethod,
    store: Arc<dyn TokenStore>,
    /// Serialises login attempts so only one writer refreshes at a time.
    login_lock: tokio::sync::Mutex<()>,
    cached: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl SessionManager {
    pub fn new(settings: &Settings, store: Arc<dyn TokenStore>) -> Self {
        Self {
            app_key: settings.exchange_app_key.clone(),
            username: settings.exchange_username.clone(),
            password: settings.exchange_password.clone(),
            method: LoginMethod::from_settings(settings),
            store,
            login_lock: tokio::sync::Mutex::new(()),
            cached: Mutex::new(None),
        }
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Current session token, refreshing if expired or absent.
    pub async fn session_token(&self) -> anyhow::Result<String> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        self.login().await
    }

    fn cached_token(&self) -> Option<String> {
        let cached = self.cached.lock();
        match cached.as_ref() {
            Some((token, expiry)) if Utc::now() < *expiry => Some(token.clone()),
            _ => None,
        }
    }

    /// Authenticate and cache the token. Checks the shared store first so a
    /// token refreshed elsewhere in the process is reused.
    pub async fn login(&self) -> anyhow::Result<String> {
        let _guard = self.login_lock.lock().await;

        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        match self.store.get() {
            Ok(Some((token, expiry))) if Utc::now() < expiry => {
                debug!("using_cached_session_token");
                *self.cached.lock() = Some((token.clone(), expiry));
                return Ok(token);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "token_store_get_error"),
        }

        let token = match &self.method {
            LoginMethod::Certificate { cert_path, key_path } => {
                self.cert_login(cert_path, key_path).await?
            }
            LoginMethod::Interactive => self.interactive_login().await?,
        };

        let expiry = Utc::now() + chrono::Duration::from_std(TOKEN_TTL).unwrap();
        *self.cached.lock() = Some((token.clone(), expiry));
        if let Err(e) = self.store.put(&token, expiry) {
            warn!(error = %e, "token_store_put_error");
        }

        info!("exchange_login_success");
        Ok(token)
    }

    /// Invalidate the current session upstream and locally.
    pub async fn logout(&self) {
        let token = {
            let cached = self.cached.lock();
            cached.as_ref().map(|(t, _)| t.clone())
        };
        if let Some(token) = token {
            let client = reqwest::Client::new();
            let result = client
                .post(LOGOUT_URL)
                .header("X-Application", &self.app_key)
                .header("X-Authentication", &token)
                .send()
                .await;
            if let Err(e) = result {
                warn!(error = %e, "logout_error");
            }
        }
        *self.cached.lock() = None;
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "token_store_clear_error");
        }
        info!("exchange_logout");
    }

    /// Extend the current session. Returns false when the session could not
    /// be extended (the next request will re-login).
    pub async fn keep_alive(&self) -> bool {
        let token = match self.session_token().await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "keepalive_no_session");
                return false;
            }
        };

        let client = reqwest::Client::new();
        let response = client
            .post(KEEPALIVE_URL)
            .header("X-Application", &self.app_key)
            .header("X-Authentication", &token)
            .header("Accept", "application/json")
            .send()
            .await;

        match response {
            Ok(resp) => match resp.json::<serde_json::Value>().await {
                Ok(data) if data.get("status").and_then(|s| s.as_str()) == Some("SUCCESS") => {
                    let expiry = Utc::now() + chrono::Duration::from_std(TOKEN_TTL).unwrap();
                    *self.cached.lock() = Some((token.clone(), expiry));
                    if let Err(e) = self.store.put(&token, expiry) {
                        warn!(error = %e, "token_store_put_error");
                    }
                    debug!("keepalive_success");
                    true
                }
                Ok(data) => {
                    warn!(response = %data, "keepalive_rejected");
                    false
                }
                Err(e) => {
                    error!(error = %e, "keepalive_parse_error");
                    false
                }
            },
            Err(e) => {
                error!(error = %e, "keepalive_error");
                false
            }
        }
    }

    async fn cert_login(&self, cert_path: &str, key_path: &str) -> anyhow::Result<String> {
        let mut pem = tokio::fs::read(cert_path).await?;
        let mut key = tokio::fs::read(key_path).await?;
        pem.append(&mut key);
        let identity = reqwest::Identity::from_pem(&pem)?;

        let client = reqwest::Client::builder()
            .identity(identity)
            .timeout(Duration::from_secs(30))
            .build()?;

        let response = client
            .post(CERT_LOGIN_URL)
            .header("X-Application", &self.app_key)
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await
            .map_err(|e| AuthError(format!("certificate login request failed: {e}")))?;

        let data: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError(format!("certificate login response unreadable: {e}")))?;
        parse_login_response(data)
    }

    async fn interactive_login(&self) -> anyhow::Result<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let response = client
            .post(INTERACTIVE_LOGIN_URL)
            .header("X-Application", &self.app_key)
            .header("Accept", "application/json")
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await
            .map_err(|e| AuthError(format!("interactive login request failed: {e}")))?;

        let data: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError(format!("interactive login response unreadable: {e}")))?;
        parse_login_response(data)
    }
}

fn parse_login_response(data: LoginResponse) -> anyhow::Result<String> {
    let status = data.login_status.as_deref().or(data.status.as_deref());
    if status == Some("SUCCESS") {
        if let Some(token) = data.session_token.or(data.token) {
            return Ok(token);
        }
        return Err(AuthError("no token in successful response".to_string()).into());
    }
    let reason = data
        .error
        .or(data.login_status)
        .unwrap_or_else(|| "unknown error".to_string());
    Err(AuthError(reason).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_cert(cert: Option<&str>, key: Option<&str>) -> Settings {
        Settings {
            database_path: ":memory:".into(),
            exchange_app_key: "key".into(),
            exchange_username: "user".into(),
            exchange_password: "pass".into(),
            exchange_cert_path: cert.map(String::from),
            exchange_cert_key_path: key.map(String::from),
            enabled_sports: vec!["soccer".into()],
            enabled_market_types: vec!["MATCH_ODDS".into()],
            lookahead_hours: 72,
            ladder_depth: 3,
            snapshot_batch_size: 5,
            snapshot_interval_secs: 300,
        }
    }

    #[test]
    fn certificate_method_preferred_when_configured() {
        let settings = settings_with_cert(Some("/certs/client.crt"), None);
        match LoginMethod::from_settings(&settings) {
            LoginMethod::Certificate { cert_path, key_path } => {
                assert_eq!(cert_path, "/certs/client.crt");
                assert_eq!(key_path, "/certs/client.key");
            }
            LoginMethod::Interactive => panic!("expected certificate login"),
        }
    }

    #[test]
    fn interactive_without_cert() {
        let settings = settings_with_cert(None, None);
        assert!(matches!(
            LoginMethod::from_settings(&settings),
            LoginMethod::Interactive
        ));
    }

    #[test]
    fn login_response_token_fallbacks() {
        let ok = LoginResponse {
            login_status: Some("SUCCESS".into()),
            status: None,
            session_token: Some("tok".into()),
            token: None,
            error: None,
        };
        assert_eq!(parse_login_response(ok).unwrap(), "tok");

        let alt = LoginResponse {
            login_status: None,
            status: Some("SUCCESS".into()),
            session_token: None,
            token: Some("tok2".into()),
            error: None,
        };
        assert_eq!(parse_login_response(alt).unwrap(), "tok2");

        let bad = LoginResponse {
            login_status: Some("INVALID_USERNAME_OR_PASSWORD".into()),
            status: None,
            session_token: None,
            token: None,
            error: None,
        };
        assert!(parse_login_response(bad).is_err());
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryTokenStore::default();
        assert!(store.get().unwrap().is_none());
        let expiry = Utc::now() + chrono::Duration::hours(4);
        store.put("tok", expiry).unwrap();
        let (token, stored_expiry) = store.get().unwrap().unwrap();
        assert_eq!(token, "tok");
        assert_eq!(stored_expiry, expiry);
        store.clear().unwrap();
        assert!(store.get().unwrap().is_none());
    }
}
