//! Credential lifecycle for linked backend accounts.
//!
//! [`CredentialManager`] keeps an in-memory cache of every active account's
//! access token, selects credentials for requests, and refreshes them through a
//! [`TokenRefresher`]. The cache lock is only held for map updates; refresh
//! network calls always happen outside it.

use crate::error::{GatewayError, Result};
use crate::store::{Account, AccountStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_stream::wrappers::IntervalStream;

/// Tokens expiring sooner than this are refreshed before use.
const USE_MARGIN_SECS: i64 = 60;

/// Error text fragments that mean the grant itself is dead.
const PERMANENT_MARKERS: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "token has been expired or revoked",
    "revoked",
];

#[derive(Debug, Clone, Serialize)]
pub struct CachedCredential {
    pub account_id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub project_id: String,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_primary: bool,
}

impl CachedCredential {
    fn from_account(account: &Account, default_project_id: &str) -> Self {
        Self {
            account_id: account.id.clone(),
            email: account.email.clone(),
            access_token: account.access_token.clone(),
            refresh_token: account.refresh_token.clone(),
            project_id: account
                .project_id()
                .unwrap_or(default_project_id)
                .to_string(),
            expires_at: account.expires_at,
            last_used_at: account.last_used_at,
            is_active: account.is_active,
            is_primary: account.is_primary,
        }
    }

    pub fn expires_within(&self, window: Duration) -> bool {
        self.expires_at <= Utc::now() + window
    }
}

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Present when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshFailure {
    /// Revoked or invalid grant. The account is deactivated.
    Permanent,
    /// Timeouts, rate limits, network trouble. The account stays eligible.
    Transient,
}

pub fn classify_refresh_error(message: &str) -> RefreshFailure {
    let lower = message.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        RefreshFailure::Permanent
    } else {
        RefreshFailure::Transient
    }
}

#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Refreshed(CachedCredential),
    Failed {
        kind: RefreshFailure,
        message: String,
    },
}

/// Admin view of a stored account. Never carries token values.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub id: String,
    pub email: String,
    pub project_id: Option<String>,
    pub is_active: bool,
    pub is_primary: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    pub attempted: usize,
    pub refreshed: usize,
    pub permanent_failures: usize,
    pub transient_failures: usize,
}

pub struct CredentialManager {
    store: Arc<dyn AccountStore>,
    refresher: Arc<dyn TokenRefresher>,
    cache: RwLock<HashMap<String, CachedCredential>>,
    /// One refresh in flight per account.
    refresh_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    default_project_id: String,
    refresh_window: Duration,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn AccountStore>,
        refresher: Arc<dyn TokenRefresher>,
        default_project_id: impl Into<String>,
        refresh_window: Duration,
    ) -> Result<Self> {
        let manager = Self {
            store,
            refresher,
            cache: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            default_project_id: default_project_id.into(),
            refresh_window,
        };
        manager.reload()?;
        Ok(manager)
    }

    /// Rebuild the cache from the store's active accounts.
    pub fn reload(&self) -> Result<()> {
        let accounts = self.store.list()?;
        let mut cache = HashMap::with_capacity(accounts.len());
        let mut primary_seen = false;
        for account in accounts.iter().filter(|a| a.is_active) {
            let mut cred = CachedCredential::from_account(account, &self.default_project_id);
            if cred.is_primary {
                if primary_seen {
                    tracing::warn!(email = %cred.email, "Multiple primary accounts, ignoring extra primary flag");
                    cred.is_primary = false;
                }
                primary_seen = true;
            }
            cache.insert(cred.account_id.clone(), cred);
        }
        tracing::info!(accounts = cache.len(), "Loaded accounts into credential cache");
        *self.cache.write() = cache;
        Ok(())
    }

    /// Snapshot of cached credentials, for the admin surface.
    pub fn snapshot(&self) -> Vec<CachedCredential> {
        let mut creds: Vec<_> = self.cache.read().values().cloned().collect();
        creds.sort_by(|a, b| a.email.cmp(&b.email));
        creds
    }

    /// Every stored account, active or not.
    pub fn accounts(&self) -> Result<Vec<AccountSummary>> {
        let mut accounts: Vec<AccountSummary> = self
            .store
            .list()?
            .into_iter()
            .map(|a| AccountSummary {
                project_id: a.project_id().map(str::to_string),
                id: a.id,
                email: a.email,
                is_active: a.is_active,
                is_primary: a.is_primary,
                expires_at: a.expires_at,
            })
            .collect();
        accounts.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(accounts)
    }

    /// Primary account if it can produce a usable token, else the most recently
    /// used active account that can.
    pub async fn select_primary_or_default(&self) -> Result<CachedCredential> {
        let candidates: Vec<String> = {
            let cache = self.cache.read();
            let mut ordered: Vec<&CachedCredential> = cache.values().collect();
            ordered.sort_by(|a, b| {
                b.is_primary
                    .cmp(&a.is_primary)
                    .then(b.last_used_at.cmp(&a.last_used_at))
                    .then(a.account_id.cmp(&b.account_id))
            });
            ordered.iter().map(|c| c.account_id.clone()).collect()
        };

        for id in candidates {
            match self.token_for_account(&id).await {
                Ok(cred) => {
                    if cred.is_primary {
                        tracing::debug!(email = %cred.email, "Using primary credential");
                    } else {
                        tracing::info!(email = %cred.email, "Using fallback credential");
                    }
                    return Ok(cred);
                }
                Err(e) => {
                    tracing::warn!(account_id = %id, error = %e, "Credential unusable, trying next");
                }
            }
        }

        Err(GatewayError::NoValidCredential)
    }

    /// Explicit selection by email (first) or account id.
    pub async fn select_by_identifier(&self, identifier: &str) -> Result<CachedCredential> {
        let identifier = identifier.trim();
        let id = {
            let cache = self.cache.read();
            cache
                .values()
                .find(|c| c.email.eq_ignore_ascii_case(identifier))
                .or_else(|| cache.get(identifier))
                .map(|c| c.account_id.clone())
        };

        match id {
            Some(id) => self.token_for_account(&id).await,
            None => Err(GatewayError::AccountNotFound(identifier.to_string())),
        }
    }

    /// A usable credential for one account, refreshing first if it is about to expire.
    pub async fn token_for_account(&self, account_id: &str) -> Result<CachedCredential> {
        let cached = self.cache.read().get(account_id).cloned();
        let cred = match cached {
            Some(c) => c,
            None => {
                let account = self
                    .store
                    .get(account_id)?
                    .filter(|a| a.is_active)
                    .ok_or_else(|| GatewayError::AccountNotFound(account_id.to_string()))?;
                let cred = CachedCredential::from_account(&account, &self.default_project_id);
                self.cache
                    .write()
                    .insert(account_id.to_string(), cred.clone());
                tracing::info!(email = %cred.email, "Loaded account into cache on demand");
                cred
            }
        };

        if !cred.expires_within(Duration::seconds(USE_MARGIN_SECS)) {
            return Ok(cred);
        }

        let lock = self.refresh_lock(account_id);
        let _held = lock.lock().await;
        // A concurrent caller may have refreshed while this one waited.
        let current = self.cache.read().get(account_id).cloned();
        if let Some(current) = current.filter(|c| !c.expires_within(Duration::seconds(USE_MARGIN_SECS))) {
            return Ok(current);
        }

        tracing::warn!(email = %cred.email, "Token expired or expiring, refreshing");
        match self.refresh_locked(account_id).await? {
            RefreshOutcome::Refreshed(fresh)
                if !fresh.expires_within(Duration::seconds(USE_MARGIN_SECS)) =>
            {
                Ok(fresh)
            }
            RefreshOutcome::Refreshed(_) => Err(GatewayError::auth(format!(
                "token for {} is still expired after refresh",
                cred.email
            ))),
            RefreshOutcome::Failed { kind, message } => Err(GatewayError::auth(format!(
                "token refresh failed for {} ({:?}): {}",
                cred.email, kind, message
            ))),
        }
    }

    /// Refresh one account. Works on inactive accounts too, so a manual refresh
    /// can bring a deactivated account back.
    pub async fn refresh(&self, account_id: &str) -> Result<RefreshOutcome> {
        let lock = self.refresh_lock(account_id);
        let _held = lock.lock().await;
        self.refresh_locked(account_id).await
    }

    fn refresh_lock(&self, account_id: &str) -> Arc<AsyncMutex<()>> {
        self.refresh_locks
            .lock()
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }

    /// Caller holds the account's refresh lock.
    async fn refresh_locked(&self, account_id: &str) -> Result<RefreshOutcome> {
        let mut account = self
            .store
            .get(account_id)?
            .ok_or_else(|| GatewayError::AccountNotFound(account_id.to_string()))?;

        let result = self.refresher.refresh(&account.refresh_token).await;

        match result {
            Ok(token) => {
                account.access_token = token.access_token;
                account.expires_at = token.expires_at;
                account.last_used_at = Utc::now();
                account.is_active = true;
                if let Some(rotated) = token.refresh_token.filter(|r| !r.is_empty()) {
                    if rotated != account.refresh_token {
                        tracing::info!(email = %account.email, "Rotating refresh token");
                        account.refresh_token = rotated;
                    }
                }
                self.store.save(&account)?;

                let cred = CachedCredential::from_account(&account, &self.default_project_id);
                {
                    let mut cache = self.cache.write();
                    if cred.is_primary {
                        for other in cache.values_mut() {
                            other.is_primary = false;
                        }
                    }
                    cache.insert(account_id.to_string(), cred.clone());
                }
                tracing::info!(email = %account.email, expires_at = %cred.expires_at.to_rfc3339(), "Refreshed token");
                Ok(RefreshOutcome::Refreshed(cred))
            }
            Err(e) => {
                let message = e.to_string();
                let kind = classify_refresh_error(&message);
                tracing::error!(email = %account.email, error = %message, ?kind, "Token refresh failed");

                if kind == RefreshFailure::Permanent {
                    account.is_active = false;
                    self.store.save(&account)?;
                    self.cache.write().remove(account_id);
                    tracing::warn!(email = %account.email, "Account deactivated, re-login required");
                }
                Ok(RefreshOutcome::Failed { kind, message })
            }
        }
    }

    /// Refresh every active account expiring within the configured window.
    pub async fn refresh_all(&self) -> Result<RefreshSummary> {
        self.refresh_expiring(self.refresh_window).await
    }

    pub async fn refresh_expiring(&self, window: Duration) -> Result<RefreshSummary> {
        let due: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .filter(|a| a.is_active && a.expires_at < Utc::now() + window)
            .map(|a| a.id)
            .collect();

        let mut summary = RefreshSummary {
            attempted: due.len(),
            ..Default::default()
        };
        for id in due {
            match self.refresh(&id).await {
                Ok(RefreshOutcome::Refreshed(_)) => summary.refreshed += 1,
                Ok(RefreshOutcome::Failed {
                    kind: RefreshFailure::Permanent,
                    ..
                }) => summary.permanent_failures += 1,
                Ok(RefreshOutcome::Failed { .. }) => summary.transient_failures += 1,
                Err(e) => {
                    tracing::error!(account_id = %id, error = %e, "Refresh pass failed for account");
                    summary.transient_failures += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Periodic background refresh. The first pass runs one interval after start.
    pub fn spawn_refresh_loop(self: Arc<Self>, period: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tracing::info!(interval_secs = period.as_secs(), "Token refresh loop started");
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticks = IntervalStream::new(tokio::time::interval_at(start, period));
            while ticks.next().await.is_some() {
                match self.refresh_all().await {
                    Ok(summary) if summary.attempted > 0 => {
                        tracing::info!(?summary, "Scheduled token refresh finished");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Scheduled token refresh failed"),
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Google OAuth refresh
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct GoogleTokenRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl GoogleTokenRefresher {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }
}

#[async_trait]
impl TokenRefresher for GoogleTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken> {
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(ref secret) = self.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::auth(format!(
                "oauth2: cannot fetch token: {} {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in.unwrap_or(3600)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAccountStore;
    use std::collections::VecDeque;

    /// Refresher that replays scripted results and counts calls.
    struct ScriptedRefresher {
        results: Mutex<VecDeque<Result<RefreshedToken>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedRefresher {
        fn new(results: Vec<Result<RefreshedToken>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl TokenRefresher for ScriptedRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken> {
            *self.calls.lock() += 1;
            tokio::task::yield_now().await;
            self.results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::other("no scripted result")))
        }
    }

    fn fresh(token: &str) -> Result<RefreshedToken> {
        Ok(RefreshedToken {
            access_token: token.to_string(),
            refresh_token: Some("rotated".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    fn account(id: &str, expires_in_mins: i64, primary: bool) -> Account {
        Account {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            provider: "google".to_string(),
            access_token: format!("token-{}", id),
            refresh_token: format!("refresh-{}", id),
            expires_at: Utc::now() + Duration::minutes(expires_in_mins),
            last_used_at: Utc::now(),
            is_active: true,
            is_primary: primary,
            metadata: None,
        }
    }

    fn manager(
        accounts: Vec<Account>,
        refresher: Arc<ScriptedRefresher>,
    ) -> (CredentialManager, Arc<MemoryAccountStore>) {
        let store = Arc::new(MemoryAccountStore::new(accounts));
        let manager = CredentialManager::new(
            store.clone(),
            refresher,
            "bamboo-precept-lgxtn",
            Duration::minutes(20),
        )
        .unwrap();
        (manager, store)
    }

    #[test]
    fn test_classify_refresh_error() {
        assert_eq!(
            classify_refresh_error("oauth2: cannot fetch token: 400 {\"error\": \"invalid_grant\"}"),
            RefreshFailure::Permanent
        );
        assert_eq!(
            classify_refresh_error("Token has been expired or REVOKED."),
            RefreshFailure::Permanent
        );
        assert_eq!(
            classify_refresh_error("operation timed out"),
            RefreshFailure::Transient
        );
        assert_eq!(
            classify_refresh_error("429 Too Many Requests"),
            RefreshFailure::Transient
        );
    }

    #[tokio::test]
    async fn test_primary_preferred() {
        let refresher = ScriptedRefresher::new(vec![]);
        let (manager, _) = manager(
            vec![account("a", 60, false), account("b", 60, true)],
            refresher.clone(),
        );

        let cred = manager.select_primary_or_default().await.unwrap();
        assert_eq!(cred.account_id, "b");
        assert_eq!(cred.project_id, "bamboo-precept-lgxtn");
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_to_most_recently_used() {
        let mut older = account("old", 60, false);
        older.last_used_at = Utc::now() - Duration::days(1);
        let (manager, _) = manager(
            vec![older, account("recent", 60, false)],
            ScriptedRefresher::new(vec![]),
        );

        let cred = manager.select_primary_or_default().await.unwrap();
        assert_eq!(cred.account_id, "recent");
    }

    #[tokio::test]
    async fn test_no_active_accounts() {
        let mut inactive = account("a", 60, true);
        inactive.is_active = false;
        let (manager, _) = manager(vec![inactive], ScriptedRefresher::new(vec![]));

        let err = manager.select_primary_or_default().await.unwrap_err();
        assert!(matches!(err, GatewayError::NoValidCredential));
    }

    #[tokio::test]
    async fn test_select_by_identifier() {
        let (manager, _) = manager(
            vec![account("a", 60, false), account("b", 60, false)],
            ScriptedRefresher::new(vec![]),
        );

        assert_eq!(
            manager.select_by_identifier("B@example.com").await.unwrap().account_id,
            "b"
        );
        assert_eq!(manager.select_by_identifier("a").await.unwrap().account_id, "a");
        let err = manager.select_by_identifier("nobody").await.unwrap_err();
        assert!(matches!(err, GatewayError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_expiring_token_refreshed_on_use() {
        let refresher = ScriptedRefresher::new(vec![fresh("new-token")]);
        let (manager, store) = manager(vec![account("a", 0, true)], refresher.clone());

        let cred = manager.select_primary_or_default().await.unwrap();
        assert_eq!(cred.access_token, "new-token");
        assert_eq!(refresher.calls(), 1);

        let saved = store.get("a").unwrap().unwrap();
        assert_eq!(saved.access_token, "new-token");
        assert_eq!(saved.refresh_token, "rotated");
    }

    #[tokio::test]
    async fn test_concurrent_use_refreshes_once() {
        let refresher = ScriptedRefresher::new(vec![fresh("first"), fresh("second")]);
        let (manager, _store) = manager(vec![account("a", 0, true)], refresher.clone());

        let (left, right) = tokio::join!(
            manager.select_by_identifier("a@example.com"),
            manager.select_primary_or_default(),
        );
        assert_eq!(left.unwrap().access_token, "first");
        assert_eq!(right.unwrap().access_token, "first");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_deactivates() {
        let refresher = ScriptedRefresher::new(vec![Err(GatewayError::auth(
            "oauth2: cannot fetch token: 400 {\"error\":\"invalid_grant\"}",
        ))]);
        let (manager, store) = manager(vec![account("a", 60, true)], refresher);

        let outcome = manager.refresh("a").await.unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Failed {
                kind: RefreshFailure::Permanent,
                ..
            }
        ));
        assert!(!store.get("a").unwrap().unwrap().is_active);
        assert!(manager.snapshot().is_empty());
        assert!(matches!(
            manager.select_primary_or_default().await.unwrap_err(),
            GatewayError::NoValidCredential
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_account_active() {
        let refresher = ScriptedRefresher::new(vec![Err(GatewayError::upstream(
            "token endpoint unreachable: operation timed out",
        ))]);
        let (manager, store) = manager(vec![account("a", 60, true)], refresher);

        let outcome = manager.refresh("a").await.unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Failed {
                kind: RefreshFailure::Transient,
                ..
            }
        ));
        assert!(store.get("a").unwrap().unwrap().is_active);
        assert_eq!(manager.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_refresh_reactivates() {
        let mut dead = account("a", -5, false);
        dead.is_active = false;
        let (manager, store) = manager(vec![dead], ScriptedRefresher::new(vec![fresh("revived")]));
        assert!(manager.snapshot().is_empty());

        let outcome = manager.refresh("a").await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Refreshed(_)));
        assert!(store.get("a").unwrap().unwrap().is_active);
        assert_eq!(
            manager.select_by_identifier("a").await.unwrap().access_token,
            "revived"
        );
    }

    #[tokio::test]
    async fn test_refresh_all_only_touches_expiring_active_accounts() {
        let mut inactive = account("gone", 1, false);
        inactive.is_active = false;
        let refresher = ScriptedRefresher::new(vec![fresh("soon-new")]);
        let (manager, _) = manager(
            vec![account("soon", 5, false), account("later", 120, false), inactive],
            refresher.clone(),
        );

        let summary = manager.refresh_all().await.unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_reload_tracks_store() {
        let (manager, store) = manager(vec![account("a", 60, false)], ScriptedRefresher::new(vec![]));
        store.save(&account("b", 60, true)).unwrap();
        assert_eq!(manager.snapshot().len(), 1);

        manager.reload().unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.iter().filter(|c| c.is_primary).count(), 1);
    }

    #[test]
    fn test_accounts_lists_inactive_without_tokens() {
        let mut dead = account("zed", 60, false);
        dead.is_active = false;
        let (manager, _) = manager(vec![dead, account("amy", 60, true)], ScriptedRefresher::new(vec![]));

        let accounts = manager.accounts().unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].email, "amy@example.com");
        assert!(accounts[0].is_primary);
        assert!(!accounts[1].is_active);

        let json = serde_json::to_value(&accounts[0]).unwrap();
        assert!(json.get("access_token").is_none());
        tokio_test::assert_err!(tokio_test::block_on(manager.select_by_identifier("zed")));
    }
}
