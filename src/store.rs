//! Persistent store seams for linked accounts and model routes.
//!
//! The gateway only needs CRUD-style access, so both stores are small
//! synchronous traits. [`JsonFileAccountStore`] keeps accounts in a JSON array
//! on disk; the memory stores back tests and config-seeded routes.

use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub email: String,
    #[serde(default = "default_account_provider")]
    pub provider: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub last_used_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_primary: bool,
    /// Provider-specific extras, e.g. `{"project_id": "..."}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn default_account_provider() -> String {
    "google".to_string()
}

fn default_true() -> bool {
    true
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Account {
    pub fn project_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("project_id"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

pub trait AccountStore: Send + Sync {
    fn list(&self) -> Result<Vec<Account>>;
    fn get(&self, id: &str) -> Result<Option<Account>>;
    fn find_by_email(&self, email: &str) -> Result<Option<Account>>;
    /// Insert or replace by id. Saving a primary account demotes every other one.
    fn save(&self, account: &Account) -> Result<()>;
}

fn upsert(accounts: &mut Vec<Account>, account: &Account) {
    if account.is_primary {
        for other in accounts.iter_mut().filter(|a| a.id != account.id) {
            other.is_primary = false;
        }
    }
    match accounts.iter_mut().find(|a| a.id == account.id) {
        Some(existing) => *existing = account.clone(),
        None => accounts.push(account.clone()),
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<Vec<Account>>,
}

impl MemoryAccountStore {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            accounts: RwLock::new(accounts),
        }
    }
}

impl AccountStore for MemoryAccountStore {
    fn list(&self) -> Result<Vec<Account>> {
        Ok(self.accounts.read().clone())
    }

    fn get(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.read().iter().find(|a| a.id == id).cloned())
    }

    fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .read()
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    fn save(&self, account: &Account) -> Result<()> {
        upsert(&mut self.accounts.write(), account);
        Ok(())
    }
}

/// Accounts persisted as a pretty-printed JSON array. Every write goes through a
/// temp file and a rename so a crash never leaves a truncated file behind.
pub struct JsonFileAccountStore {
    path: PathBuf,
    accounts: RwLock<Vec<Account>>,
}

impl JsonFileAccountStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let accounts = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                GatewayError::config(format!(
                    "Failed to read accounts file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            tracing::warn!(path = %path.display(), "Accounts file not found, starting with no accounts");
            Vec::new()
        };

        Ok(Self {
            path,
            accounts: RwLock::new(accounts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, accounts: &[Account]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(accounts)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl AccountStore for JsonFileAccountStore {
    fn list(&self) -> Result<Vec<Account>> {
        Ok(self.accounts.read().clone())
    }

    fn get(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.read().iter().find(|a| a.id == id).cloned())
    }

    fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .read()
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    fn save(&self, account: &Account) -> Result<()> {
        let mut accounts = self.accounts.write();
        let mut next = accounts.clone();
        upsert(&mut next, account);
        self.persist(&next)?;
        *accounts = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Model routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelRoute {
    #[serde(default)]
    pub id: u64,
    pub client_model: String,
    #[serde(default = "default_account_provider")]
    pub target_provider: String,
    pub target_model: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

pub trait RouteStore: Send + Sync {
    fn list(&self) -> Result<Vec<ModelRoute>>;
    fn get(&self, id: u64) -> Result<Option<ModelRoute>>;
    /// Assigns and returns a fresh id. `(client_model, target_provider)` is unique.
    fn insert(&self, route: ModelRoute) -> Result<ModelRoute>;
    fn update(&self, route: &ModelRoute) -> Result<()>;
    fn delete(&self, id: u64) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryRouteStore {
    inner: RwLock<RouteTable>,
}

#[derive(Default)]
struct RouteTable {
    routes: Vec<ModelRoute>,
    next_id: u64,
}

impl MemoryRouteStore {
    /// Seed the store; seed ids are reassigned in order.
    pub fn seeded(routes: impl IntoIterator<Item = ModelRoute>) -> Result<Self> {
        let store = Self::default();
        for route in routes {
            store.insert(route)?;
        }
        Ok(store)
    }
}

fn conflicts(table: &RouteTable, route: &ModelRoute) -> bool {
    table.routes.iter().any(|r| {
        r.id != route.id
            && r.client_model == route.client_model
            && r.target_provider == route.target_provider
    })
}

impl RouteStore for MemoryRouteStore {
    fn list(&self) -> Result<Vec<ModelRoute>> {
        Ok(self.inner.read().routes.clone())
    }

    fn get(&self, id: u64) -> Result<Option<ModelRoute>> {
        Ok(self.inner.read().routes.iter().find(|r| r.id == id).cloned())
    }

    fn insert(&self, mut route: ModelRoute) -> Result<ModelRoute> {
        let mut table = self.inner.write();
        route.id = 0;
        if conflicts(&table, &route) {
            return Err(GatewayError::validation(format!(
                "route for {} via {} already exists",
                route.client_model, route.target_provider
            )));
        }
        table.next_id += 1;
        route.id = table.next_id;
        table.routes.push(route.clone());
        Ok(route)
    }

    fn update(&self, route: &ModelRoute) -> Result<()> {
        let mut table = self.inner.write();
        if conflicts(&table, route) {
            return Err(GatewayError::validation(format!(
                "route for {} via {} already exists",
                route.client_model, route.target_provider
            )));
        }
        match table.routes.iter_mut().find(|r| r.id == route.id) {
            Some(existing) => {
                *existing = route.clone();
                Ok(())
            }
            None => Err(GatewayError::validation(format!(
                "model route {} not found",
                route.id
            ))),
        }
    }

    fn delete(&self, id: u64) -> Result<()> {
        let mut table = self.inner.write();
        let before = table.routes.len();
        table.routes.retain(|r| r.id != id);
        if table.routes.len() == before {
            return Err(GatewayError::validation(format!("model route {} not found", id)));
        }
        Ok(())
    }
}
