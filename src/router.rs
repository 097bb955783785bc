//! Model routing: client model name -> (provider, target model).
//!
//! Routes come from a [`RouteStore`]; the router keeps the active ones in memory
//! and reloads after every mutation it performs. Provider choice is constrained
//! by the client model's naming prefix so a vendor-branded model name cannot be
//! silently pointed at an unrelated backend family.

use crate::config::{CompatProviderConfig, ModelScope, OPENAI_CHAT_CAPABILITY};
use crate::error::{GatewayError, Result};
use crate::store::{ModelRoute, RouteStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_PROVIDER: &str = "google";

/// Protocol family of an inbound endpoint, for provider compatibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteProtocol {
    OpenAi,
    GenAi,
    Anthropic,
}

impl RouteProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteProtocol::OpenAi => "openai",
            RouteProtocol::GenAi => "genai",
            RouteProtocol::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for RouteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteProtocol {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(RouteProtocol::OpenAi),
            "genai" => Ok(RouteProtocol::GenAi),
            "anthropic" => Ok(RouteProtocol::Anthropic),
            other => Err(GatewayError::validation(format!(
                "unsupported protocol \"{}\"",
                other
            ))),
        }
    }
}

/// Lower-case and trim a provider id. Empty means the default provider.
pub fn normalize_provider(provider: &str) -> String {
    let p = provider.trim().to_lowercase();
    if p.is_empty() {
        DEFAULT_PROVIDER.to_string()
    } else {
        p
    }
}

fn has_known_prefix(model: &str) -> bool {
    model.starts_with("gpt") || model.starts_with("gemini") || model.starts_with("claude")
}

fn merge_providers<'a>(
    base: &[&'a str],
    extras: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for provider in base.iter().copied().chain(extras) {
        let normalized = normalize_provider(provider);
        if !result.contains(&normalized) {
            result.push(normalized);
        }
    }
    result
}

/// Which providers a client model (or protocol) may be routed to.
#[derive(Debug, Clone, Default)]
pub struct ProviderPolicy {
    compat: Vec<CompatProviderConfig>,
}

impl ProviderPolicy {
    pub fn new(compat_providers: &[CompatProviderConfig]) -> Self {
        let mut compat: Vec<_> = compat_providers
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        compat.sort_by(|a, b| a.id.cmp(&b.id));
        Self { compat }
    }

    pub fn allowed_providers(&self, client_model: &str) -> Vec<String> {
        let model = client_model.trim().to_lowercase();
        let base: &[&str] = if model.starts_with("gpt") {
            &["codex", "google"]
        } else if model.starts_with("gemini") {
            &["google", "vertex", "gemini"]
        } else {
            &["google"]
        };

        let compat = self.compat.iter().filter(|p| match p.model_scope {
            ModelScope::AllModels => true,
            ModelScope::UnknownPrefixOnly => !has_known_prefix(&model),
        });
        merge_providers(base, compat.map(|p| p.id.as_str()))
    }

    pub fn allowed_providers_for_protocol(&self, protocol: RouteProtocol) -> Vec<String> {
        match protocol {
            RouteProtocol::OpenAi => {
                let compat = self
                    .compat
                    .iter()
                    .filter(|p| p.capabilities.iter().any(|c| c == OPENAI_CHAT_CAPABILITY));
                merge_providers(&["google", "codex"], compat.map(|p| p.id.as_str()))
            }
            RouteProtocol::GenAi => {
                merge_providers(&["google", "vertex", "gemini"], std::iter::empty())
            }
            RouteProtocol::Anthropic => merge_providers(&["google"], std::iter::empty()),
        }
    }

    pub fn validate_provider(&self, client_model: &str, provider: &str) -> Result<()> {
        let provider = normalize_provider(provider);
        let allowed = self.allowed_providers(client_model);
        if allowed.contains(&provider) {
            return Ok(());
        }
        Err(GatewayError::RouteNotAllowed {
            provider,
            client_model: client_model.to_string(),
            allowed,
        })
    }

    pub fn validate_for_protocol(&self, provider: &str, protocol: RouteProtocol) -> Result<()> {
        let provider = normalize_provider(provider);
        let allowed = self.allowed_providers_for_protocol(protocol);
        if allowed.contains(&provider) {
            return Ok(());
        }
        Err(GatewayError::validation(format!(
            "provider \"{}\" is not allowed for protocol \"{}\" (allowed: {})",
            provider,
            protocol,
            allowed.join(", ")
        )))
    }

    pub fn is_compat_provider(&self, provider: &str) -> bool {
        let provider = normalize_provider(provider);
        self.compat.iter().any(|p| p.id == provider)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRoute {
    pub client_model: String,
    pub provider: String,
    pub target_model: String,
    /// False when no route matched and the identity fallback was used.
    pub routed: bool,
}

pub struct ModelRouter {
    store: Arc<dyn RouteStore>,
    policy: ProviderPolicy,
    active: RwLock<Vec<ModelRoute>>,
}

impl ModelRouter {
    pub fn new(store: Arc<dyn RouteStore>, policy: ProviderPolicy) -> Result<Self> {
        let router = Self {
            store,
            policy,
            active: RwLock::new(Vec::new()),
        };
        router.reload()?;
        Ok(router)
    }

    pub fn policy(&self) -> &ProviderPolicy {
        &self.policy
    }

    /// Rebuild the active-route cache from the store.
    pub fn reload(&self) -> Result<()> {
        let mut routes: Vec<_> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.is_active)
            .collect();
        routes.sort_by_key(|r| r.id);
        tracing::info!(routes = routes.len(), "Loaded model routes");
        for r in &routes {
            tracing::debug!(client_model = %r.client_model, target_model = %r.target_model, provider = %r.target_provider, "Model route");
        }
        *self.active.write() = routes;
        Ok(())
    }

    /// First active route for the exact client model wins; otherwise the model
    /// passes through unchanged to `default_provider`.
    pub fn resolve(&self, client_model: &str, default_provider: &str) -> ResolvedRoute {
        let active = self.active.read();
        match active.iter().find(|r| r.client_model == client_model) {
            Some(route) => {
                tracing::debug!(client_model, target_model = %route.target_model, provider = %route.target_provider, "Model routing");
                ResolvedRoute {
                    client_model: client_model.to_string(),
                    provider: normalize_provider(&route.target_provider),
                    target_model: route.target_model.clone(),
                    routed: true,
                }
            }
            None => ResolvedRoute {
                client_model: client_model.to_string(),
                provider: normalize_provider(default_provider),
                target_model: client_model.to_string(),
                routed: false,
            },
        }
    }

    pub fn resolve_for_protocol(
        &self,
        client_model: &str,
        protocol: RouteProtocol,
    ) -> Result<ResolvedRoute> {
        let resolved = self.resolve(client_model, DEFAULT_PROVIDER);
        self.policy
            .validate_for_protocol(&resolved.provider, protocol)?;
        Ok(resolved)
    }

    pub fn validate_provider(&self, client_model: &str, provider: &str) -> Result<()> {
        self.policy.validate_provider(client_model, provider)
    }

    pub fn list_routes(&self) -> Result<Vec<ModelRoute>> {
        let mut routes = self.store.list()?;
        routes.sort_by(|a, b| {
            (&a.target_provider, &a.client_model).cmp(&(&b.target_provider, &b.client_model))
        });
        Ok(routes)
    }

    /// Client models that have at least one active route, in route order.
    pub fn client_models(&self) -> Vec<String> {
        let mut models: Vec<String> = Vec::new();
        for route in self.active.read().iter() {
            if !models.contains(&route.client_model) {
                models.push(route.client_model.clone());
            }
        }
        models
    }

    pub fn create_route(&self, route: ModelRoute) -> Result<ModelRoute> {
        let route = self.checked(route)?;
        let created = self.store.insert(route)?;
        self.reload()?;
        Ok(created)
    }

    pub fn update_route(&self, route: ModelRoute) -> Result<ModelRoute> {
        let route = self.checked(route)?;
        self.store.update(&route)?;
        self.reload()?;
        Ok(route)
    }

    pub fn delete_route(&self, id: u64) -> Result<()> {
        self.store.delete(id)?;
        self.reload()
    }

    fn checked(&self, mut route: ModelRoute) -> Result<ModelRoute> {
        route.client_model = route.client_model.trim().to_string();
        route.target_model = route.target_model.trim().to_string();
        if route.client_model.is_empty() || route.target_model.is_empty() {
            return Err(GatewayError::validation(
                "client_model and target_model are required",
            ));
        }
        route.target_provider = normalize_provider(&route.target_provider);
        self.policy
            .validate_provider(&route.client_model, &route.target_provider)?;
        Ok(route)
    }
}
