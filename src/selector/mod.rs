//! Pluggable upstream selection: model-aware routing and health-tracked
//! round-robin load balancing behind one `Strategy` trait.
//!
//! Strategies register under a unique name in an explicit, constructed
//! [`StrategyRegistry`] object (an instance, not an ambient singleton);
//! duplicate registration is an error.

mod load_balancer;
mod model_router;

pub use load_balancer::LoadBalancerStrategy;
pub use model_router::ModelRouterStrategy;

use {
    crate::config::ServiceConfig,
    dashmap::DashMap,
    std::{collections::HashMap, sync::Arc},
};

/// Everything a strategy needs to know about the request it's routing.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Parsed JSON body fields relevant to routing (e.g. `model`), if any.
    pub body_fields: HashMap<String, String>,
    pub user_region: Option<String>,
}

impl RequestContext {
    /// Looks up `key` first in the body, then in headers — mirrors how the
    /// model router reads `request_context[model_key]`.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.body_fields
            .get(key)
            .or_else(|| self.headers.get(key))
            .map(String::as_str)
    }
}

/// A pluggable decision function mapping request context to an upstream URL.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the chosen URL, or `None` if this strategy has no opinion
    /// (the selector then falls through to the next rule).
    fn route_request(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        config: &ServiceConfig,
    ) -> Option<String>;
}

/// Why a URL was chosen, reported as a routing-decision log/metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionReason {
    Strategy(String),
    LoadBalancer,
    BaseUrl,
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionReason::Strategy(name) => write!(f, "strategy:{name}"),
            SelectionReason::LoadBalancer => write!(f, "load_balancer"),
            SelectionReason::BaseUrl => write!(f, "base_url"),
        }
    }
}

/// Process-wide, thread-safe registry of named strategies, constructed once
/// and handed to the [`Selector`]. Names must be unique.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registers a strategy under its own [`Strategy::name`]. Returns an
    /// error if a strategy with that name is already registered.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) -> Result<(), String> {
        let name = strategy.name().to_string();
        if self.strategies.contains_key(&name) {
            return Err(format!("strategy '{name}' already registered"));
        }
        self.strategies.insert(name, strategy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a [`Selector`] with the two normative strategies pre-registered:
/// `load_balancer` and `model_router` (which delegates to the balancer when
/// no model match is found).
pub fn default_selector() -> Selector {
    let mut registry = StrategyRegistry::new();
    let load_balancer = Arc::new(LoadBalancerStrategy::new());
    registry
        .register(load_balancer.clone())
        .expect("built-in strategy names are unique");
    registry
        .register(Arc::new(ModelRouterStrategy::new(load_balancer.clone())))
        .expect("built-in strategy names are unique");
    Selector::new(registry, Some(load_balancer))
}

/// Resolves an upstream URL for a request, applying the three-step fallback
/// chain: named strategy -> load balancer over `instances` -> `base_url`.
///
/// Keeps a direct handle to the built-in load balancer (when registered)
/// alongside the generic registry, since health callbacks are specific to
/// it and don't belong on the general [`Strategy`] trait.
pub struct Selector {
    registry: StrategyRegistry,
    load_balancer: Option<Arc<LoadBalancerStrategy>>,
}

impl Selector {
    pub fn new(
        registry: StrategyRegistry,
        load_balancer: Option<Arc<LoadBalancerStrategy>>,
    ) -> Self {
        Self {
            registry,
            load_balancer,
        }
    }

    pub fn resolve(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        config: &ServiceConfig,
    ) -> (String, SelectionReason) {
        if let Some(name) = &config.strategy
            && let Some(strategy) = self.registry.get(name)
            && let Some(url) = strategy.route_request(service_id, ctx, config)
        {
            return (url, SelectionReason::Strategy(name.clone()));
        }

        if !config.instances.is_empty()
            && let Some(lb) = &self.load_balancer
            && let Some(url) = lb.route_request(service_id, ctx, config)
        {
            return (url, SelectionReason::LoadBalancer);
        }

        (config.base_url.clone(), SelectionReason::BaseUrl)
    }

    pub fn mark_healthy(&self, service_id: &str, url: &str) {
        if let Some(lb) = &self.load_balancer {
            lb.mark_instance_healthy(service_id, url);
        }
    }

    pub fn mark_unhealthy(&self, service_id: &str, url: &str) {
        if let Some(lb) = &self.load_balancer {
            lb.mark_instance_unhealthy(service_id, url);
        }
    }
}

/// Per-`(service_id, instance_url)` health flag. Initially healthy; flipped
/// unhealthy by transport errors or 5xx, flipped healthy by any other
/// response. Owned exclusively by the load balancer.
pub type InstanceHealthMap = DashMap<(String, String), bool>;
