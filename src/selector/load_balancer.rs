//! Health-tracked round-robin load balancing over a service's `instances`.
//!
//! Grounded in `strategies/load_balancer.py`: round-robin cursor per
//! service, optional region affinity, and a "soft fallback" to the first
//! configured instance when nothing is healthy — a recovery signal, not a
//! pretense that the instance is actually up.

use {
    super::{InstanceHealthMap, RequestContext, Strategy},
    crate::config::ServiceConfig,
    dashmap::DashMap,
    std::sync::atomic::{AtomicUsize, Ordering},
};

struct ServiceCursor {
    index: AtomicUsize,
}

/// Round-robin selector with per-`(service, instance)` health tracking.
pub struct LoadBalancerStrategy {
    cursors: DashMap<String, ServiceCursor>,
    health: InstanceHealthMap,
}

impl LoadBalancerStrategy {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
            health: DashMap::new(),
        }
    }

    /// Idempotently registers a service's instances as healthy by default.
    fn ensure_registered(&self, service_id: &str, config: &ServiceConfig) {
        self.cursors
            .entry(service_id.to_string())
            .or_insert_with(|| ServiceCursor {
                index: AtomicUsize::new(0),
            });
        for instance in &config.instances {
            self.health
                .entry((service_id.to_string(), instance.url.clone()))
                .or_insert(true);
        }
    }

    fn is_healthy(&self, service_id: &str, url: &str) -> bool {
        self.health
            .get(&(service_id.to_string(), url.to_string()))
            .map(|v| *v)
            .unwrap_or(true)
    }

    pub fn mark_instance_healthy(&self, service_id: &str, url: &str) {
        self.health
            .insert((service_id.to_string(), url.to_string()), true);
    }

    pub fn mark_instance_unhealthy(&self, service_id: &str, url: &str) {
        self.health
            .insert((service_id.to_string(), url.to_string()), false);
    }
}

impl Default for LoadBalancerStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for LoadBalancerStrategy {
    fn name(&self) -> &str {
        "load_balancer"
    }

    fn route_request(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        config: &ServiceConfig,
    ) -> Option<String> {
        if config.instances.is_empty() {
            return None;
        }
        self.ensure_registered(service_id, config);

        let mut healthy: Vec<&crate::config::Instance> = config
            .instances
            .iter()
            .filter(|i| self.is_healthy(service_id, &i.url))
            .collect();

        if healthy.is_empty() {
            // Soft fallback: recovery signal, not pretended health.
            return config.instances.first().map(|i| i.url.clone());
        }

        if let Some(region) = &ctx.user_region {
            let in_region: Vec<_> = healthy
                .iter()
                .copied()
                .filter(|i| i.region.as_deref() == Some(region.as_str()))
                .collect();
            if !in_region.is_empty() {
                healthy = in_region;
            }
        }

        let cursor = self.cursors.get(service_id)?;
        let index = cursor.index.fetch_add(1, Ordering::SeqCst) % healthy.len();
        Some(healthy[index].url.clone())
    }
}
