//! Routes a request by a `model` field against `config.routing.by_model`,
//! falling back to the load balancer over `instances` when present.
//!
//! Grounded in `strategies/model_router.py`.

use {
    super::{LoadBalancerStrategy, RequestContext, Strategy},
    crate::config::ServiceConfig,
    std::sync::Arc,
};

pub struct ModelRouterStrategy {
    load_balancer: Arc<LoadBalancerStrategy>,
}

impl ModelRouterStrategy {
    pub fn new(load_balancer: Arc<LoadBalancerStrategy>) -> Self {
        Self { load_balancer }
    }
}

impl Strategy for ModelRouterStrategy {
    fn name(&self) -> &str {
        "model_router"
    }

    fn route_request(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        config: &ServiceConfig,
    ) -> Option<String> {
        let model_key = config.routing.model_key.as_str();
        let model = ctx.field(model_key).or_else(|| ctx.field("model"))?;

        if let Some(url) = config.routing.by_model.get(model) {
            return Some(url.clone());
        }

        if !config.instances.is_empty() {
            return self.load_balancer.route_request(service_id, ctx, config);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Instance, RoutingConfig};
    use std::collections::HashMap;

    fn router() -> ModelRouterStrategy {
        ModelRouterStrategy::new(Arc::new(LoadBalancerStrategy::new()))
    }

    #[test]
    fn routes_known_model_to_its_url() {
        let mut by_model = HashMap::new();
        by_model.insert("llama3".to_string(), "http://a.local".to_string());
        let config = ServiceConfig {
            routing: RoutingConfig {
                by_model,
                model_key: "model".into(),
            },
            ..Default::default()
        };
        let ctx = RequestContext {
            body_fields: HashMap::from([("model".to_string(), "llama3".to_string())]),
            ..Default::default()
        };

        assert_eq!(
            router().route_request("svc", &ctx, &config),
            Some("http://a.local".to_string())
        );
    }

    #[test]
    fn unknown_model_falls_back_to_load_balancer() {
        let config = ServiceConfig {
            instances: vec![Instance {
                url: "http://only.local".into(),
                weight: None,
                region: None,
            }],
            ..Default::default()
        };
        let ctx = RequestContext {
            body_fields: HashMap::from([("model".to_string(), "unknown".to_string())]),
            ..Default::default()
        };

        assert_eq!(
            router().route_request("svc", &ctx, &config),
            Some("http://only.local".to_string())
        );
    }

    #[test]
    fn no_model_and_no_instances_returns_none() {
        let config = ServiceConfig::default();
        let ctx = RequestContext::default();
        assert_eq!(router().route_request("svc", &ctx, &config), None);
    }
}
