//! # hearth-gateway
//!
//! A programmable, application-aware HTTP gateway that fronts heterogeneous
//! long-running upstream services, driving them cold -> starting -> hot on
//! demand and queueing callers while a service warms up.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hearth_gateway::{GatewayConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = GatewayConfig::default(); // loads config/{RUST_ENV}.toml
//!     config.logging.init_tracing();
//!     hearth_gateway::serve(config).await
//! }
//! ```
//!
//! # Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Configuration loading and per-service env overrides ([`GatewayConfig`], [`ServiceConfig`]) |
//! | [`error`] | Gateway plumbing errors ([`Error`]) |
//! | [`lifecycle`] | Per-service cold/starting/hot state machine ([`lifecycle::LifecycleManager`]) |
//! | [`queue`] | Cold-start request queue ([`queue::RequestQueue`]) |
//! | [`selector`] | Upstream URL selection strategies ([`selector::Selector`]) |
//! | [`proxy`] | Retry/fallback/streaming request pipeline ([`proxy::ProxyPipeline`]) |
//! | [`idle`] | Background idle-sweep task |
//! | [`router`] | HTTP surface wiring the above into an axum [`axum::Router`] |
//! | [`shutdown`] | Graceful shutdown notification ([`ShutdownNotifier`]) |
//! | [`utils`] | Shared helpers (handlebars env substitution, request-id generation, hop-by-hop headers) |

mod config;
mod error;
pub mod idle;
pub mod lifecycle;
pub mod proxy;
pub mod queue;
pub mod router;
pub mod selector;
mod shutdown;
mod utils;

pub use config::*;
pub use error::*;
pub use shutdown::*;
pub use utils::*;

pub type Result<T> = std::result::Result<T, Error>;

use {
    dashmap::DashMap,
    router::GatewayState,
    std::{sync::Arc, time::Duration},
};

/// Builds every gateway component from `config` and serves HTTP until a
/// shutdown signal arrives, waiting out each service's graceful drain.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    let bind_addr = config.full_bind_addr();
    let request_timeout = config.request_timeout;
    let services = Arc::new(DashMap::new());
    for (id, service) in &config.services {
        services.insert(id.clone(), service.clone());
    }

    let queue = Arc::new(queue::RequestQueue::new());
    let lifecycle = Arc::new(lifecycle::LifecycleManager::new(
        services.clone(),
        queue.clone(),
    ));
    let selector = Arc::new(selector::default_selector());
    let proxy = Arc::new(proxy::ProxyPipeline::new(
        lifecycle.clone(),
        selector.clone(),
        request_timeout,
    ));

    let state = GatewayState {
        config: Arc::new(config),
        services,
        lifecycle: lifecycle.clone(),
        queue,
        selector,
        proxy,
    };

    let notifier = ShutdownNotifier::default();
    let idle_handle = tokio::spawn(idle::run(lifecycle, notifier.cancellation_token()));

    let app = router::build(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "gateway listening");

    let shutdown_notifier = notifier.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            shutdown_notifier.emit(ShutdownPhase::Initiated);
            let grace = Duration::from_secs(30);
            shutdown_notifier.emit(ShutdownPhase::GracePeriodStarted { timeout: grace });
        })
        .await?;

    notifier.emit(ShutdownPhase::GracePeriodEnded);
    let _ = idle_handle.await;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
