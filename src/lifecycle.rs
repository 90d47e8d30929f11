//! Per-service lifecycle state: readiness, startup driving, activity tracking.
//!
//! Mirrors the shape of a registry-backed state machine (one entry per key,
//! lazily created, exclusively mutated by its owner) the way a circuit
//! breaker registry owns its per-target state — here the per-service
//! `ServiceRecord` plays that role, and `cold/starting/hot/stopping` plays
//! the role circuit breakers give `closed/open/half-open`.

use {
    crate::{config::ServiceConfig, queue::RequestQueue},
    dashmap::DashMap,
    std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
    tokio::sync::RwLock,
};

/// The four lifecycle states a managed service moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Cold,
    Starting,
    Hot,
    /// Reserved for future remote-stop integration; no code path in this
    /// gateway currently transitions a service into `Stopping`.
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
}

/// Mutable runtime state for one managed service.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub state: ServiceState,
    pub readiness: Readiness,
    pub last_used_ms: u64,
    pub machine_id: Option<String>,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self {
            state: ServiceState::Cold,
            readiness: Readiness::NotReady,
            last_used_ms: now_ms(),
            machine_id: None,
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A point-in-time view of a service's status, as reported to clients.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub readiness: Readiness,
    pub machine_id: Option<String>,
    pub queue_pending: usize,
}

/// Outcome of [`LifecycleManager::ensure_starting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureStartingOutcome {
    AlreadyReady,
    Started,
    AlreadyStarting,
}

/// Outcome of [`LifecycleManager::proactive_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProactiveStartOutcome {
    Started202,
    ConflictAlreadyRunning409,
    ConflictAlreadyStarting409,
}

/// Capability for driving a remote start/stop of a managed service. The
/// gateway treats the concrete automation API as an opaque collaborator;
/// the default implementation does nothing, matching the design's intent
/// that `stopping` stays reserved and unreachable until a real driver is
/// plugged in.
pub trait RemoteStopDriver: Send + Sync {
    fn stop(&self, service_id: &str);
}

pub struct NoopStopDriver;

impl RemoteStopDriver for NoopStopDriver {
    fn stop(&self, _service_id: &str) {}
}

struct ServiceEntry {
    record: RwLock<ServiceRecord>,
    starting: AtomicBool,
    last_used_ms: AtomicU64,
}

impl Default for ServiceEntry {
    fn default() -> Self {
        Self {
            record: RwLock::new(ServiceRecord::default()),
            starting: AtomicBool::new(false),
            last_used_ms: AtomicU64::new(now_ms()),
        }
    }
}

/// Owns every [`ServiceRecord`] and [`StartupFlag`](AtomicBool) in the
/// gateway, and drives cold -> starting -> hot transitions.
pub struct LifecycleManager {
    entries: DashMap<String, Arc<ServiceEntry>>,
    services: Arc<DashMap<String, ServiceConfig>>,
    queue: Arc<RequestQueue>,
    http: reqwest::Client,
    stop_driver: Arc<dyn RemoteStopDriver>,
}

impl LifecycleManager {
    pub fn new(services: Arc<DashMap<String, ServiceConfig>>, queue: Arc<RequestQueue>) -> Self {
        Self {
            entries: DashMap::new(),
            services,
            queue,
            http: reqwest::Client::new(),
            stop_driver: Arc::new(NoopStopDriver),
        }
    }

    pub fn with_stop_driver(mut self, driver: Arc<dyn RemoteStopDriver>) -> Self {
        self.stop_driver = driver;
        self
    }

    fn entry(&self, service_id: &str) -> Arc<ServiceEntry> {
        self.entries
            .entry(service_id.to_string())
            .or_default()
            .clone()
    }

    fn config(&self, service_id: &str) -> Option<ServiceConfig> {
        self.services.get(service_id).map(|r| r.value().clone())
    }

    /// Non-blocking check of `state == hot && readiness == ready`.
    pub async fn is_ready(&self, service_id: &str) -> bool {
        let entry = self.entry(service_id);
        let record = entry.record.read().await;
        record.state == ServiceState::Hot && record.readiness == Readiness::Ready
    }

    /// Returns the current status, opportunistically probing `health_url`
    /// and promoting to `hot/ready` on a `200` if the service isn't ready yet.
    pub async fn status(&self, service_id: &str) -> ServiceStatus {
        let entry = self.entry(service_id);
        let not_ready = {
            let record = entry.record.read().await;
            record.readiness == Readiness::NotReady
        };

        if not_ready
            && let Some(config) = self.config(service_id)
            && let Some(health_url) = &config.health_url
        {
            let probe = self
                .http
                .get(health_url)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            if matches!(probe, Ok(resp) if resp.status().is_success()) {
                self.promote_to_hot(service_id, &entry).await;
                self.queue.release_all(service_id, ()).await;
            }
        }

        let record = entry.record.read().await;
        ServiceStatus {
            state: record.state,
            readiness: record.readiness,
            machine_id: record.machine_id.clone(),
            queue_pending: self.queue.pending(service_id),
        }
    }

    /// Updates `last_used_ms` to now. Commutative across concurrent callers:
    /// whichever call observes the largest timestamp wins.
    pub async fn touch(&self, service_id: &str) {
        let entry = self.entry(service_id);
        let now = now_ms();
        entry.last_used_ms.fetch_max(now, Ordering::SeqCst);
        let mut record = entry.record.write().await;
        record.last_used_ms = record.last_used_ms.max(now);
    }

    async fn promote_to_hot(&self, service_id: &str, entry: &ServiceEntry) {
        let mut record = entry.record.write().await;
        record.state = ServiceState::Hot;
        record.readiness = Readiness::Ready;
        record.last_used_ms = now_ms();
        tracing::info!(service_id, "service promoted to hot");
    }

    async fn demote_to_cold(&self, entry: &ServiceEntry) {
        let mut record = entry.record.write().await;
        record.state = ServiceState::Cold;
        record.readiness = Readiness::NotReady;
    }

    /// Claims the startup flag for `service_id` if it isn't ready and no
    /// other caller is already driving its startup. On success, transitions
    /// the record to `Starting` and returns the claimed entry.
    async fn claim_starting(
        &self,
        service_id: &str,
    ) -> Result<Arc<ServiceEntry>, EnsureStartingOutcome> {
        let entry = self.entry(service_id);
        if self.is_ready(service_id).await {
            return Err(EnsureStartingOutcome::AlreadyReady);
        }

        if entry
            .starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EnsureStartingOutcome::AlreadyStarting);
        }

        {
            let mut record = entry.record.write().await;
            record.state = ServiceState::Starting;
            record.readiness = Readiness::NotReady;
        }

        Ok(entry)
    }

    /// Claims the startup flag if the service isn't ready, and launches the
    /// startup driver exactly once per cold start, detached from the caller.
    pub async fn ensure_starting(self: &Arc<Self>, service_id: &str) -> EnsureStartingOutcome {
        if let Err(outcome) = self.claim_starting(service_id).await {
            return outcome;
        }

        let manager = Arc::clone(self);
        let service_id = service_id.to_string();
        tokio::spawn(async move {
            manager.run_startup_driver(&service_id).await;
        });

        EnsureStartingOutcome::Started
    }

    /// The user-facing "warm me up" operation. On the fast path (tiny,
    /// health-check-free warmups) the driver runs to completion before this
    /// returns, so the `202` response always reflects a settled outcome.
    pub async fn proactive_start(self: &Arc<Self>, service_id: &str) -> ProactiveStartOutcome {
        let entry = match self.claim_starting(service_id).await {
            Err(EnsureStartingOutcome::AlreadyReady) => {
                return ProactiveStartOutcome::ConflictAlreadyRunning409;
            }
            Err(EnsureStartingOutcome::AlreadyStarting) => {
                return ProactiveStartOutcome::ConflictAlreadyStarting409;
            }
            Err(EnsureStartingOutcome::Started) => {
                unreachable!("claim_starting never returns Started as an error")
            }
            Ok(entry) => entry,
        };

        let config = self.config(service_id).unwrap_or_default();
        let fast_path = config.warmup_ms <= 100 && config.health_url.is_none();

        if fast_path {
            self.drive_startup(service_id, &entry, &config).await;
        } else {
            let manager = Arc::clone(self);
            let sid = service_id.to_string();
            tokio::spawn(async move {
                manager.run_startup_driver(&sid).await;
            });
        }

        ProactiveStartOutcome::Started202
    }

    async fn run_startup_driver(self: Arc<Self>, service_id: &str) {
        let entry = self.entry(service_id);
        let config = self.config(service_id).unwrap_or_default();
        self.drive_startup(service_id, &entry, &config).await;
    }

    /// Runs the health-probe-or-warmup-sleep startup driver for an
    /// already-claimed entry and settles it into `hot` or back to `cold`.
    async fn drive_startup(&self, service_id: &str, entry: &ServiceEntry, config: &ServiceConfig) {
        let succeeded = if let Some(health_url) = &config.health_url {
            match self
                .http
                .get(health_url)
                .timeout(Duration::from_secs(10))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => true,
                _ => {
                    tokio::time::sleep(Duration::from_millis(config.warmup_ms)).await;
                    true
                }
            }
        } else {
            tokio::time::sleep(Duration::from_millis(config.warmup_ms)).await;
            true
        };

        entry.starting.store(false, Ordering::SeqCst);

        if succeeded {
            self.promote_to_hot(service_id, entry).await;
            self.queue.release_all(service_id, ()).await;
        } else {
            self.demote_to_cold(entry).await;
            self.queue.cancel_all(service_id).await;
        }
    }

    /// Runs one idle-monitor sweep: demotes every `hot` service whose
    /// activity is older than its configured idle timeout.
    pub async fn sweep_idle(&self) {
        let now = now_ms();
        for item in self.entries.iter() {
            let service_id = item.key().clone();
            let entry = item.value().clone();

            let Some(config) = self.config(&service_id) else {
                continue;
            };
            if config.idle_timeout_ms == 0 {
                continue;
            }

            let should_demote = {
                let record = entry.record.read().await;
                record.state == ServiceState::Hot
                    && now.saturating_sub(record.last_used_ms) >= config.idle_timeout_ms
            };

            if should_demote {
                self.demote_to_cold(&entry).await;
                tracing::info!(service_id = %service_id, "idle timeout elapsed, demoting to cold");
                let driver = Arc::clone(&self.stop_driver);
                let sid = service_id.clone();
                tokio::spawn(async move {
                    driver.stop(&sid);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RequestQueue;

    fn manager_with(service_id: &str, config: ServiceConfig) -> Arc<LifecycleManager> {
        let services = Arc::new(DashMap::new());
        services.insert(service_id.to_string(), config);
        let queue = Arc::new(RequestQueue::new());
        Arc::new(LifecycleManager::new(services, queue))
    }

    #[tokio::test]
    async fn cold_service_is_not_ready() {
        let manager = manager_with("svc", ServiceConfig::default());
        assert!(!manager.is_ready("svc").await);
    }

    #[tokio::test]
    async fn ensure_starting_launches_exactly_one_driver() {
        let manager = manager_with(
            "svc",
            ServiceConfig {
                warmup_ms: 30,
                ..Default::default()
            },
        );

        let first = manager.ensure_starting("svc").await;
        let second = manager.ensure_starting("svc").await;

        assert_eq!(first, EnsureStartingOutcome::Started);
        assert_eq!(second, EnsureStartingOutcome::AlreadyStarting);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.is_ready("svc").await);
    }

    #[tokio::test]
    async fn proactive_start_conflicts_on_second_call() {
        let manager = manager_with(
            "svc",
            ServiceConfig {
                warmup_ms: 10,
                ..Default::default()
            },
        );

        let first = manager.proactive_start("svc").await;
        assert_eq!(first, ProactiveStartOutcome::Started202);

        // Fast path already resolved the warmup synchronously above.
        let second = manager.proactive_start("svc").await;
        assert_eq!(second, ProactiveStartOutcome::ConflictAlreadyRunning409);
    }

    #[tokio::test]
    async fn idle_sweep_demotes_hot_service_past_timeout() {
        let manager = manager_with(
            "svc",
            ServiceConfig {
                warmup_ms: 5,
                idle_timeout_ms: 20,
                ..Default::default()
            },
        );
        manager.proactive_start("svc").await;
        assert!(manager.is_ready("svc").await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.sweep_idle().await;

        assert!(!manager.is_ready("svc").await);
    }
}
