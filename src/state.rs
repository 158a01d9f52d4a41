//! Process-scoped application state, built once in `main` and shared by
//! the router and the dispatcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channels::{Delivery, OutboundChannel};
use crate::config::AppConfig;
use crate::rate_limit::RateLimiter;
use crate::session::SessionManager;
use crate::store::Database;
use crate::webhook::{InboundMessage, MessageDeduper};
use crate::workflow::{Orchestrator, StageClient};

/// Capacity of the webhook → dispatcher queue.
pub const QUEUE_CAPACITY: usize = 1024;

/// How often the dedup cache and idle rate-limit buckets are pruned.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a handler or dispatcher task needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub orchestrator: Arc<Orchestrator>,
    pub delivery: Delivery,
    pub dedup: Arc<MessageDeduper>,
    pub db: Option<Arc<dyn Database>>,
    pub metrics: Option<PrometheusHandle>,
    pub queue: mpsc::Sender<InboundMessage>,
}

impl AppState {
    /// Wire the components together. Returns the state and the receiving
    /// end of the dispatcher queue.
    pub fn new(
        config: AppConfig,
        stage_client: Arc<dyn StageClient>,
        channel: Arc<dyn OutboundChannel>,
        db: Option<Arc<dyn Database>>,
        metrics: Option<PrometheusHandle>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let sessions = match &db {
            Some(db) => SessionManager::with_db(config.session.clone(), Arc::clone(db)),
            None => SessionManager::new(config.session.clone()),
        };
        let orchestrator = Orchestrator::new(
            stage_client,
            Arc::clone(&sessions),
            config.workflow.clone(),
        );
        let (queue, rx) = mpsc::channel(QUEUE_CAPACITY);

        let state = Self {
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            delivery: Delivery::new(channel, config.delivery.clone()),
            dedup: Arc::new(MessageDeduper::new(config.dedup_window)),
            orchestrator: Arc::new(orchestrator),
            sessions,
            db,
            metrics,
            queue,
            config: Arc::new(config),
        };
        (state, rx)
    }

    /// Prune the dedup cache and idle rate-limit buckets. Returns the number
    /// of message ids and buckets dropped.
    pub fn prune_caches(&self, now: Instant) -> (usize, usize) {
        (self.dedup.prune(now), self.rate_limiter.prune(now))
    }

    /// Persist live sessions before exit.
    pub async fn shutdown(&self) {
        let flushed = self.sessions.flush().await;
        info!(sessions = flushed, "Session state flushed");
    }
}

/// Periodically prune the dedup cache and idle rate-limit buckets.
pub fn spawn_maintenance_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let (ids, buckets) = state.prune_caches(Instant::now());
            if ids + buckets > 0 {
                debug!(message_ids = ids, buckets, "Maintenance prune");
            }
        }
    })
}
