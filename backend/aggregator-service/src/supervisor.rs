//! Process lifecycle: start everything, drain on shutdown, join everything.

use actix_web::{web, App, HttpResponse, HttpServer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Config, StoreBackend};
use crate::coordinator::kafka::{KafkaClaimCoordinator, KafkaCoordinatorConfig};
use crate::error::{AppError, Result};
use crate::metrics;
use crate::services::{AggregatorConfig, AggregatorWorker, SaleAggregator};
use crate::store::{AnalyticsStore, InMemoryAnalyticsStore, RedisAnalyticsStore};

/// Readiness as reported on `/ready`
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

async fn ready(readiness: web::Data<Readiness>) -> HttpResponse {
    if readiness.is_ready() {
        HttpResponse::Ok().json(serde_json::json!({ "status": "ready" }))
    } else {
        HttpResponse::ServiceUnavailable().json(serde_json::json!({ "status": "starting" }))
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready))
        .route("/metrics", web::get().to(metrics::serve_metrics));
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler, only Ctrl+C will stop: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    }
}

/// Owns the shutdown channel and the long-running tasks.
pub struct Supervisor {
    config: Config,
    shutdown_tx: watch::Sender<bool>,
    readiness: Readiness,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shutdown_tx,
            readiness: Readiness::default(),
        }
    }

    /// Sender that stops the aggregator when `true` is sent.
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Open the analytics store. An unreachable Redis is fatal.
    pub async fn connect_store(&self) -> Result<Arc<dyn AnalyticsStore>> {
        match self.config.store_backend {
            StoreBackend::Redis => {
                let pool = redis_utils::RedisPool::connect(
                    &self.config.redis_url,
                    self.config.redis_command_timeout(),
                )
                .await
                .map_err(|e| AppError::Redis(format!("{:#}", e)))?;
                info!("Redis connection initialized at {}", pool.address());

                Ok(Arc::new(RedisAnalyticsStore::new(
                    pool.manager(),
                    self.config.redis_command_timeout(),
                )))
            }
            StoreBackend::Memory => {
                warn!("STORE_BACKEND=memory: aggregates are kept in process and lost on exit");
                Ok(Arc::new(InMemoryAnalyticsStore::new()))
            }
        }
    }

    /// Create the group member and check the topic is reachable. Failure is fatal.
    pub async fn connect_coordinator(&self) -> Result<KafkaClaimCoordinator> {
        let coordinator =
            KafkaClaimCoordinator::new(KafkaCoordinatorConfig::from_config(&self.config))?;
        coordinator.verify_topic().await?;
        coordinator.subscribe()?;
        Ok(coordinator)
    }

    pub async fn run(self) -> Result<()> {
        let store = self.connect_store().await?;
        let coordinator = self.connect_coordinator().await?;

        metrics::seed_categories();
        let readiness = self.readiness.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(readiness.clone()))
                .configure(configure_routes)
        })
        .workers(1)
        .disable_signals()
        .bind((self.config.metrics_host.as_str(), self.config.metrics_port))?
        .run();
        let server_handle = server.handle();
        let metrics_task = tokio::spawn(server);
        info!(
            "Metrics server listening on {}:{}",
            self.config.metrics_host, self.config.metrics_port
        );

        let shutdown_tx = self.shutdown_tx.clone();
        let signal_task = tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining partitions");
            let _ = shutdown_tx.send(true);
        });

        let worker = Arc::new(AggregatorWorker::new(SaleAggregator::new(
            store,
            AggregatorConfig {
                history_max_len: self.config.history_max_len,
                atomic_extrema: self.config.atomic_extrema,
            },
        )));

        self.readiness.set(true);
        let consumer_result = coordinator
            .run(worker, self.shutdown_tx.subscribe())
            .await;
        self.readiness.set(false);

        signal_task.abort();
        server_handle.stop(true).await;
        match metrics_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Metrics server stopped with error: {}", e),
            Err(e) => warn!("Metrics server task failed: {}", e),
        }

        consumer_result?;
        info!("Aggregator stopped");
        Ok(())
    }
}
