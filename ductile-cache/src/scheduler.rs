//! Heartbeat worker: one cooperative ticker that walks the cache-enabled
//! endpoints and enqueues refreshes for stale ones. Refreshes coalesce in
//! the manager, so a slow refresh never stacks up behind the ticker.

use std::sync::Arc;
use std::time::Duration;

use ductile_config::RegistryHandle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{endpoint_key, CacheManager};

/// How long shutdown waits for in-flight refreshes before abandoning
/// them. The storage catalog's snapshot discipline keeps an abandoned
/// refresh from committing partially.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Heartbeat {
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
    refreshes: Arc<tokio::sync::Mutex<JoinSet<()>>>,
}

impl Heartbeat {
    /// Run one warm-up pass: refresh every cache that is missing or stale.
    /// Failures are logged and non-fatal; serving starts regardless.
    pub async fn warm_up(registry: &RegistryHandle, manager: &CacheManager) {
        let snapshot = registry.snapshot();
        for entry in snapshot.cached_entries() {
            let endpoint = &entry.endpoint;
            let Some(cache) = endpoint.cache.as_ref() else {
                continue;
            };
            let key = endpoint_key(endpoint);
            let missing = manager
                .state(&key)
                .and_then(|s| s.last_snapshot)
                .is_none();
            if missing || manager.is_stale(&key, cache) {
                if let Err(err) = manager.refresh(endpoint, "warm-up").await {
                    tracing::warn!(endpoint = %key, error = %err, "warm-up refresh failed");
                }
            }
        }
    }

    /// Start the ticker. Each tick enqueues refreshes for endpoints whose
    /// snapshot age passed their schedule; unscheduled caches are skipped.
    pub fn start(
        interval: Duration,
        registry: RegistryHandle,
        manager: Arc<CacheManager>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let refreshes = Arc::new(tokio::sync::Mutex::new(JoinSet::new()));
        let worker_refreshes = refreshes.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(interval_secs = interval.as_secs_f64(), "heartbeat started");
            loop {
                tokio::select! {
                    _ = worker_cancel.cancelled() => {
                        tracing::info!("heartbeat stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        Self::tick(&registry, &manager, &worker_refreshes).await;
                    }
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
            refreshes,
        }
    }

    async fn tick(
        registry: &RegistryHandle,
        manager: &Arc<CacheManager>,
        refreshes: &Arc<tokio::sync::Mutex<JoinSet<()>>>,
    ) {
        let mut refreshes = refreshes.lock().await;
        // Reap refreshes that finished since the last tick.
        while refreshes.try_join_next().is_some() {}

        let snapshot = registry.snapshot();
        for entry in snapshot.cached_entries() {
            let endpoint = entry.endpoint.clone();
            let Some(cache) = endpoint.cache.as_ref() else {
                continue;
            };
            let key = endpoint_key(&endpoint);
            if !manager.is_stale(&key, cache) {
                continue;
            }
            let manager = manager.clone();
            refreshes.spawn(async move {
                match manager.refresh(&endpoint, "schedule").await {
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(endpoint = %endpoint_key(&endpoint), error = %err, "scheduled refresh failed");
                    }
                }
            });
        }
    }

    /// Signal shutdown: the loop halts after the current tick, then
    /// in-flight refreshes are awaited up to [`SHUTDOWN_GRACE`] and
    /// abandoned past it.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }

        let mut refreshes = self.refreshes.lock().await;
        if refreshes.is_empty() {
            return;
        }
        tracing::info!(in_flight = refreshes.len(), "waiting for in-flight refreshes");
        let drain = async {
            while refreshes.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "in-flight refreshes abandoned after grace period"
            );
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductile_config::{
        CacheConfig, ConnectionConfig, DuckdbSettings, EndpointConfig, EndpointEntry,
        EndpointRegistry, ProjectConfig, RetentionConfig,
    };
    use ductile_engine::Engine;
    use ductile_template::TemplateDir;
    use std::collections::BTreeMap;

    fn scheduled_endpoint(schedule: Option<Duration>) -> EndpointConfig {
        EndpointConfig {
            url_path: Some("/scheduled/".into()),
            connection: vec!["main".into()],
            template: Some("SELECT 1".into()),
            cache: Some(CacheConfig {
                enabled: true,
                catalog: None,
                schema: None,
                table: "scheduled_cache".into(),
                schedule,
                refresh_endpoint: false,
                template_file: Some("source.sql".into()),
                primary_key: vec![],
                cursor: None,
                retention: RetentionConfig::default(),
            }),
            ..Default::default()
        }
    }

    fn manager() -> (Arc<CacheManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("source.sql"), "SELECT 42 AS answer").unwrap();
        let mut connections = BTreeMap::new();
        connections.insert("main".to_string(), ConnectionConfig::default());
        let engine = Arc::new(
            Engine::init(
                &DuckdbSettings {
                    max_concurrent_reads: 2,
                    ..Default::default()
                },
                &connections,
            )
            .unwrap(),
        );
        let project = Arc::new(ProjectConfig {
            connections,
            ..Default::default()
        });
        let manager = CacheManager::new(
            engine,
            Arc::new(TemplateDir::new(dir.path())),
            project,
            BTreeMap::new(),
        );
        (Arc::new(manager), dir)
    }

    #[tokio::test]
    async fn warm_up_fills_missing_caches() {
        let (manager, _dir) = manager();
        let registry = RegistryHandle::new(EndpointRegistry::new(vec![EndpointEntry::new(
            scheduled_endpoint(Some(Duration::from_secs(3600))),
            None,
        )]));

        Heartbeat::warm_up(&registry, &manager).await;
        let state = manager.state("/scheduled/").unwrap();
        assert_eq!(state.last_snapshot.unwrap().row_count, 1);
    }

    #[tokio::test]
    async fn ticker_refreshes_stale_endpoints() {
        let (manager, _dir) = manager();
        let registry = RegistryHandle::new(EndpointRegistry::new(vec![EndpointEntry::new(
            scheduled_endpoint(Some(Duration::from_millis(5))),
            None,
        )]));

        let heartbeat = Heartbeat::start(
            Duration::from_millis(10),
            registry.clone(),
            manager.clone(),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        heartbeat.shutdown().await;

        let state = manager.state("/scheduled/").unwrap();
        assert!(state.last_snapshot.is_some());
    }

    #[tokio::test]
    async fn unscheduled_endpoints_are_skipped() {
        let (manager, _dir) = manager();
        let registry = RegistryHandle::new(EndpointRegistry::new(vec![EndpointEntry::new(
            scheduled_endpoint(None),
            None,
        )]));

        let heartbeat = Heartbeat::start(
            Duration::from_millis(10),
            registry.clone(),
            manager.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        heartbeat.shutdown().await;

        assert!(manager.state("/scheduled/").is_none());
    }

    #[tokio::test]
    async fn shutdown_halts_the_loop() {
        let (manager, _dir) = manager();
        let registry = RegistryHandle::new(EndpointRegistry::new(vec![]));
        let heartbeat = Heartbeat::start(Duration::from_millis(5), registry, manager);
        let token = heartbeat.cancel_token();
        heartbeat.shutdown().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_refreshes() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (manager, _dir) = manager();
        let registry = RegistryHandle::new(EndpointRegistry::new(vec![]));
        let heartbeat = Heartbeat::start(Duration::from_millis(5), registry, manager);

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        heartbeat.refreshes.lock().await.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });

        heartbeat.shutdown().await;
        assert!(
            finished.load(Ordering::SeqCst),
            "shutdown returned before the in-flight refresh completed"
        );
    }
}
