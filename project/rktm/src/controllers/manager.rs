use crate::errors::is_max_pipelines_exceeded;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::sleep;

/// Controller trait defines the contract for controllers managed by ControllerManager.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    // Name used for identifying the controller.
    fn name(&self) -> &'static str;

    // Reconcile the object identified by key, e.g. a pipeline name.
    async fn reconcile(&self, key: &str) -> Result<()>;

    // Every key this controller is responsible for, enqueued on each resync.
    async fn list_keys(&self) -> Result<Vec<String>>;
}

/// Registers controllers, deduplicates queued keys and runs reconcile passes on bounded workers.
pub struct ControllerManager {
    controllers: RwLock<HashMap<String, Arc<dyn Controller>>>,
    // a work queue per controller.
    queues: RwLock<HashMap<String, mpsc::Sender<String>>>,
    // keys queued or running, so the same key never gets into a queue twice.
    inflight: RwLock<HashMap<String, HashSet<String>>>,
    // deadline for a single pass; dropping the pass cancels it at its next await point.
    reconcile_timeout: Option<Duration>,
    stop_tx: watch::Sender<bool>,
}

impl ControllerManager {
    pub fn new(reconcile_timeout: Option<Duration>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            controllers: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            inflight: RwLock::new(HashMap::new()),
            reconcile_timeout,
            stop_tx,
        }
    }

    // Register a controller and spawn a dispatcher task that consumes its work queue.
    pub async fn register(
        self: Arc<Self>,
        controller: Arc<dyn Controller>,
        workers: usize, // max number of concurrent reconcile workers
    ) -> Result<()> {
        let name = controller.name().to_string();
        let (tx, mut rx) = mpsc::channel::<String>(1000);

        self.controllers
            .write()
            .await
            .insert(name.clone(), controller.clone());
        self.queues.write().await.insert(name.clone(), tx);
        self.inflight
            .write()
            .await
            .insert(name.clone(), HashSet::new());

        let semaphore = Arc::new(tokio::sync::Semaphore::new(workers.max(1)));
        let mut stop_sub = self.stop_tx.subscribe();
        let manager = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_sub.changed() => {
                        break;
                    }

                    opt = rx.recv() => {
                        let Some(key) = opt else { break };
                        let permit = match semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };

                        let controller = controller.clone();
                        let name = name.clone();
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            let timeout = manager.reconcile_timeout;
                            let result = retry_with_backoff(|| {
                                run_pass(controller.clone(), key.clone(), timeout)
                            })
                            .await;
                            match result {
                                Ok(()) => log::debug!("controller {name} reconciled {key}"),
                                Err(e) if is_max_pipelines_exceeded(&e) => {
                                    log::info!("controller {name}: {key} is waiting for a free pipeline slot");
                                }
                                Err(e) => {
                                    log::error!("controller {name} reconcile {key} failed: {e:#}");
                                }
                            }

                            let mut inflight_map = manager.inflight.write().await;
                            if let Some(set) = inflight_map.get_mut(&name) {
                                set.remove(&key);
                            }
                            drop(permit);
                        });
                    }
                }
            }
            log::info!("controller {name} dispatcher stopped");
        });

        Ok(())
    }

    // Enqueue a key for a controller, relying on the inflight set to avoid duplicates.
    pub async fn enqueue(&self, controller_name: &str, key: String) {
        let mut inflight_map = self.inflight.write().await;
        if let Some(set) = inflight_map.get_mut(controller_name) {
            if set.contains(&key) {
                return;
            }
            set.insert(key.clone());
        }

        let queues = self.queues.read().await;
        if let Some(tx) = queues.get(controller_name) {
            if tx.try_send(key.clone()).is_err() {
                log::warn!("work queue of {controller_name} is full, dropping {key}");
                if let Some(set) = inflight_map.get_mut(controller_name) {
                    set.remove(&key);
                }
            }
        } else if let Some(set) = inflight_map.get_mut(controller_name) {
            set.remove(&key);
        }
    }

    /// Enqueue every key of every controller once.
    pub async fn resync(&self) {
        let controllers: Vec<Arc<dyn Controller>> =
            self.controllers.read().await.values().cloned().collect();
        for controller in controllers {
            match controller.list_keys().await {
                Ok(keys) => {
                    for key in keys {
                        self.enqueue(controller.name(), key).await;
                    }
                }
                Err(e) => log::warn!("failed to list keys of {}: {e:#}", controller.name()),
            }
        }
    }

    /// Resync every `period` until shutdown.
    pub fn start_resync(self: Arc<Self>, period: Duration) {
        let mut stop_sub = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop_sub.changed() => break,
                    _ = ticker.tick() => self.resync().await,
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        sleep(Duration::from_millis(200)).await;
    }
}

async fn run_pass(
    controller: Arc<dyn Controller>,
    key: String,
    timeout: Option<Duration>,
) -> Result<()> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, controller.reconcile(&key))
            .await
            .map_err(|_| anyhow!("reconcile of {key} timed out after {limit:?}"))?,
        None => controller.reconcile(&key).await,
    }
}

/// Re-run the whole pass on failure. A denied pipeline slot is not retried here; the next
/// resync or a freed slot brings the key back.
async fn retry_with_backoff<F, Fut>(mut f: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut attempts = 0u32;
    loop {
        match f().await {
            Ok(_) => return Ok(()),
            Err(e) if is_max_pipelines_exceeded(&e) => return Err(e),
            Err(e) => {
                attempts += 1;
                if attempts >= 5 {
                    return Err(e);
                }
                let backoff = 2u64.pow(attempts.min(6)) * 100;
                log::debug!("reconcile attempt {attempts} failed, retrying in {backoff}ms: {e:#}");
                sleep(Duration::from_millis(backoff)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ControllerError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recording {
        seen: Mutex<Vec<String>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Controller for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn reconcile(&self, key: &str) -> Result<()> {
            self.seen.lock().unwrap().push(key.to_string());
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow!("transient"));
            }
            Ok(())
        }

        async fn list_keys(&self) -> Result<Vec<String>> {
            Ok(vec!["a".to_string(), "b".to_string()])
        }
    }

    #[tokio::test]
    async fn test_retry_reruns_whole_pass() {
        let mut calls = 0;
        let result = retry_with_backoff(|| {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 2 {
                    Err(anyhow!("conflict"))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_max_pipelines_is_not_retried() {
        let mut calls = 0;
        let result = retry_with_backoff(|| {
            calls += 1;
            async { Err(ControllerError::MaxPipelinesExceeded.into()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_resync_enqueues_every_key() {
        let controller = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(1),
        });
        let manager = Arc::new(ControllerManager::new(Some(Duration::from_secs(5))));
        manager.clone().register(controller.clone(), 2).await.unwrap();
        manager.resync().await;

        for _ in 0..50 {
            sleep(Duration::from_millis(20)).await;
            if manager.inflight.read().await["recording"].is_empty() {
                break;
            }
        }
        let mut seen = controller.seen.lock().unwrap().clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen, vec!["a", "b"]);
        manager.shutdown().await;
    }
}
