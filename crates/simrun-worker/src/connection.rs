//! Registration with the master server.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use simrun_core::{CheckpointData, ServiceDescriptor};
use simrun_master::transport::{client_with_timeout, decode_response, post_json, request_error};
use simrun_master::TransportError;
use simrun_proto::{paths, Ack, HeartbeatResponse, RegisterServiceRequest, RegisterServiceResponse};

use crate::config::Config;

/// Why a heartbeat session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Forgotten,
    Lost,
}

/// Keeps this worker registered with the master.
pub struct MasterConnection {
    config: Arc<Config>,
    client: reqwest::Client,
}

impl MasterConnection {
    pub fn new(config: Arc<Config>) -> Self {
        let client = client_with_timeout(Some(config.call_timeout()));
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        paths::url(&self.config.master_url, path)
    }

    fn descriptor(&self) -> ServiceDescriptor {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        ServiceDescriptor::new(
            self.config.worker_id.clone(),
            self.config.capability.clone(),
            self.config.endpoint(),
        )
        .with_hostname(hostname)
    }

    /// Register with the master. Returns the heartbeat interval to use.
    pub async fn register(&self) -> Result<Duration, TransportError> {
        let response: RegisterServiceResponse = post_json(
            &self.client,
            &self.url(paths::SERVICES),
            &RegisterServiceRequest {
                descriptor: self.descriptor(),
            },
        )
        .await?;
        if let Some(warning) = &response.warning {
            warn!(warning = %warning, "Master reported a version mismatch");
        }

        let mut interval = self.config.heartbeat_interval_secs;
        if response.heartbeat_interval_secs > 0 {
            interval = interval.min(response.heartbeat_interval_secs);
        }
        info!(
            worker_id = %self.config.worker_id,
            master = %self.config.master_url,
            heartbeat_interval_secs = interval,
            "Registered with master"
        );
        Ok(Duration::from_secs(interval.max(1)))
    }

    /// Send one heartbeat. `false` means the master no longer knows this worker.
    pub async fn heartbeat(&self) -> Result<bool, TransportError> {
        let url = self.url(&paths::service_heartbeat(&self.config.worker_id));
        let response: HeartbeatResponse = post_json(&self.client, &url, &()).await?;
        Ok(response.known)
    }

    pub async fn unregister(&self) -> Result<(), TransportError> {
        let url = self.url(&paths::service(&self.config.worker_id));
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        let _: Ack = decode_response(&url, response).await?;
        info!(worker_id = %self.config.worker_id, "Unregistered from master");
        Ok(())
    }

    /// Register, heartbeat, and register again whenever the master forgets
    /// this worker or becomes unreachable. Returns on shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            match self.register().await {
                Ok(interval) => match self.heartbeat_session(interval, &shutdown).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Forgotten => {
                        warn!("Master forgot this worker, registering again");
                        continue;
                    }
                    SessionEnd::Lost => {}
                },
                Err(e) => warn!(error = %e, "Registration failed"),
            }

            let delay = Duration::from_secs(self.config.reconnect_delay_secs);
            info!(delay_secs = self.config.reconnect_delay_secs, "Reconnecting to master");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn heartbeat_session(&self, interval: Duration, shutdown: &CancellationToken) -> SessionEnd {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
            }
            match self.heartbeat().await {
                Ok(true) => debug!("Heartbeat acknowledged"),
                Ok(false) => return SessionEnd::Forgotten,
                Err(e) => {
                    warn!(error = %e, "Heartbeat failed");
                    return SessionEnd::Lost;
                }
            }
        }
    }

    /// Post checkpoints of resilient runs to the master until the channel
    /// closes or shutdown.
    pub async fn forward_checkpoints(
        &self,
        mut checkpoints: mpsc::UnboundedReceiver<CheckpointData>,
        shutdown: CancellationToken,
    ) {
        loop {
            let checkpoint = tokio::select! {
                next = checkpoints.recv() => match next {
                    Some(checkpoint) => checkpoint,
                    None => return,
                },
                _ = shutdown.cancelled() => return,
            };
            let url = self.url(&paths::run_action(&checkpoint.task_id, "checkpoints"));
            let task_id = checkpoint.task_id.clone();
            let step = checkpoint.step;
            match post_json::<_, Ack>(&self.client, &url, &checkpoint).await {
                Ok(_) => debug!(task_id = %task_id, step = step, "Checkpoint delivered"),
                Err(e) => warn!(task_id = %task_id, step = step, error = %e, "Checkpoint delivery failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::net::TcpListener;

    use simrun_core::{ComputationTaskId, ServiceId};
    use simrun_master::http::create_router;
    use simrun_master::{
        Config as MasterConfig, Coordinator, CoordinatorApi, HttpHostConnector, InMemoryRegistry,
        InMemoryResilienceStore, ResilienceStore, ServiceRegistry,
    };

    async fn spawn_master() -> (Arc<Coordinator>, Arc<InMemoryResilienceStore>, String) {
        let config = MasterConfig::default();
        let resilience = Arc::new(InMemoryResilienceStore::new());
        let coordinator = Arc::new(Coordinator::new(
            config.clone(),
            Arc::new(InMemoryRegistry::new()),
            resilience.clone(),
            Arc::new(HttpHostConnector::new(config.remote_call_timeout(), None)),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_router(coordinator.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (coordinator, resilience, format!("http://{}", addr))
    }

    fn worker_config(master_url: String) -> Arc<Config> {
        Arc::new(Config {
            master_url,
            worker_id: ServiceId::new("w1"),
            heartbeat_interval_secs: 1,
            reconnect_delay_secs: 1,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn test_register_heartbeat_unregister() {
        let (coordinator, _, url) = spawn_master().await;
        let connection = MasterConnection::new(worker_config(url));

        let interval = connection.register().await.unwrap();
        assert_eq!(interval, Duration::from_secs(1));
        assert_eq!(coordinator.registry().list_all().await.len(), 1);
        assert!(connection.heartbeat().await.unwrap());

        connection.unregister().await.unwrap();
        assert!(!connection.heartbeat().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_registers_again_when_forgotten() {
        let (coordinator, _, url) = spawn_master().await;
        let connection = Arc::new(MasterConnection::new(worker_config(url)));
        let shutdown = CancellationToken::new();
        let handle = {
            let connection = connection.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { connection.run(shutdown).await })
        };

        let registered = || async {
            loop {
                if coordinator.registry().list_all().await.len() == 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), registered())
            .await
            .unwrap();

        coordinator.unregister(&ServiceId::new("w1")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), registered())
            .await
            .unwrap();

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoints_reach_the_resilience_store() {
        let (_, resilience, url) = spawn_master().await;
        let connection = MasterConnection::new(worker_config(url));
        let task_id = ComputationTaskId::new("t1");
        resilience.register_run(&task_id, Vec::new()).await;

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(CheckpointData::new(task_id.clone(), 4, json!({ "value": 0.3 })))
            .unwrap();
        drop(tx);
        connection
            .forward_checkpoints(rx, CancellationToken::new())
            .await;

        let latest = resilience.latest_checkpoint(&task_id).await.unwrap();
        assert_eq!(latest.step, 4);
    }
}
