//! HTTP API of the master server.
//!
//! Provides endpoints for:
//! - Service registration and heartbeats (`/v1/services`)
//! - Run booking, execution, stop and inspection (`/v1/runs`)
//! - Checkpoint and breakdown reports from hosts
//! - Shutdown (`/v1/shutdown`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use simrun_proto::paths;

use crate::coordinator::Coordinator;

mod error;
mod handlers;

pub use error::ApiError;

/// Create the HTTP router.
pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Services
        .route(
            paths::SERVICES,
            get(handlers::list_services).post(handlers::register_service),
        )
        .route(paths::SERVICE, axum::routing::delete(handlers::unregister_service))
        .route(paths::SERVICE_HEARTBEAT, post(handlers::heartbeat))
        // Runs
        .route(
            paths::RUNS,
            get(handlers::list_runs).post(handlers::execute_configuration),
        )
        .route(paths::RUN_EXECUTE, post(handlers::execute_run))
        .route(paths::RUN_STOP, post(handlers::stop_run))
        .route(paths::RUN_PARTITION, get(handlers::get_partition))
        .route(paths::RUN_PROPERTY, get(handlers::get_run_property))
        .route(paths::RUN_CHECKPOINTS, post(handlers::record_checkpoint))
        .route(paths::RUN_BREAKDOWN, post(handlers::report_breakdown))
        .route(paths::SHUTDOWN, post(handlers::shut_down))
        // Observability
        .route(paths::HEALTH, get(handlers::health_check))
        .route(paths::METRICS, get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::TcpListener;

    use simrun_core::{ModelReference, ServiceDescriptor, ServiceId, TaskConfiguration};
    use simrun_proto::{
        ErrorCode, ErrorResponse, ExecuteConfigurationRequest, RegisterServiceRequest,
        RegisterServiceResponse, RemoteInitialization,
    };

    use crate::api::CoordinatorApi;
    use crate::config::Config;
    use crate::registry::InMemoryRegistry;
    use crate::resilience::InMemoryResilienceStore;
    use crate::transport::HttpHostConnector;

    async fn spawn_master(config: Config) -> String {
        let coordinator = Arc::new(Coordinator::new(
            config.clone(),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryResilienceStore::new()),
            Arc::new(HttpHostConnector::new(config.remote_call_timeout(), None)),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(coordinator)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_reports_coordinator_state() {
        let config = Config::default();
        let coordinator = Arc::new(Coordinator::new(
            config.clone(),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryResilienceStore::new()),
            Arc::new(HttpHostConnector::new(config.remote_call_timeout(), None)),
        ));
        coordinator
            .register(ServiceDescriptor::new(ServiceId::new("w1"), "simulation", "http://127.0.0.1:1"))
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let router = create_router(coordinator.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let response = reqwest::get(paths::url(&base, paths::HEALTH)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["services"], json!(1));
        assert_eq!(body["runs"], json!(0));
        assert_eq!(body["version"], json!(config.framework_version));

        coordinator.shut_down().await.unwrap();
        let response = reqwest::get(paths::url(&base, paths::HEALTH)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], json!("shut_down"));
    }

    #[tokio::test]
    async fn test_register_and_list_services() {
        let base = spawn_master(Config::default()).await;
        let client = reqwest::Client::new();

        let response: RegisterServiceResponse = client
            .post(paths::url(&base, paths::SERVICES))
            .json(&RegisterServiceRequest {
                descriptor: ServiceDescriptor::new(ServiceId::new("w1"), "simulation", "http://w1"),
            })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(response.warning.is_none());

        let services: Vec<serde_json::Value> = client
            .get(paths::url(&base, paths::SERVICES))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(services.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_run_is_404_with_code() {
        let base = spawn_master(Config::default()).await;
        let response = reqwest::Client::new()
            .post(paths::url(&base, "/v1/runs/missing/stop"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.code, ErrorCode::UnknownTask);
    }

    #[tokio::test]
    async fn test_execute_configuration_without_hosts_fails_cleanly() {
        let config = Config {
            booking_attempts: 2,
            booking_retry_delay_ms: 1,
            booking_max_delay_ms: 1,
            ..Config::default()
        };
        let base = spawn_master(config).await;

        let init: RemoteInitialization = reqwest::Client::new()
            .post(paths::url(&base, paths::RUNS))
            .json(&ExecuteConfigurationRequest {
                config: TaskConfiguration::new(ModelReference::new("inline:")).on_master_server(),
                task_id: None,
                callback_url: None,
                resume: None,
            })
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!init.is_initialized());
    }
}
