//! Run API served to the master.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::warn;

use simrun_core::{ComputationTaskId, RunInformation};
use simrun_proto::{paths, Ack, ErrorCode, ErrorResponse, InitializeRunRequest, RunPropertyResponse};

use crate::executor::{RunHost, WorkerError};

struct ApiError {
    code: ErrorCode,
    message: String,
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse::new(self.code, self.message))).into_response()
    }
}

pub fn create_router(host: Arc<RunHost>) -> Router {
    Router::new()
        .route(paths::HEALTH, get(health))
        .route(paths::WORKER_INIT, post(initialize))
        .route(paths::WORKER_START, post(start))
        .route(paths::WORKER_STOP, post(stop))
        .route(paths::WORKER_PROPERTY, get(property))
        .route(paths::WORKER_ABORT, post(abort))
        .layer(TraceLayer::new_for_http())
        .with_state(host)
}

async fn health(State(host): State<Arc<RunHost>>) -> Json<Value> {
    Json(json!({ "status": "ok", "hosted_runs": host.hosted().await }))
}

async fn initialize(
    State(host): State<Arc<RunHost>>,
    Path(task_id): Path<String>,
    Json(request): Json<InitializeRunRequest>,
) -> Result<Json<RunInformation>, ApiError> {
    if request.task_id.as_str() != task_id {
        return Err(ApiError {
            code: ErrorCode::InvalidRequest,
            message: format!("request is for {}, not {}", request.task_id, task_id),
        });
    }
    Ok(Json(host.initialize(request).await?))
}

async fn start(
    State(host): State<Arc<RunHost>>,
    Path(task_id): Path<String>,
) -> Result<Json<RunInformation>, ApiError> {
    Ok(Json(host.start(&ComputationTaskId::new(task_id)).await?))
}

async fn stop(
    State(host): State<Arc<RunHost>>,
    Path(task_id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    host.stop(&ComputationTaskId::new(task_id)).await?;
    Ok(Json(Ack::ok()))
}

async fn property(
    State(host): State<Arc<RunHost>>,
    Path((task_id, name)): Path<(String, String)>,
) -> Result<Json<RunPropertyResponse>, ApiError> {
    let value = host.property(&ComputationTaskId::new(task_id), &name).await?;
    Ok(Json(RunPropertyResponse { name, value }))
}

async fn abort(State(host): State<Arc<RunHost>>) -> Json<Ack> {
    let affected = host.abort().await;
    warn!(runs = affected, "Abort received from master");
    Json(Ack::ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use simrun_core::{
        DefaultModelReader, ModelReference, Partition, ServiceDescriptor, ServiceId,
        SetupStrategies, TaskConfiguration,
    };
    use simrun_master::{HostConnector, HttpHostConnector, RemoteHost};

    async fn serve() -> String {
        let host = Arc::new(RunHost::new(
            Arc::new(DefaultModelReader::default()),
            SetupStrategies::with_builtin(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(host)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_master_drives_worker_over_http() {
        let endpoint = serve().await;
        let connector = HttpHostConnector::new(Duration::from_secs(5), None);
        let remote = connector.connect(&ServiceDescriptor::new(
            ServiceId::new("w1"),
            simrun_core::SIMULATION_CAPABILITY,
            endpoint,
        ));

        let task_id = ComputationTaskId::generate();
        let config = TaskConfiguration::new(ModelReference::new(r#"inline:{"steps": 3}"#));
        let init = remote
            .initialize(InitializeRunRequest {
                task_id: task_id.clone(),
                config,
                auxiliary: Vec::new(),
                partition: Partition::new(0),
                resume: None,
            })
            .await
            .unwrap();
        assert!(!init.is_failed());

        let info = remote.start(&task_id).await.unwrap();
        assert!(info.is_success());

        let err = remote.stop(&task_id).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnknownTask));
        remote.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_run_end_to_end() {
        use simrun_master::http::create_router as master_router;
        use simrun_master::{
            Config as MasterConfig, Coordinator, CoordinatorApi, InMemoryRegistry,
            InMemoryResilienceStore,
        };
        use simrun_runner::{CollectingController, HttpCoordinatorClient, RunnerConfig, TaskRunner};

        let worker_endpoint = serve().await;
        let master_config = MasterConfig::default();
        let coordinator = Arc::new(Coordinator::new(
            master_config.clone(),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryResilienceStore::new()),
            Arc::new(HttpHostConnector::new(master_config.remote_call_timeout(), None)),
        ));
        coordinator
            .register(ServiceDescriptor::new(
                ServiceId::new("w1"),
                simrun_core::SIMULATION_CAPABILITY,
                worker_endpoint,
            ))
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let master_url = format!("http://{}", listener.local_addr().unwrap());
        let router = master_router(coordinator.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let runner = TaskRunner::builder(RunnerConfig::default())
            .with_coordinator(Arc::new(HttpCoordinatorClient::new(
                master_url,
                Duration::from_secs(5),
            )))
            .build();
        let controller = Arc::new(CollectingController::new());
        let config = TaskConfiguration::new(ModelReference::new(r#"inline:{"steps": 3}"#))
            .on_master_server();
        runner
            .schedule_configurations(controller.clone(), vec![config])
            .await
            .unwrap();
        let loop_handle = tokio::spawn(runner.clone().run());

        let results = tokio::time::timeout(Duration::from_secs(10), controller.wait_for(1))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_success());
        assert!(coordinator.runs().await.is_empty());

        runner.stop();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_property_of_unknown_run_is_not_found() {
        let endpoint = serve().await;
        let response = reqwest::get(paths::url(
            &endpoint,
            &paths::run_property(&ComputationTaskId::new("missing"), "step"),
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
