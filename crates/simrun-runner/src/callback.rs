//! HTTP server receiving restart/recover callbacks from the master server.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use simrun_core::ComputationTaskId;
use simrun_proto::{paths, Ack, ErrorResponse, RecoverTaskRequest};

use crate::error::RunnerError;
use crate::task_runner::TaskRunner;

struct CallbackError(RunnerError);

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let code = self.0.error_code();
        let status =
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse::new(code, self.0.to_string()))).into_response()
    }
}

/// Create the callback router for `runner`.
pub fn create_callback_router(runner: Arc<TaskRunner>) -> Router {
    Router::new()
        .route(paths::TASK_RESTART, post(restart_task))
        .route(paths::TASK_RECOVER, post(recover_task))
        .layer(TraceLayer::new_for_http())
        .with_state(runner)
}

async fn restart_task(
    State(runner): State<Arc<TaskRunner>>,
    Path(task_id): Path<String>,
) -> Result<Json<Ack>, CallbackError> {
    let task_id = ComputationTaskId::new(task_id);
    info!(task_id = %task_id, "Restart requested by master");
    runner.requeue(&task_id, None).await.map_err(CallbackError)?;
    Ok(Json(Ack::ok()))
}

async fn recover_task(
    State(runner): State<Arc<TaskRunner>>,
    Path(task_id): Path<String>,
    Json(request): Json<RecoverTaskRequest>,
) -> Result<Json<Ack>, CallbackError> {
    let task_id = ComputationTaskId::new(task_id);
    info!(task_id = %task_id, step = request.checkpoint.step, "Recovery requested by master");
    runner
        .requeue(&task_id, Some(request.checkpoint))
        .await
        .map_err(CallbackError)?;
    Ok(Json(Ack::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use simrun_proto::ErrorCode;
    use tokio::net::TcpListener;

    use simrun_core::{CheckpointData, ModelReference, TaskConfiguration};
    use simrun_master::transport::{client_with_timeout, HttpRunnerCallback};
    use simrun_master::RemoteRunner;

    use crate::config::RunnerConfig;
    use crate::controller::CollectingController;

    async fn serve(runner: Arc<TaskRunner>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_callback_router(runner))
                .await
                .unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_callbacks_requeue_runs() {
        let runner = TaskRunner::new(RunnerConfig::default());
        let config = TaskConfiguration::new(ModelReference::new("inline:"));
        runner
            .schedule_configurations(Arc::new(CollectingController::new()), vec![config.clone()])
            .await
            .unwrap();
        let ident = runner.get_computation_task_id(&config).await.unwrap();

        let base = serve(runner.clone()).await;
        let callback = HttpRunnerCallback::new(base, client_with_timeout(None));

        callback.restart_task(&ident.id).await.unwrap();
        callback
            .recover_task(
                &ident.id,
                CheckpointData::new(ident.id.clone(), 3, json!({ "value": 0.1 })),
            )
            .await
            .unwrap();
        assert_eq!(runner.queued().await, 3);

        let err = callback
            .restart_task(&ComputationTaskId::new("unknown"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnknownTask));
    }
}
