use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cluster::credentials::CredentialError;
use crate::cluster::{
    CapacityReport, CreatedTask, GatewayError, OperationStatus, Quantity, TaskError, TaskId,
    TaskRecord, TaskSpec,
};
use crate::server::access::{open_access, AccessError, AccessRequest, AccessResponse, PortForward};
use crate::server::state::AppState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Errors returned by HTTP handlers, rendered as a failed `OperationStatus`
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("Invalid request body: {}", .0.body_text())]
    Body(#[from] JsonRejection),
}

fn gateway_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
        GatewayError::AlreadyExists { .. } => StatusCode::CONFLICT,
        GatewayError::Platform(_) => StatusCode::BAD_GATEWAY,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Task(e) => match e {
                TaskError::InvalidName(_) | TaskError::Validation(_) => StatusCode::BAD_REQUEST,
                TaskError::NotFound(_) => StatusCode::NOT_FOUND,
                TaskError::AlreadyExists(_) => StatusCode::CONFLICT,
                TaskError::DeletionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                TaskError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
                TaskError::Platform(g) => gateway_status(g),
            },
            ApiError::Gateway(g) => gateway_status(g),
            ApiError::Body(_) => StatusCode::BAD_REQUEST,
            ApiError::Access(e) => match e {
                AccessError::InvalidService(_) => StatusCode::BAD_REQUEST,
                AccessError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
                AccessError::Credentials(CredentialError::Gateway(g)) => gateway_status(g),
                AccessError::Credentials(CredentialError::LogTimeout { .. }) => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                AccessError::Credentials(CredentialError::Io(_)) => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "Request failed");
        }
        (status, Json(OperationStatus::failure(self.to_string()))).into_response()
    }
}

/// Body of `POST /add-resources`; amounts replace the current ones
#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    #[serde(rename = "taskName")]
    pub task_name: String,
    pub cpus: Quantity,
    pub gpus: Quantity,
}

#[derive(Debug, Serialize)]
pub struct ResizeResponse {
    #[serde(rename = "podName")]
    pub pod_name: TaskId,
}

#[derive(Debug, Serialize)]
pub struct TaskNames {
    pub tasks: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub tasks: Vec<TaskRecord>,
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn create_pod(
    State(state): State<AppState>,
    payload: Result<Json<TaskSpec>, JsonRejection>,
) -> Result<Json<CreatedTask>, ApiError> {
    let Json(spec) = payload?;
    Ok(Json(state.manager.create(&spec).await?))
}

pub async fn available_resources(
    State(state): State<AppState>,
) -> Result<Json<CapacityReport>, ApiError> {
    let capacity = state.accountant.compute_capacity().await?;
    Ok(Json(capacity.report()))
}

pub async fn add_resources(
    State(state): State<AppState>,
    payload: Result<Json<ResizeRequest>, JsonRejection>,
) -> Result<Json<ResizeResponse>, ApiError> {
    let Json(request) = payload?;
    let pod_name = state
        .manager
        .resize(&request.task_name, request.cpus, request.gpus, &state.shutdown)
        .await?;
    Ok(Json(ResizeResponse { pod_name }))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_name): Path<String>,
) -> Result<Json<OperationStatus>, ApiError> {
    let outcome = state.manager.delete(&task_name).await?;
    let status = OperationStatus::success(format!("Task '{}' deleted", outcome.task_id))
        .with_details(serde_json::json!({
            "controllerRemoved": outcome.controller_removed,
            "workloadUnitRemoved": outcome.workload_unit_removed,
            "exposureUnitRemoved": outcome.exposure_unit_removed,
        }));
    Ok(Json(status))
}

/// Bare task names
pub async fn tasks(State(state): State<AppState>) -> Result<Json<TaskNames>, ApiError> {
    let tasks = state.manager.task_names().await?;
    Ok(Json(TaskNames { tasks }))
}

/// Detailed task records
pub async fn list_tasks(State(state): State<AppState>) -> Result<Json<TaskList>, ApiError> {
    let tasks = state.manager.list().await?;
    Ok(Json(TaskList { tasks }))
}

pub async fn access_jupyter(
    State(state): State<AppState>,
    payload: Result<Json<AccessRequest>, JsonRejection>,
) -> Result<Json<AccessResponse>, ApiError> {
    let Json(request) = payload?;
    let forward = PortForward {
        command: state.config.port_forward_command.clone(),
        namespace: state.config.namespace.clone(),
        service_port: state.config.service_port,
        log_timeout: state.config.log_read_timeout(),
    };
    let response = open_access(state.gateway().as_ref(), &forward, &request).await?;
    Ok(Json(response))
}

/// Echo the caller's request ID, or assign one
async fn request_id(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/create-pod", post(create_pod))
        .route("/available-resources", get(available_resources))
        .route("/add-resources", post(add_resources))
        .route("/delete-task/{task_name}", delete(delete_task))
        .route("/tasks", get(tasks))
        .route("/list-tasks", get(list_tasks))
        .route("/access-jupyter", post(access_jupyter))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::gateway::mock::MockGateway;
    use crate::config::{DeletionConfig, ServiceConfig};
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            port_forward_command: "true".to_string(),
            deletion: DeletionConfig {
                poll_interval_ms: 5,
                timeout_secs: 1,
            },
            ..Default::default()
        }
    }

    fn create_test_app(gateway: Arc<MockGateway>) -> Router {
        create_router(AppState::new(gateway, test_config()))
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_body(name: &str) -> serde_json::Value {
        serde_json::json!({
            "taskName": name,
            "cpus": "2",
            "gpus": "1",
            "imageName": "jupyter/base-notebook"
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app(Arc::new(MockGateway::new()));
        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_pod_endpoint() {
        let app = create_test_app(Arc::new(MockGateway::new()));
        let response = app
            .oneshot(json_request(Method::POST, "/create-pod", create_body("My Task")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["podName"], "my-task");
        assert_eq!(body["nodePort"], 30000);
        assert_eq!(body["serviceURL"], "http://localhost:30000");
    }

    #[tokio::test]
    async fn test_create_pod_invalid_name() {
        let gateway = Arc::new(MockGateway::new());
        let app = create_test_app(gateway.clone());
        let response = app
            .oneshot(json_request(Method::POST, "/create-pod", create_body("bad_name!")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(gateway.unit("bad_name!").is_none());
    }

    #[tokio::test]
    async fn test_create_pod_conflict() {
        let app = create_test_app(Arc::new(MockGateway::new()));
        let first = app
            .clone()
            .oneshot(json_request(Method::POST, "/create-pod", create_body("dup")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(json_request(Method::POST, "/create-pod", create_body("dup")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_malformed_create_body_is_bad_request() {
        let gateway = Arc::new(MockGateway::new());
        let app = create_test_app(gateway.clone());
        let bodies = [
            serde_json::json!({"taskName": "t", "gpus": "0", "imageName": "jupyter/base"}),
            serde_json::json!({"taskName": "t", "cpus": "two", "gpus": "0", "imageName": "jupyter/base"}),
            serde_json::json!({"taskName": "t", "cpus": "9000000000000000", "gpus": "0", "imageName": "jupyter/base"}),
        ];

        for body in bodies {
            let response = app
                .clone()
                .oneshot(json_request(Method::POST, "/create-pod", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = body_json(response).await;
            assert_eq!(body["success"], false);
            assert!(body["message"]
                .as_str()
                .unwrap()
                .starts_with("Invalid request body"));
        }
        assert_eq!(
            gateway
                .create_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn test_malformed_resize_body_is_bad_request() {
        let app = create_test_app(Arc::new(MockGateway::new()));
        let response = app
            .oneshot(json_request(
                Method::POST,
                "/add-resources",
                serde_json::json!({"taskName": "t", "gpus": "1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_available_resources_endpoint() {
        let gateway = Arc::new(MockGateway::new().with_node("n1", "8", "2"));
        let app = create_test_app(gateway);
        app.clone()
            .oneshot(json_request(Method::POST, "/create-pod", create_body("train")))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/available-resources")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["freeGPUs"], 1);
        assert_eq!(body["totalAllocatableGPUs"], 2);
        assert_eq!(body["totalUsedGPUs"], 1);
        assert_eq!(body["freeCPUs"], 6.0);
        assert_eq!(body["totalUsedCPUs"], 2.0);
    }

    #[tokio::test]
    async fn test_add_resources_endpoint() {
        let gateway = Arc::new(MockGateway::new());
        let app = create_test_app(gateway.clone());
        app.clone()
            .oneshot(json_request(Method::POST, "/create-pod", create_body("train")))
            .await
            .unwrap();

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/add-resources",
                serde_json::json!({"taskName": "train", "cpus": "4", "gpus": "2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["podName"], "train");
        assert_eq!(
            gateway.unit("train").unwrap().requested().gpu,
            Quantity::from_units(2)
        );
    }

    #[tokio::test]
    async fn test_add_resources_missing_task() {
        let app = create_test_app(Arc::new(MockGateway::new()));
        let response = app
            .oneshot(json_request(
                Method::POST,
                "/add-resources",
                serde_json::json!({"taskName": "ghost", "cpus": "1", "gpus": "0"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_add_resources_deletion_timeout() {
        let gateway = Arc::new(MockGateway::new());
        let app = create_test_app(gateway.clone());
        app.clone()
            .oneshot(json_request(Method::POST, "/create-pod", create_body("stuck")))
            .await
            .unwrap();
        gateway.stick_deletion("stuck");

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/add-resources",
                serde_json::json!({"taskName": "stuck", "cpus": "2", "gpus": "2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = app.oneshot(get_request("/list-tasks")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["tasks"][0]["pendingResize"]["phase"], "WaitingForDeletion");
    }

    #[tokio::test]
    async fn test_add_resources_after_shutdown() {
        let gateway = Arc::new(MockGateway::new());
        let state = AppState::new(gateway.clone(), test_config());
        let shutdown = state.shutdown.clone();
        let app = create_router(state);
        app.clone()
            .oneshot(json_request(Method::POST, "/create-pod", create_body("busy")))
            .await
            .unwrap();
        gateway.stick_deletion("busy");
        shutdown.cancel();

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/add-resources",
                serde_json::json!({"taskName": "busy", "cpus": "2", "gpus": "0"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_delete_task_is_idempotent() {
        let app = create_test_app(Arc::new(MockGateway::new()));
        app.clone()
            .oneshot(json_request(Method::POST, "/create-pod", create_body("gone")))
            .await
            .unwrap();

        for removed in [true, false] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method(Method::DELETE)
                        .uri("/delete-task/gone")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["success"], true);
            assert_eq!(body["details"]["workloadUnitRemoved"], removed);
        }
    }

    #[tokio::test]
    async fn test_task_listings() {
        let app = create_test_app(Arc::new(MockGateway::new()));
        app.clone()
            .oneshot(json_request(Method::POST, "/create-pod", create_body("My Task")))
            .await
            .unwrap();

        let response = app.clone().oneshot(get_request("/tasks")).await.unwrap();
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"tasks": ["my-task"]})
        );

        let response = app.oneshot(get_request("/list-tasks")).await.unwrap();
        let body = body_json(response).await;
        let task = &body["tasks"][0];
        assert_eq!(task["name"], "my-task");
        assert_eq!(task["imageName"], "jupyter/base-notebook");
        assert_eq!(task["cpus"], "2");
        assert_eq!(task["gpus"], "1");
        assert_eq!(task["nodePort"], 30000);
    }

    #[tokio::test]
    async fn test_access_jupyter_endpoint() {
        let gateway = Arc::new(
            MockGateway::new().with_logs("my-task", "http://127.0.0.1:8888/lab?token=f00d\n"),
        );
        let app = create_test_app(gateway);
        let response = app
            .oneshot(json_request(
                Method::POST,
                "/access-jupyter",
                serde_json::json!({"port": 9000, "serviceName": "my-task-service"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["token"], "f00d");
        assert_eq!(body["url"], "http://localhost:9000/?token=f00d");
    }

    #[tokio::test]
    async fn test_request_id_echoed() {
        let app = create_test_app(Arc::new(MockGateway::new()));
        let id = Uuid::new_v4().to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(REQUEST_ID_HEADER, &id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap(),
            id
        );
    }
}
