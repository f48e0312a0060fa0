// SPDX-License-Identifier: MIT

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::core::error::ConfigError;
use crate::core::scripted::{ExperimentScript, ScriptedSessionFactory};
use crate::flow::graph::FlowExecutor;
use crate::flow::state::ExecutionState;
use crate::flow::workflow::{FlowDefinition, FlowGraphBuilder};

const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Inline flow documents plus the scripts replayed for each configuration key
#[derive(Debug, Deserialize)]
pub struct ExecutionRequest {
    #[serde(flatten)]
    pub definition: FlowDefinition,
    #[serde(default)]
    pub scripts: HashMap<String, ExperimentScript>,
}

/// Execution states of running flows, by execution id
#[derive(Clone, Default)]
pub struct AppState {
    executions: Arc<Mutex<HashMap<Uuid, Arc<ExecutionState>>>>,
}

impl AppState {
    fn register(&self, id: Uuid, state: Arc<ExecutionState>) {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, state);
    }

    fn remove(&self, id: &Uuid) {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn get(&self, id: &Uuid) -> Option<Arc<ExecutionState>> {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/executions", post(create_execution))
        .route("/api/executions/stream", post(stream_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/end", post(end_execution))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(AppState::default());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    log::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn prepare(request: ExecutionRequest) -> Result<FlowExecutor, ConfigError> {
    let settings = request.definition.settings.clone();
    settings.validate()?;
    let graph = FlowGraphBuilder::from_definition(&request.definition).build()?;
    let factory = ScriptedSessionFactory::from_scripts(request.scripts);
    Ok(FlowExecutor::new(Arc::new(graph), Arc::new(factory)).with_settings(settings))
}

fn bad_request(e: ConfigError) -> (StatusCode, Json<Value>) {
    log::warn!("Rejected flow definition: {}", e);
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("Invalid flow definition: {}", e) })),
    )
}

async fn create_execution(
    State(app): State<AppState>,
    Json(payload): Json<ExecutionRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut executor = prepare(payload).map_err(bad_request)?;
    let id = Uuid::new_v4();
    app.register(id, executor.execution_state());

    let report = executor.execute().await;
    app.remove(&id);

    Ok(Json(json!({
        "execution_id": id,
        "status": executor.status(),
        "report": report,
        "log": executor.execution_log().lines(),
        "visits": executor.visits(),
    })))
}

async fn stream_execution(
    State(app): State<AppState>,
    Json(payload): Json<ExecutionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let executor = prepare(payload).map_err(bad_request)?.with_observer(tx);
    let id = Uuid::new_v4();
    app.register(id, executor.execution_state());

    log::info!("Starting streaming execution {}", id);
    let handle = executor.spawn();
    tokio::spawn(async move {
        match handle.await {
            Ok(executor) => log::info!(
                "Execution {} finished after {} node(s)",
                id,
                executor.visits().len()
            ),
            Err(e) => log::error!("Execution {} task failed: {}", id, e),
        }
        app.remove(&id);
    });

    let opening = Event::default()
        .event("execution")
        .json_data(json!({ "execution_id": id }))
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
    let events = UnboundedReceiverStream::new(rx).map(|event| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
    });
    let stream = tokio_stream::once(Ok(opening)).chain(events);

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(1))))
}

async fn cancel_execution(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<Value>) {
    command_execution(&app, id, |state| state.cancel()).await
}

async fn end_execution(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<Value>) {
    command_execution(&app, id, |state| state.end_experiment()).await
}

async fn command_execution(
    app: &AppState,
    id: Uuid,
    issue: impl FnOnce(&ExecutionState),
) -> (StatusCode, Json<Value>) {
    let Some(state) = app.get(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Execution not found" })),
        );
    };
    issue(&state);
    let acknowledged = state.wait_for_acknowledgement(ACK_TIMEOUT).await;
    (
        StatusCode::OK,
        Json(json!({
            "execution_id": id,
            "command": state.command(),
            "acknowledged": acknowledged,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(structure: Value) -> ExecutionRequest {
        serde_json::from_value(json!({
            "structure": structure,
            "flows": {"cfgA": {"Test Type": "Loops", "Loops": 5}},
            "scripts": {"cfgA": ["FAIL", "FAIL", "FAIL", "FAIL", "FAIL"]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_execution_returns_report_and_log() {
        let payload = request(json!({
            "start": {"instanceType": "StartNode", "outputNodeMap": {"1": "a"}},
            "a": {"name": "AllFail A", "instanceType": "AllFail", "flow": "cfgA", "outputNodeMap": {"1": "end"}},
            "end": {"instanceType": "EndNode"}
        }));
        let app = AppState::default();

        let Json(body) = create_execution(State(app.clone()), Json(payload))
            .await
            .unwrap();

        assert_eq!(body["report"]["execution_summary"]["completed_normally"], true);
        assert_eq!(body["report"]["execution_summary"]["nodes_executed"], 3);
        assert_eq!(body["status"]["state"], "terminated");
        assert_eq!(body["visits"][1]["output_port"], 1);
        assert!(!body["log"].as_array().unwrap().is_empty());
        assert!(app.executions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_definition_is_bad_request() {
        let payload = request(json!({
            "start": {"instanceType": "StartNode", "outputNodeMap": {"1": "missing"}}
        }));
        let (status, Json(body)) = create_execution(State(AppState::default()), Json(payload))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution() {
        let (status, _) = cancel_execution(State(AppState::default()), Path(Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_request_accepts_settings_and_overrides() {
        let payload: ExecutionRequest = serde_json::from_value(json!({
            "structure": {},
            "flows": {},
            "overrides": {"cfgA": {"Loops": 3}},
            "settings": {"hop_limit": 5}
        }))
        .unwrap();
        assert_eq!(payload.definition.settings.hop_limit, 5);
        assert_eq!(payload.definition.overrides["cfgA"]["Loops"], 3);
        assert!(payload.scripts.is_empty());
    }
}
