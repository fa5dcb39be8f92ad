use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use askql_core::{AgentError, FrameSender};
use askql_tools::{validate_sql, SqlDialect};
use askql_types::{ErrorBody, QueryRequest, QueryResponse};
use askql_wire::{WireFormat, WireFrame};

use crate::{ActiveRun, AppState};

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("askql server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/api/query", post(query))
        .route("/api/query/stream", post(query_stream))
        .route("/api/session", get(list_sessions).post(create_session))
        .route("/api/session/{id}", get(get_session))
        .route("/api/session/{id}/cancel", post(cancel_session))
        .route("/api/tools", get(list_tools))
        .route("/api/providers", get(list_providers))
        .route("/api/sql/validate", post(validate_sql_route))
        .route("/api/config", get(get_config).patch(patch_config))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody::new(code, message))).into_response()
}

fn agent_error_response(err: &AgentError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, err.code(), err.user_message())
}

fn conflict_response(session_id: &str, active: &ActiveRun) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "error": {
                "code": "SESSION_RUN_CONFLICT",
                "message": "session already has an active run",
            },
            "session_id": session_id,
            "active_run": active,
        })),
    )
        .into_response()
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "active_runs": state.runs.len().await,
    }))
}

/// Assigns a session id when the client sent none and claims the session.
async fn start_run(
    state: &AppState,
    request: &mut QueryRequest,
) -> Result<(String, ActiveRun), Response> {
    if request.query.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "EMPTY_QUERY",
            "query must not be empty",
        ));
    }
    let session_id = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.session_id = Some(session_id.clone());

    match state
        .runs
        .acquire(&session_id, Uuid::new_v4().to_string())
        .await
    {
        Ok(run) => Ok((session_id, run)),
        Err(active) => {
            tracing::warn!(
                "rejecting run for session {}: {} is active",
                session_id,
                active.run_id
            );
            Err(conflict_response(&session_id, &active))
        }
    }
}

fn spawn_query(
    state: AppState,
    session_id: String,
    run: ActiveRun,
    request: QueryRequest,
    sink: Option<FrameSender>,
    cancel: CancellationToken,
) -> JoinHandle<Result<QueryResponse, AgentError>> {
    let release = state.runs.release_on_drop(&session_id, &run);
    tokio::spawn(async move {
        let result = state
            .engine
            .run_as(run.run_id, request, sink, cancel)
            .await;
        release.finish().await;
        result
    })
}

async fn query(State(state): State<AppState>, Json(mut request): Json<QueryRequest>) -> Response {
    let (session_id, run) = match start_run(&state, &mut request).await {
        Ok(claimed) => claimed,
        Err(resp) => return resp,
    };
    let cancel = CancellationToken::new();
    // Dropped with the handler when the client goes away.
    let _guard = cancel.clone().drop_guard();
    match spawn_query(state, session_id, run, request, None, cancel).await {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(err)) => agent_error_response(&err),
        Err(err) => {
            tracing::error!("query task failed: {}", err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Something went wrong while answering.",
            )
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    format: Option<String>,
}

fn sse_event(frame: &WireFrame) -> Event {
    let data = serde_json::to_string(frame).unwrap_or_else(|err| {
        tracing::warn!("dropping unencodable frame {}: {}", frame.seq, err);
        String::new()
    });
    Event::default().event(frame.kind()).data(data)
}

fn ndjson_line(frame: &WireFrame) -> String {
    WireFormat::Ndjson.encode(frame).unwrap_or_else(|err| {
        tracing::warn!("dropping unencodable frame {}: {}", frame.seq, err);
        String::new()
    })
}

async fn query_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    Json(mut request): Json<QueryRequest>,
) -> Response {
    let format = match params.format.as_deref() {
        None => WireFormat::default(),
        Some(raw) => match WireFormat::parse(raw) {
            Some(format) => format,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_FORMAT",
                    format!("unknown stream format `{raw}`"),
                )
            }
        },
    };
    let (session_id, run) = match start_run(&state, &mut request).await {
        Ok(claimed) => claimed,
        Err(resp) => return resp,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    spawn_query(state, session_id, run, request, Some(tx), cancel);

    // The guard lives as long as the response body, so a disconnect cancels the run.
    let frames = UnboundedReceiverStream::new(rx);
    match format {
        WireFormat::Sse => {
            let events = frames.map(move |frame| {
                let _held = &guard;
                Ok::<_, Infallible>(sse_event(&frame))
            });
            Sse::new(events)
                .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
                .into_response()
        }
        WireFormat::Ndjson => {
            let lines = frames.map(move |frame| {
                let _held = &guard;
                Ok::<_, Infallible>(ndjson_line(&frame))
            });
            (
                [(header::CONTENT_TYPE, format.content_type())],
                Body::from_stream(lines),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateSessionInput {
    title: Option<String>,
    data_source_ids: Vec<String>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(input): Json<CreateSessionInput>,
) -> Response {
    match state
        .engine
        .sessions()
        .create(input.title, input.data_source_ids)
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(err) => {
            tracing::error!("failed to create session: {:#}", err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "could not create session",
            )
        }
    }
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.sessions().list().await)
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.sessions().get(&id).await {
        Some(session) => Json(session).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "SESSION_NOT_FOUND",
            format!("no session `{id}`"),
        ),
    }
}

async fn cancel_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let active = state.runs.get(&id).await;
    let cancelled = state.engine.cancel(&id).await;
    if cancelled {
        tracing::info!(
            "cancel requested for session {} (run {})",
            id,
            active.as_ref().map_or("-", |run| run.run_id.as_str())
        );
    }
    Json(json!({ "session_id": id, "cancelled": cancelled, "active_run": active }))
}

async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    let tools = state.engine.orchestrator().tools();
    Json(json!({
        "tools": tools.schemas(),
        "data_sources": tools.data_sources().ids().await,
    }))
}

async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.orchestrator().providers().list().await)
}

#[derive(Debug, Deserialize)]
struct ValidateSqlInput {
    sql: String,
    #[serde(default)]
    dialect: Option<SqlDialect>,
}

async fn validate_sql_route(
    State(state): State<AppState>,
    Json(input): Json<ValidateSqlInput>,
) -> impl IntoResponse {
    let mut policy = state.engine.orchestrator().sql_policy().clone();
    if let Some(dialect) = input.dialect {
        policy = policy.with_dialect(dialect);
    }
    Json(validate_sql(&input.sql, &policy))
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.get_layers_value().await)
}

/// Persists to the project layer; running components pick it up on restart.
async fn patch_config(State(state): State<AppState>, Json(patch): Json<Value>) -> Response {
    if !patch.is_object() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_CONFIG",
            "config patch must be a JSON object",
        );
    }
    match state.config.patch_project(patch).await {
        Ok(_) => Json(state.config.get_layers_value().await).into_response(),
        Err(err) => {
            tracing::error!("failed to save config: {:#}", err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "could not save config",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    use askql_core::{AgentConfig, ConfigStore, Orchestrator, QueryEngine, SessionStore};
    use askql_providers::scripted::{ScriptedProvider, ScriptedTurn};
    use askql_providers::{Provider, ProviderRegistry};
    use askql_tools::{DataSourceRegistry, SqlGuardPolicy, SqliteDataSource, ToolRegistry};
    use askql_wire::{FrameDecoder, StreamEvent};

    const ORDERS: &str = "CREATE TABLE orders (id INTEGER PRIMARY KEY, total_amount REAL, order_date TEXT);
         INSERT INTO orders (total_amount, order_date) VALUES
           (400000.00, '2024-03-01'), (285449.00, '2024-07-15');";

    async fn test_state(provider: ScriptedProvider) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let sources = DataSourceRegistry::new();
        let sqlite = SqliteDataSource::in_memory("shop", ORDERS).expect("sqlite");
        sources.register(Arc::new(sqlite)).await;
        let orchestrator = Orchestrator::new(
            ProviderRegistry::from_providers(vec![Arc::new(provider) as Arc<dyn Provider>]),
            ToolRegistry::new(sources),
            AgentConfig::default(),
            SqlGuardPolicy::default(),
        );
        let engine = QueryEngine::new(orchestrator, Arc::new(SessionStore::in_memory()));
        let config = ConfigStore::new(dir.path().join("config.json"), None)
            .await
            .expect("config");
        (AppState::new(engine, config), dir)
    }

    fn answering() -> ScriptedProvider {
        ScriptedProvider::new()
            .with_turn(ScriptedTurn::tool_call(
                "execute_sql",
                json!({"sql": "SELECT SUM(total_amount) AS total_sales FROM orders"}),
            ))
            .with_turn(ScriptedTurn::text("Total sales are 685,449.00."))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(resp: Response) -> Value {
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&body).expect("json")
    }

    #[tokio::test]
    async fn global_health_route_returns_healthy_shape() {
        let (state, _dir) = test_state(ScriptedProvider::new()).await;
        let app = app_router(state);
        let req = Request::builder()
            .uri("/global/health")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = body_json(resp).await;
        assert_eq!(payload["healthy"], true);
        assert_eq!(payload["active_runs"], 0);
    }

    #[tokio::test]
    async fn query_returns_answer_and_table() {
        let (state, _dir) = test_state(answering()).await;
        let app = app_router(state.clone());
        let resp = app
            .oneshot(post_json(
                "/api/query",
                json!({"query": "What were total sales?", "session_id": "s1"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = body_json(resp).await;
        assert_eq!(payload["session_id"], "s1");
        assert!(payload["answer"]
            .as_str()
            .unwrap_or_default()
            .contains("685,449.00"));
        assert_eq!(payload["table"]["columns"][0], "total_sales");
        assert!(state.runs.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (state, _dir) = test_state(ScriptedProvider::new()).await;
        let resp = app_router(state)
            .oneshot(post_json("/api/query", json!({"query": "   "})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "EMPTY_QUERY");
    }

    #[tokio::test]
    async fn busy_session_returns_conflict() {
        let (state, _dir) = test_state(answering()).await;
        state
            .runs
            .acquire("busy", "run-1".to_string())
            .await
            .expect("claim");
        let resp = app_router(state)
            .oneshot(post_json(
                "/api/query",
                json!({"query": "total sales?", "session_id": "busy"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let payload = body_json(resp).await;
        assert_eq!(payload["error"]["code"], "SESSION_RUN_CONFLICT");
        assert_eq!(payload["active_run"]["run_id"], "run-1");
    }

    #[tokio::test]
    async fn denied_sql_maps_to_unprocessable() {
        let provider = ScriptedProvider::new().with_turn(ScriptedTurn::tool_call(
            "execute_sql",
            json!({"sql": "DELETE FROM orders"}),
        ));
        let (state, _dir) = test_state(provider).await;
        let resp = app_router(state.clone())
            .oneshot(post_json(
                "/api/query",
                json!({"query": "clear the orders", "session_id": "s2"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(resp).await["error"]["code"], "VALIDATION_ERROR");

        let session = state.engine.sessions().get("s2").await.expect("session");
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn ndjson_stream_ends_with_done() {
        let (state, _dir) = test_state(answering()).await;
        let resp = app_router(state)
            .oneshot(post_json(
                "/api/query/stream?format=ndjson",
                json!({"query": "What were total sales?"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/x-ndjson")
        );
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");

        let mut decoder = FrameDecoder::new(WireFormat::Ndjson);
        let mut frames = decoder.push(&text).expect("decode");
        frames.extend(decoder.finish().expect("finish"));
        let seqs = frames.iter().map(|f| f.seq).collect::<Vec<_>>();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert!(frames
            .iter()
            .any(|f| matches!(f.event, StreamEvent::ToolResult { success: true, .. })));
        assert!(matches!(
            frames.last().map(|f| &f.event),
            Some(StreamEvent::Done { .. })
        ));
    }

    #[tokio::test]
    async fn sse_stream_names_each_event() {
        let (state, _dir) = test_state(answering()).await;
        let resp = app_router(state)
            .oneshot(post_json(
                "/api/query/stream",
                json!({"query": "What were total sales?"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("event: processing_step"));
        assert!(text.contains("event: done"));
    }

    #[tokio::test]
    async fn unknown_stream_format_is_rejected() {
        let (state, _dir) = test_state(ScriptedProvider::new()).await;
        let resp = app_router(state)
            .oneshot(post_json(
                "/api/query/stream?format=xml",
                json!({"query": "hi"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn validate_route_reports_deny_reason() {
        let (state, _dir) = test_state(ScriptedProvider::new()).await;
        let resp = app_router(state)
            .oneshot(post_json(
                "/api/sql/validate",
                json!({"sql": "SELECT 1; DROP TABLE orders"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = body_json(resp).await;
        assert_eq!(payload["verdict"], "deny");
        assert_eq!(payload["reason"]["kind"], "multiple_statements");
    }

    #[tokio::test]
    async fn sessions_can_be_created_and_fetched() {
        let (state, _dir) = test_state(ScriptedProvider::new()).await;
        let app = app_router(state);
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/session",
                json!({"title": "Sales", "data_source_ids": ["shop"]}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let id = created["id"].as_str().expect("id").to_string();

        let req = Request::builder()
            .uri(format!("/api/session/{id}"))
            .body(Body::empty())
            .expect("request");
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["title"], "Sales");

        let req = Request::builder()
            .uri("/api/session/missing")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_without_active_run_reports_false() {
        let (state, _dir) = test_state(ScriptedProvider::new()).await;
        let resp = app_router(state)
            .oneshot(post_json("/api/session/idle/cancel", json!({})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["cancelled"], false);
    }

    #[tokio::test]
    async fn cancel_names_the_run_it_stopped() {
        let (state, _dir) = test_state(ScriptedProvider::new()).await;
        let run = state
            .runs
            .acquire("busy", "run-7".to_string())
            .await
            .expect("claim");
        let token = state
            .engine
            .cancellations()
            .create("busy", &run.run_id)
            .await;
        let resp = app_router(state)
            .oneshot(post_json("/api/session/busy/cancel", json!({})))
            .await
            .expect("response");
        let payload = body_json(resp).await;
        assert_eq!(payload["cancelled"], true);
        assert_eq!(payload["active_run"]["run_id"], "run-7");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn conflict_reports_the_run_id_the_engine_uses() {
        let provider = ScriptedProvider::new().with_turn(ScriptedTurn::Hang(Vec::new()));
        let (state, _dir) = test_state(provider).await;
        let app = app_router(state.clone());
        let stream = app
            .clone()
            .oneshot(post_json(
                "/api/query/stream?format=ndjson",
                json!({"query": "count orders", "session_id": "busy"}),
            ))
            .await
            .expect("stream");
        assert_eq!(stream.status(), StatusCode::OK);

        let engine_run_id = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(run_id) = state.engine.cancellations().run_id("busy").await {
                    return run_id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("engine registered the run");

        let resp = app
            .oneshot(post_json(
                "/api/query",
                json!({"query": "again", "session_id": "busy"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["active_run"]["run_id"], engine_run_id);

        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.runs.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("disconnect releases the session");
    }

    #[tokio::test]
    async fn config_patch_is_persisted_to_the_project_layer() {
        let (state, dir) = test_state(ScriptedProvider::new()).await;
        let req = Request::builder()
            .method("PATCH")
            .uri("/api/config")
            .header("content-type", "application/json")
            .body(Body::from(json!({"agent": {"max_iterations": 4}}).to_string()))
            .expect("request");
        let resp = app_router(state.clone()).oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["project"]["agent"]["max_iterations"], 4);
        assert_eq!(state.config.get().await.agent.max_iterations, 4);
        assert!(dir.path().join("config.json").exists());
    }
}
