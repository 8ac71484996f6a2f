use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;

use crate::{
    config::Settings,
    credentials::{self, BindError, CredentialResolver},
    error::CompletionError,
    llm::{CompletionClient, StreamSink},
    models::{CompletionRequest, CredentialSource, CredentialSummary},
    secret::SecretCodec,
    telemetry,
};

/** \brief 携带当前用户标识的请求头。 */
pub const OWNER_HEADER: &str = "x-user-id";

type ApiError = (StatusCode, Json<Value>);

struct AppState {
    client: CompletionClient,
}

/**
 * \brief 启动 Studio 本地 HTTP 服务，供前端发起密钥绑定与补全请求。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, settings: Settings) -> Result<()> {
    let codec = SecretCodec::from_config(settings.secret_key.as_deref())?;
    if !codec.is_encrypting() {
        tracing::warn!("CINEMAAI_SECRET_KEY not set; stored api keys are only base64-encoded");
    }
    let resolver = CredentialResolver::new(&settings.db_path, codec)
        .with_cached_key(settings.cached_key.clone());
    let client = CompletionClient::new(settings, resolver)?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Studio server listening on http://{}", addr);
    axum::serve(listener, router(client)).await?;
    Ok(())
}

/**
 * \brief 构建 Studio API 路由。
 */
pub fn router(client: CompletionClient) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/credentials", get(get_credentials).post(save_credential))
        .route("/api/credentials/{provider}", delete(remove_credential))
        .route("/api/account/credentials", delete(remove_account_credentials))
        .route("/api/completions", post(create_completion))
        .route("/api/completions/stream", post(stream_completion))
        .with_state(Arc::new(AppState { client }))
        .layer(TraceLayer::new_for_http())
}

#[derive(Deserialize, Debug)]
struct SaveCredentialRequest {
    /** \brief Provider 名称，缺省为当前配置的 Provider */
    #[serde(default)]
    provider: Option<String>,
    /** \brief 用户提交的 API 密钥 */
    api_key: String,
}

#[derive(Serialize, Debug)]
struct CredentialsResponse {
    credentials: Vec<CredentialSummary>,
}

#[derive(Deserialize, Debug)]
struct CompletionInput {
    #[serde(default)]
    system_prompt: String,
    user_prompt: String,
}

#[derive(Serialize, Debug)]
struct CompletionOutput {
    content: String,
}

fn owner_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn require_owner(headers: &HeaderMap) -> Result<String, ApiError> {
    owner_from(headers).ok_or_else(|| api_err(StatusCode::UNAUTHORIZED, "unauthenticated", "请先登录后再管理密钥"))
}

fn api_err(status: StatusCode, kind: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({ "error": { "kind": kind, "message": message.into() } })),
    )
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    api_err(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
}

/**
 * \brief 在阻塞线程池中执行 SQLite 操作，锁冲突重试时不占用异步工作线程。
 */
async fn run_blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(internal_err)?
        .map_err(internal_err)
}

fn completion_err(e: &CompletionError) -> ApiError {
    (
        e.status_code(),
        Json(json!({ "error": { "kind": e.kind(), "message": e.user_message() } })),
    )
}

/**
 * \brief 健康检查：返回当前 Provider 以及本次调用将走直连还是代理。
 */
async fn health_check(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<Value> {
    let client = state.client.with_owner(owner_from(&headers));
    let settings = client.settings();
    let source = client
        .resolver()
        .resolve(&settings.provider)
        .map(|c| c.source);
    Json(json!({
        "ok": true,
        "provider": settings.provider,
        "model": settings.model,
        "credential": source,
        "route": match source {
            Some(CredentialSource::Stored | CredentialSource::Cached) => "direct",
            None => "proxy",
        },
    }))
}

/**
 * \brief 列出当前用户已绑定的密钥。
 */
async fn get_credentials(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CredentialsResponse>, ApiError> {
    let owner = require_owner(&headers)?;
    let db_path = state.client.resolver().db_path().to_path_buf();
    let credentials =
        run_blocking(move || credentials::list_credentials(&db_path, &owner)).await?;
    Ok(Json(CredentialsResponse { credentials }))
}

/**
 * \brief 校验并绑定密钥。
 */
async fn save_credential(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SaveCredentialRequest>,
) -> Result<Json<CredentialsResponse>, ApiError> {
    let owner = require_owner(&headers)?;
    let configured = &state.client.settings().provider;
    if let Some(provider) = payload.provider.as_deref() {
        if provider != configured {
            return Err(api_err(
                StatusCode::BAD_REQUEST,
                "unsupported_provider",
                format!("不支持的模型服务：{}", provider),
            ));
        }
    }

    match credentials::bind_credential(&state.client, &owner, &payload.api_key).await {
        Ok(_) => {}
        Err(BindError::EmptySecret) => {
            return Err(api_err(StatusCode::BAD_REQUEST, "empty_key", "API 密钥不能为空"))
        }
        Err(BindError::Validation(e)) => return Err(completion_err(&e)),
        Err(e) => return Err(internal_err(e)),
    }
    let db_path = state.client.resolver().db_path().to_path_buf();
    let credentials =
        run_blocking(move || credentials::list_credentials(&db_path, &owner)).await?;
    Ok(Json(CredentialsResponse { credentials }))
}

/**
 * \brief 解绑指定 Provider 的密钥。
 */
async fn remove_credential(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let owner = require_owner(&headers)?;
    let db_path = state.client.resolver().db_path().to_path_buf();
    let removed =
        run_blocking(move || credentials::unbind_credential(&db_path, &owner, &provider)).await?;
    Ok(Json(json!({ "removed": removed })))
}

/**
 * \brief 注销账号：清除该用户的全部密钥。
 */
async fn remove_account_credentials(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let owner = require_owner(&headers)?;
    let db_path = state.client.resolver().db_path().to_path_buf();
    let removed =
        run_blocking(move || credentials::delete_account_credentials(&db_path, &owner)).await?;
    Ok(Json(json!({ "removed": removed })))
}

fn validate_input(input: CompletionInput) -> Result<CompletionRequest, ApiError> {
    if input.user_prompt.trim().is_empty() {
        return Err(api_err(StatusCode::BAD_REQUEST, "empty_prompt", "提示词不能为空"));
    }
    Ok(CompletionRequest::new(input.system_prompt, input.user_prompt))
}

/**
 * \brief 一次性补全：返回 `{content}` 或结构化错误。
 */
async fn create_completion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<CompletionInput>,
) -> Result<Json<CompletionOutput>, ApiError> {
    let request = validate_input(input)?;
    let client = state.client.with_owner(owner_from(&headers));
    telemetry::log_event(
        "server.completion",
        &format!(
            "system_len={} user_len={}",
            request.system_prompt.len(),
            request.user_prompt.len()
        ),
    );
    match client.complete(&request).await {
        Ok(content) => Ok(Json(CompletionOutput { content })),
        Err(e) => Err(completion_err(&e)),
    }
}

/**
 * \brief 将流式回调转换为 SSE 事件；前端断开后发送静默失败。
 */
struct SseSink {
    tx: mpsc::UnboundedSender<Result<Event, Infallible>>,
}

impl StreamSink for SseSink {
    fn on_delta(&mut self, delta: &str) {
        let _ = self.tx.send(Ok(Event::default().data(delta)));
    }

    fn on_complete(&mut self) {
        let _ = self.tx.send(Ok(Event::default().event("done").data("[DONE]")));
    }

    fn on_error(&mut self, error: &CompletionError) {
        let payload = json!({ "kind": error.kind(), "message": error.user_message() });
        let _ = self
            .tx
            .send(Ok(Event::default().event("error").data(payload.to_string())));
    }
}

/**
 * \brief 流式补全：POST /api/completions/stream，响应为 SSE。
 */
async fn stream_completion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<CompletionInput>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>,
    ApiError,
> {
    let request = validate_input(input)?.streaming();
    let client = state.client.with_owner(owner_from(&headers));

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let watch = tx.clone();
    tokio::spawn(async move {
        let mut sink = SseSink { tx };
        tokio::select! {
            _ = client.stream_into(&request, &mut sink) => {}
            _ = watch.closed() => {
                telemetry::log_event("server.stream", "client disconnected, stream abandoned");
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}
