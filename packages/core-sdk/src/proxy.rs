use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::{config::Settings, llm::extract_message_content, models::CompletionRequest, telemetry};

const CORS_HEADERS: [(HeaderName, &str); 3] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        "authorization, x-client-info, apikey, content-type",
    ),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
];

/**
 * \brief 代理函数的运行状态：一把共享密钥与上游端点，不保存任何用户数据。
 */
#[derive(Clone)]
pub struct ProxyState {
    http: reqwest::Client,
    completions_url: String,
    model: String,
    shared_key: Option<String>,
}

impl ProxyState {
    pub fn new(
        http: reqwest::Client,
        completions_url: impl Into<String>,
        model: impl Into<String>,
        shared_key: Option<String>,
    ) -> Self {
        Self {
            http,
            completions_url: completions_url.into(),
            model: model.into(),
            shared_key,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::new(
            http,
            settings.completions_url(),
            settings.model.clone(),
            settings.proxy_shared_key.clone(),
        ))
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RelayRequest {
    /** \brief 系统提示词 */
    system_prompt: String,
    /** \brief 用户提示词 */
    user_prompt: String,
}

/**
 * \brief 构建代理路由：任意路径均由同一中继处理。
 */
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .fallback(relay)
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

/**
 * \brief 启动代理服务。
 * \param addr 监听地址，如 "127.0.0.1:8787"
 */
pub async fn serve(addr: &str, state: ProxyState) -> Result<()> {
    if state.shared_key.is_none() {
        tracing::warn!("proxy shared key is not configured; every relay request will fail with 500");
    }
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("AI proxy listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn relay(State(state): State<Arc<ProxyState>>, method: Method, body: Bytes) -> Response {
    if method == Method::OPTIONS {
        return (StatusCode::NO_CONTENT, CORS_HEADERS).into_response();
    }
    if method != Method::POST {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, json!("method not allowed"));
    }
    let Some(shared_key) = state.shared_key.as_deref() else {
        telemetry::log_error("proxy.relay", "shared key missing");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!("AI provider key is not configured"),
        );
    };
    let input: RelayRequest = match serde_json::from_slice(&body) {
        Ok(input) => input,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                json!(format!("invalid request body: {}", e)),
            )
        }
    };

    let request = CompletionRequest::new(input.system_prompt, input.user_prompt);
    let upstream_body = json!({
        "model": state.model,
        "messages": request.messages(),
        "stream": false,
    });
    let resp = match state
        .http
        .post(&state.completions_url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", shared_key))
        .json(&upstream_body)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            telemetry::log_error("proxy.relay", &format!("upstream unreachable: {}", e));
            return error_response(StatusCode::BAD_GATEWAY, json!(format!("upstream unreachable: {}", e)));
        }
    };

    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    if !(200..300).contains(&status) {
        telemetry::log_error("proxy.relay", &format!("upstream status={}", status));
        let relayed = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        return error_response(status, relayed);
    }

    let content = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| extract_message_content(&v));
    match content {
        Some(content) => {
            telemetry::log_event("proxy.relay", &format!("ok content_len={}", content.len()));
            (StatusCode::OK, CORS_HEADERS, Json(json!({ "content": content }))).into_response()
        }
        None => error_response(
            StatusCode::BAD_GATEWAY,
            json!("upstream response missing choices[0].message.content"),
        ),
    }
}

fn error_response(status: StatusCode, error: Value) -> Response {
    (status, CORS_HEADERS, Json(json!({ "error": error }))).into_response()
}
