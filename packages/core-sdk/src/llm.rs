use anyhow::Result;
use async_stream::stream;
use futures_util::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Value};
use std::pin::Pin;

use crate::{
    config::Settings,
    credentials::CredentialResolver,
    error::CompletionError,
    models::{CompletionRequest, Message},
    sse::SseDecoder,
    telemetry,
};

const VALIDATION_SYSTEM_PROMPT: &str = "You are a test.";
const VALIDATION_USER_PROMPT: &str = "Say hi.";

/** \brief 增量文本流，每项为一段 delta 或一次失败。 */
pub type DeltaStream<'a> = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send + 'a>>;

/**
 * \brief 流式回调接收端。
 * \details 每次调用恰好触发一个终止回调：`on_complete` 或 `on_error`。
 */
pub trait StreamSink {
    fn on_delta(&mut self, delta: &str);
    fn on_complete(&mut self);
    fn on_error(&mut self, error: &CompletionError);
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [Message; 2],
    stream: bool,
}

enum Route {
    Direct(String),
    Proxy,
}

/**
 * \brief Completion Client：直连 Provider 或经代理函数完成补全。
 * \details 每次调用仅发起一次网络请求，不自动重试；所有失败归一为 `CompletionError`。
 */
#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    settings: Settings,
    resolver: CredentialResolver,
}

impl CompletionClient {
    pub fn new(settings: Settings, resolver: CredentialResolver) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_http(http, settings, resolver))
    }

    pub fn with_http(http: reqwest::Client, settings: Settings, resolver: CredentialResolver) -> Self {
        Self {
            http,
            settings,
            resolver,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    /**
     * \brief 以指定用户身份派生客户端（共享同一连接池）。
     */
    pub fn with_owner(&self, owner: Option<String>) -> Self {
        Self {
            http: self.http.clone(),
            settings: self.settings.clone(),
            resolver: self.resolver.clone().with_owner(owner),
        }
    }

    fn route(&self) -> Route {
        match self.resolver.resolve(&self.settings.provider) {
            Some(credential) => {
                tracing::debug!(source = ?credential.source, "completion routed direct");
                Route::Direct(credential.secret)
            }
            None => {
                tracing::debug!("no credential resolved, completion routed via proxy");
                Route::Proxy
            }
        }
    }

    /**
     * \brief 非流式补全，返回完整回复或结构化失败。
     */
    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let result = match self.route() {
            Route::Direct(secret) => self.complete_direct(&secret, request).await,
            Route::Proxy => self.complete_via_proxy(request).await,
        };
        if let Err(err) = &result {
            report_failure("llm.complete", err);
        }
        result
    }

    /**
     * \brief 以统一接口返回流式增量；走代理时退化为一次性结果。
     */
    pub async fn stream_chat<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Result<DeltaStream<'a>, CompletionError> {
        match self.route() {
            Route::Direct(secret) => self.stream_direct(&secret, request).await,
            Route::Proxy => {
                let full = self.complete_via_proxy(request).await?;
                let s = stream! {
                    if !full.is_empty() {
                        yield Ok::<String, CompletionError>(full);
                    }
                };
                Ok(Box::pin(s))
            }
        }
    }

    /**
     * \brief 驱动流式补全到回调接收端，并返回同一结果。
     */
    pub async fn stream_into<S: StreamSink>(
        &self,
        request: &CompletionRequest,
        sink: &mut S,
    ) -> Result<(), CompletionError> {
        let mut deltas = match self.stream_chat(request).await {
            Ok(s) => s,
            Err(err) => {
                report_failure("llm.stream", &err);
                sink.on_error(&err);
                return Err(err);
            }
        };
        while let Some(item) = deltas.next().await {
            match item {
                Ok(delta) => sink.on_delta(&delta),
                Err(err) => {
                    report_failure("llm.stream", &err);
                    sink.on_error(&err);
                    return Err(err);
                }
            }
        }
        sink.on_complete();
        Ok(())
    }

    /**
     * \brief 按请求的 `stream` 标记选择流式或一次性补全，结果都交付给 sink。
     */
    pub async fn execute<S: StreamSink>(
        &self,
        request: &CompletionRequest,
        sink: &mut S,
    ) -> Result<(), CompletionError> {
        if request.stream {
            return self.stream_into(request, sink).await;
        }
        match self.complete(request).await {
            Ok(content) => {
                if !content.is_empty() {
                    sink.on_delta(&content);
                }
                sink.on_complete();
                Ok(())
            }
            Err(err) => {
                sink.on_error(&err);
                Err(err)
            }
        }
    }

    /**
     * \brief 用给定密钥直连 Provider 发起一次测试补全。
     */
    pub async fn validate_key(&self, secret: &str) -> Result<(), CompletionError> {
        let probe = CompletionRequest::new(VALIDATION_SYSTEM_PROMPT, VALIDATION_USER_PROMPT);
        match self.complete_direct(secret, &probe).await {
            Ok(_) => Ok(()),
            Err(err) => {
                report_failure("llm.validate", &err);
                Err(err)
            }
        }
    }

    async fn send_direct(
        &self,
        secret: &str,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, CompletionError> {
        let body = ChatBody {
            model: &self.settings.model,
            messages: request.messages(),
            stream,
        };
        let resp = self
            .http
            .post(self.settings.completions_url())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", secret))
            .json(&body)
            .send()
            .await
            .map_err(CompletionError::transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CompletionError::from_status(status.as_u16(), &text));
        }
        Ok(resp)
    }

    async fn complete_direct(
        &self,
        secret: &str,
        request: &CompletionRequest,
    ) -> Result<String, CompletionError> {
        let resp = self.send_direct(secret, request, false).await?;
        let text = resp.text().await.map_err(CompletionError::transport)?;
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| CompletionError::malformed(format!("invalid json: {}", e)))?;
        extract_message_content(&v)
            .ok_or_else(|| CompletionError::malformed(format!("missing choices[0].message.content: {}", text)))
    }

    async fn stream_direct<'a>(
        &'a self,
        secret: &str,
        request: &'a CompletionRequest,
    ) -> Result<DeltaStream<'a>, CompletionError> {
        let resp = self.send_direct(secret, request, true).await?;
        let mut bytes = resp.bytes_stream();

        let out = stream! {
            let mut decoder = SseDecoder::new();
            let mut failed = false;
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        let feed = decoder.feed(&chunk);
                        for delta in feed.deltas {
                            yield Ok(delta);
                        }
                        if feed.done {
                            break;
                        }
                    }
                    Err(e) => {
                        decoder.fail();
                        failed = true;
                        yield Err(CompletionError::transport(e));
                        break;
                    }
                }
            }
            if !failed {
                for delta in decoder.finish().deltas {
                    yield Ok(delta);
                }
                if decoder.skipped_frames() > 0 {
                    tracing::warn!(skipped = decoder.skipped_frames(), "stream finished with malformed frames");
                }
            }
        };

        Ok(Box::pin(out))
    }

    async fn complete_via_proxy(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = json!({
            "systemPrompt": request.system_prompt,
            "userPrompt": request.user_prompt,
        });
        let mut builder = self
            .http
            .post(&self.settings.proxy_url)
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(token) = self.settings.proxy_auth_token.as_deref() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let resp = builder.send().await.map_err(CompletionError::transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| proxy_error_text(&v))
                .unwrap_or(text);
            return Err(CompletionError::from_status(status.as_u16(), &detail));
        }

        let text = resp.text().await.map_err(CompletionError::transport)?;
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| CompletionError::malformed(format!("invalid proxy json: {}", e)))?;
        if let Some(content) = v.get("content").and_then(|c| c.as_str()) {
            return Ok(content.to_string());
        }
        match proxy_error_text(&v) {
            Some(detail) => Err(CompletionError::malformed(detail)),
            None => Err(CompletionError::malformed(format!("missing content: {}", text))),
        }
    }
}

fn report_failure(category: &str, err: &CompletionError) {
    telemetry::log_error(category, &format!("kind={:?} {}", err.kind(), err));
}

/**
 * \brief 提取 `choices[0].message.content`。
 */
pub fn extract_message_content(v: &Value) -> Option<String> {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
}

/**
 * \brief 代理返回的 `error` 字段：字符串原样返回，对象取 `message`，否则序列化。
 */
fn proxy_error_text(v: &Value) -> Option<String> {
    let err = v.get("error")?;
    Some(match err {
        Value::String(s) => s.clone(),
        Value::Object(obj) => match obj.get("message").and_then(|m| m.as_str()) {
            Some(message) => message.to_string(),
            None => err.to_string(),
        },
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        error::ErrorKind,
        secret::SecretCodec,
    };
    use std::path::PathBuf;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingSink {
        deltas: Vec<String>,
        completed: usize,
        errors: Vec<CompletionError>,
    }

    impl StreamSink for RecordingSink {
        fn on_delta(&mut self, delta: &str) {
            self.deltas.push(delta.to_string());
        }

        fn on_complete(&mut self) {
            self.completed += 1;
        }

        fn on_error(&mut self, error: &CompletionError) {
            self.errors.push(error.clone());
        }
    }

    fn settings_for(server: &MockServer, db_path: PathBuf) -> Settings {
        Settings {
            api_base: server.uri(),
            model: "deepseek-chat".to_string(),
            proxy_url: format!("{}/ai-proxy", server.uri()),
            proxy_auth_token: Some("session-token".to_string()),
            db_path,
            ..Settings::default()
        }
    }

    fn client_with_key(server: &MockServer, dir: &tempfile::TempDir, key: Option<&str>) -> CompletionClient {
        let db_path = dir.path().join("studio.db");
        let resolver = CredentialResolver::new(&db_path, SecretCodec::plain())
            .with_cached_key(key.map(str::to_string));
        CompletionClient::with_http(reqwest::Client::new(), settings_for(server, db_path), resolver)
    }

    fn sse_body(frames: &[&str]) -> String {
        frames
            .iter()
            .map(|f| format!("data: {}\n\n", f))
            .collect::<String>()
    }

    fn delta(content: &str) -> String {
        json!({"choices": [{"delta": {"content": content}}]}).to_string()
    }

    #[tokio::test]
    async fn test_direct_completion_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "deepseek-chat",
                "stream": false,
                "messages": [
                    {"role": "system", "content": "You are a test."},
                    {"role": "user", "content": "Say hi."}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "hi"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, Some("sk-test"));
        let content = client
            .complete(&CompletionRequest::new("You are a test.", "Say hi."))
            .await
            .expect("content");
        assert_eq!(content, "hi");
    }

    #[tokio::test]
    async fn test_direct_401_is_unauthorized_without_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_api_key"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, Some("sk-test"));
        let err = client
            .complete(&CompletionRequest::new("You are a test.", "Say hi."))
            .await
            .expect_err("unauthorized");
        assert_eq!(err, CompletionError::Unauthorized("invalid_api_key".to_string()));
    }

    #[tokio::test]
    async fn test_status_classification_single_attempt() {
        for (status, kind) in [
            (429, ErrorKind::RateLimited),
            (503, ErrorKind::Upstream),
            (404, ErrorKind::Generic),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/chat/completions"))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .expect(1)
                .mount(&server)
                .await;
            let dir = tempfile::tempdir().expect("tempdir");
            let client = client_with_key(&server, &dir, Some("sk-test"));
            let err = client
                .complete(&CompletionRequest::new("s", "u"))
                .await
                .expect_err("failure");
            assert_eq!(err.kind(), kind, "status {}", status);
            assert_eq!(err.detail(), "nope");
        }
    }

    #[tokio::test]
    async fn test_missing_content_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, Some("sk-test"));
        let err = client
            .complete(&CompletionRequest::new("s", "u"))
            .await
            .expect_err("malformed");
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_transport_failure_is_caught() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings {
            api_base: "http://127.0.0.1:9".to_string(),
            db_path: dir.path().join("studio.db"),
            ..Settings::default()
        };
        let resolver = CredentialResolver::new(&settings.db_path, SecretCodec::plain())
            .with_cached_key(Some("sk-test".to_string()));
        let client = CompletionClient::with_http(reqwest::Client::new(), settings, resolver);
        let err = client
            .complete(&CompletionRequest::new("s", "u"))
            .await
            .expect_err("transport");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_no_credential_routes_via_proxy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ai-proxy"))
            .and(header("authorization", "Bearer session-token"))
            .and(body_partial_json(json!({
                "systemPrompt": "You are a test.",
                "userPrompt": "Say hi."
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "hi from proxy"})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, None);
        let content = client
            .complete(&CompletionRequest::new("You are a test.", "Say hi."))
            .await
            .expect("proxied content");
        assert_eq!(content, "hi from proxy");
    }

    #[tokio::test]
    async fn test_empty_cached_key_never_goes_direct() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ai-proxy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, Some(""));
        assert_eq!(
            client.complete(&CompletionRequest::new("s", "u")).await.expect("ok"),
            "ok"
        );
    }

    #[tokio::test]
    async fn test_proxy_error_body_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ai-proxy"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "Rate limit reached", "type": "requests"}
            })))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, None);
        let err = client
            .complete(&CompletionRequest::new("s", "u"))
            .await
            .expect_err("rate limited");
        assert_eq!(err, CompletionError::RateLimited("Rate limit reached".to_string()));
    }

    #[tokio::test]
    async fn test_proxy_misconfiguration_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ai-proxy"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": "AI provider key is not configured"
            })))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, None);
        let err = client
            .complete(&CompletionRequest::new("s", "u"))
            .await
            .expect_err("misconfigured");
        assert_eq!(
            err,
            CompletionError::Upstream {
                status: 500,
                detail: "AI provider key is not configured".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_stored_credential_is_used_for_owner() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-stored"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "stored"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("studio.db");
        let conn = db::open_migrated(&db_path).expect("db");
        let stored = SecretCodec::plain().encode("sk-stored").expect("encode");
        db::upsert_credential(&conn, "user-1", "deepseek", &stored).expect("seed");
        drop(conn);

        let client = client_with_key(&server, &dir, Some("sk-cached"))
            .with_owner(Some("user-1".to_string()));
        let content = client
            .complete(&CompletionRequest::new("s", "u"))
            .await
            .expect("content");
        assert_eq!(content, "stored");
    }

    #[tokio::test]
    async fn test_stream_delivers_deltas_in_order_then_completes() {
        let server = MockServer::start().await;
        let body = sse_body(&[&delta("A"), &delta("B"), "{broken", &delta("C"), "[DONE]"]);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, Some("sk-test"));
        let mut sink = RecordingSink::default();
        client
            .stream_into(&CompletionRequest::new("s", "u").streaming(), &mut sink)
            .await
            .expect("stream ok");
        assert_eq!(sink.deltas, vec!["A", "B", "C"]);
        assert_eq!(sink.completed, 1);
        assert!(sink.errors.is_empty());
    }

    #[tokio::test]
    async fn test_stream_http_error_fires_only_error_callback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_api_key"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, Some("sk-test"));
        let mut sink = RecordingSink::default();
        let result = client
            .stream_into(&CompletionRequest::new("s", "u").streaming(), &mut sink)
            .await;
        assert!(result.is_err());
        assert!(sink.deltas.is_empty());
        assert_eq!(sink.completed, 0);
        assert_eq!(sink.errors.len(), 1);
        assert_eq!(sink.errors[0].kind(), ErrorKind::Unauthorized);
    }

    /**
     * \brief 回一个分块编码的 SSE 响应头和一帧数据，然后不发结束块直接断开。
     */
    async fn serve_truncated_stream(listener: tokio::net::TcpListener, frame: String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
        }

        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
        let chunk = format!("{:x}\r\n{}\r\n", frame.len(), frame);
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(chunk.as_bytes()).await;
        let _ = socket.flush().await;
    }

    #[tokio::test]
    async fn test_stream_connection_lost_midway_fires_only_error_callback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let upstream = tokio::spawn(serve_truncated_stream(
            listener,
            format!("data: {}\n\n", delta("A")),
        ));

        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings {
            api_base: format!("http://{}", addr),
            db_path: dir.path().join("studio.db"),
            ..Settings::default()
        };
        let resolver = CredentialResolver::new(&settings.db_path, SecretCodec::plain())
            .with_cached_key(Some("sk-test".to_string()));
        let client = CompletionClient::with_http(reqwest::Client::new(), settings, resolver);

        let mut sink = RecordingSink::default();
        let result = client
            .stream_into(&CompletionRequest::new("s", "u").streaming(), &mut sink)
            .await;
        upstream.await.expect("upstream task");

        assert!(result.is_err());
        assert_eq!(sink.deltas, vec!["A"]);
        assert_eq!(sink.completed, 0);
        assert_eq!(sink.errors.len(), 1);
        assert_eq!(sink.errors[0].kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_stream_without_credential_yields_proxy_content_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ai-proxy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "整段回复"})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, None);
        let mut sink = RecordingSink::default();
        client
            .execute(&CompletionRequest::new("s", "u").streaming(), &mut sink)
            .await
            .expect("ok");
        assert_eq!(sink.deltas, vec!["整段回复"]);
        assert_eq!(sink.completed, 1);
    }

    #[tokio::test]
    async fn test_execute_non_streaming_reports_single_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with_key(&server, &dir, Some("sk-test"));
        let mut sink = RecordingSink::default();
        let result = client.execute(&CompletionRequest::new("s", "u"), &mut sink).await;
        assert!(result.is_err());
        assert_eq!(sink.completed, 0);
        assert_eq!(sink.errors.len(), 1);
        assert_eq!(sink.errors[0].kind(), ErrorKind::Upstream);
    }

    #[test]
    fn test_proxy_error_text_shapes() {
        assert_eq!(
            proxy_error_text(&json!({"error": "plain"})).as_deref(),
            Some("plain")
        );
        assert_eq!(
            proxy_error_text(&json!({"error": {"message": "nested"}})).as_deref(),
            Some("nested")
        );
        assert_eq!(
            proxy_error_text(&json!({"error": {"code": 7}})).as_deref(),
            Some("{\"code\":7}")
        );
        assert!(proxy_error_text(&json!({"content": "x"})).is_none());
    }
}
