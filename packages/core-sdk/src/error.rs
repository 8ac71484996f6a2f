use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/** \brief 诊断片段的最大字符数。 */
const SNIPPET_LIMIT: usize = 200;

/**
 * \brief 补全调用的统一失败类型。
 * \details 所有网络、解析与上游错误在 Completion Client 边界处归一为此枚举，
 *          调用方按变体分支，而不是各自匹配 HTTP 状态码。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("upstream server error ({status}): {detail}")]
    Upstream { status: u16, detail: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request failed ({status}): {detail}")]
    Generic { status: u16, detail: String },
}

/**
 * \brief 可序列化的错误类别，供前端展示与分支。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    RateLimited,
    Upstream,
    Malformed,
    Transport,
    Generic,
}

impl CompletionError {
    /**
     * \brief 按 HTTP 状态码对非 2xx 响应分类。
     * \param status 上游返回的状态码
     * \param body   响应正文（将被截断为诊断片段）
     */
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = snippet(body);
        match status {
            401 => CompletionError::Unauthorized(detail),
            429 => CompletionError::RateLimited(detail),
            500..=599 => CompletionError::Upstream { status, detail },
            _ => CompletionError::Generic { status, detail },
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        CompletionError::Transport(err.to_string())
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        CompletionError::Malformed(snippet(&detail.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CompletionError::Unauthorized(_) => ErrorKind::Unauthorized,
            CompletionError::RateLimited(_) => ErrorKind::RateLimited,
            CompletionError::Upstream { .. } => ErrorKind::Upstream,
            CompletionError::Malformed(_) => ErrorKind::Malformed,
            CompletionError::Transport(_) => ErrorKind::Transport,
            CompletionError::Generic { .. } => ErrorKind::Generic,
        }
    }

    /** \brief 诊断片段（可能为空）。 */
    pub fn detail(&self) -> &str {
        match self {
            CompletionError::Unauthorized(d)
            | CompletionError::RateLimited(d)
            | CompletionError::Malformed(d)
            | CompletionError::Transport(d) => d,
            CompletionError::Upstream { detail, .. } | CompletionError::Generic { detail, .. } => {
                detail
            }
        }
    }

    /**
     * \brief 面向用户的通知文案，附带简短诊断。
     */
    pub fn user_message(&self) -> String {
        let headline = match self {
            CompletionError::Unauthorized(_) => "API 密钥无效或已过期，请重新填写密钥",
            CompletionError::RateLimited(_) => "请求过于频繁，请稍后再试",
            CompletionError::Upstream { .. } => "AI 服务暂时不可用，请稍后重试",
            CompletionError::Malformed(_) => "AI 服务返回了无法识别的结果",
            CompletionError::Transport(_) => "网络连接失败，请检查网络后重试",
            CompletionError::Generic { .. } => "AI 请求失败",
        };
        let detail = self.detail();
        if detail.is_empty() {
            headline.to_string()
        } else {
            format!("{}：{}", headline, detail)
        }
    }

    /**
     * \brief Studio 服务端返回该错误时使用的状态码。
     */
    pub fn status_code(&self) -> StatusCode {
        match self {
            CompletionError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CompletionError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            CompletionError::Upstream { .. }
            | CompletionError::Malformed(_)
            | CompletionError::Transport(_) => StatusCode::BAD_GATEWAY,
            CompletionError::Generic { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }
}

/**
 * \brief 截断正文为诊断片段，保证在字符边界处截断。
 */
pub fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(SNIPPET_LIMIT) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            CompletionError::from_status(401, "invalid_api_key").kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            CompletionError::from_status(429, "slow down").kind(),
            ErrorKind::RateLimited
        );
        for status in [500, 502, 503, 599] {
            assert_eq!(
                CompletionError::from_status(status, "boom").kind(),
                ErrorKind::Upstream
            );
        }
        let generic = CompletionError::from_status(404, "no such model");
        assert_eq!(
            generic,
            CompletionError::Generic {
                status: 404,
                detail: "no such model".to_string()
            }
        );
        assert_eq!(
            CompletionError::from_status(400, "").kind(),
            ErrorKind::Generic
        );
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let body = "镜".repeat(250);
        let cut = snippet(&body);
        assert_eq!(cut.chars().count(), SNIPPET_LIMIT + 1);
        assert!(cut.ends_with('…'));
        assert_eq!(snippet("  short  "), "short");
    }

    #[test]
    fn test_user_message_carries_detail() {
        let err = CompletionError::from_status(401, "invalid_api_key");
        let msg = err.user_message();
        assert!(msg.contains("invalid_api_key"));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let bare = CompletionError::Transport(String::new());
        assert_eq!(bare.user_message(), "网络连接失败，请检查网络后重试");
    }

    #[test]
    fn test_generic_status_passthrough() {
        let err = CompletionError::from_status(404, "missing");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        let err = CompletionError::from_status(503, "down");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
