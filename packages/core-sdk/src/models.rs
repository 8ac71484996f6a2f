use serde::{Deserialize, Serialize};

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 单次补全请求：一对 system/user 提示词。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /** \brief 系统提示词（Agent 角色设定） */
    pub system_prompt: String,
    /** \brief 用户提示词 */
    pub user_prompt: String,
    /** \brief 是否以流式返回（默认 false） */
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            stream: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn messages(&self) -> [Message; 2] {
        [
            Message::system(self.system_prompt.clone()),
            Message::user(self.user_prompt.clone()),
        ]
    }
}

/**
 * \brief 密钥来源层级。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /** \brief 用户绑定并持久化的密钥 */
    Stored,
    /** \brief 本地缓存（配置注入）的密钥 */
    Cached,
}

/**
 * \brief 解析得到的密钥，保证非空。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub provider: String,
    pub secret: String,
    pub source: CredentialSource,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("provider", &self.provider)
            .field("secret", &"***")
            .field("source", &self.source)
            .finish()
    }
}

/**
 * \brief 已绑定密钥的摘要（不含密文）。
 */
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub provider: String,
    pub created_at: String,
    pub updated_at: String,
}
