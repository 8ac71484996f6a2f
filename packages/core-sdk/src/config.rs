use std::path::PathBuf;

/** \brief 默认 Provider 名称，亦是凭据表中的 provider 键。 */
pub const DEFAULT_PROVIDER: &str = "deepseek";
const DEFAULT_API_BASE: &str = "https://api.deepseek.com";
const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_PROXY_URL: &str = "http://127.0.0.1:8787/ai-proxy";
const DEFAULT_DB_PATH: &str = "cinemaai.db";
const DEFAULT_LOG_DIR: &str = "logs";

/**
 * \brief 运行配置，来自 `CINEMAAI_*` 环境变量。
 * \details 本地缓存密钥作为显式字段注入 Credential Resolver，不使用全局状态。
 */
#[derive(Clone)]
pub struct Settings {
    /** \brief Provider 名称 */
    pub provider: String,
    /** \brief API 基地址 */
    pub api_base: String,
    /** \brief 模型名 */
    pub model: String,
    /** \brief 代理函数地址（无可用密钥时使用） */
    pub proxy_url: String,
    /** \brief 访问代理函数时携带的会话令牌 */
    pub proxy_auth_token: Option<String>,
    /** \brief SQLite 数据库路径 */
    pub db_path: PathBuf,
    /** \brief 遥测文件目录 */
    pub log_dir: PathBuf,
    /** \brief 本地缓存的用户密钥 */
    pub cached_key: Option<String>,
    /** \brief 凭据加密主密钥（base64，32 字节） */
    pub secret_key: Option<String>,
    /** \brief 代理函数持有的共享密钥 */
    pub proxy_shared_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            proxy_auth_token: None,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            cached_key: None,
            secret_key: None,
            proxy_shared_key: None,
        }
    }
}

impl Settings {
    /**
     * \brief 从环境变量读取配置，缺省项使用默认值。
     */
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            provider: env_string("CINEMAAI_PROVIDER").unwrap_or(defaults.provider),
            api_base: env_string("CINEMAAI_API_BASE").unwrap_or(defaults.api_base),
            model: env_string("CINEMAAI_MODEL").unwrap_or(defaults.model),
            proxy_url: env_string("CINEMAAI_PROXY_URL").unwrap_or(defaults.proxy_url),
            proxy_auth_token: env_string("CINEMAAI_PROXY_TOKEN"),
            db_path: env_string("CINEMAAI_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: env_string("CINEMAAI_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            cached_key: env_string("CINEMAAI_LOCAL_API_KEY"),
            secret_key: env_string("CINEMAAI_SECRET_KEY"),
            proxy_shared_key: env_string("CINEMAAI_PROXY_SHARED_KEY"),
        }
    }

    /** \brief 直连 Provider 的 chat completions 端点。 */
    pub fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.api_base.trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("provider", &self.provider)
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("proxy_url", &self.proxy_url)
            .field("proxy_auth_token", &self.proxy_auth_token.as_ref().map(|_| "***"))
            .field("db_path", &self.db_path)
            .field("log_dir", &self.log_dir)
            .field("cached_key", &self.cached_key.as_ref().map(|_| "***"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .field("proxy_shared_key", &self.proxy_shared_key.as_ref().map(|_| "***"))
            .finish()
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
