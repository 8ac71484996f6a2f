use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{
    db,
    error::CompletionError,
    llm::CompletionClient,
    models::{CredentialSource, CredentialSummary, ResolvedCredential},
    secret::{SecretCodec, SecretError},
    telemetry,
};

/**
 * \brief Credential Resolver：决定一次补全调用由哪把密钥授权。
 * \details 解析顺序：用户绑定的持久化密钥 → 本地缓存密钥 → 无（走共享代理）。
 *          解析只读且永不失败，存储层异常仅记录日志并视为“未找到”。
 */
#[derive(Clone)]
pub struct CredentialResolver {
    db_path: PathBuf,
    owner: Option<String>,
    cached_key: Option<String>,
    codec: SecretCodec,
}

impl CredentialResolver {
    pub fn new(db_path: impl Into<PathBuf>, codec: SecretCodec) -> Self {
        Self {
            db_path: db_path.into(),
            owner: None,
            cached_key: None,
            codec,
        }
    }

    /** \brief 设置当前已认证的用户标识。 */
    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner.filter(|o| !o.trim().is_empty());
        self
    }

    /** \brief 注入本地缓存的密钥。 */
    pub fn with_cached_key(mut self, cached_key: Option<String>) -> Self {
        self.cached_key = cached_key;
        self
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn codec(&self) -> &SecretCodec {
        &self.codec
    }

    /**
     * \brief 为指定 Provider 解析密钥；None 表示调用方应走代理。
     */
    pub fn resolve(&self, provider: &str) -> Option<ResolvedCredential> {
        if let Some(owner) = self.owner.as_deref() {
            if let Some(secret) = self.load_stored(owner, provider) {
                return Some(ResolvedCredential {
                    provider: provider.to_string(),
                    secret,
                    source: CredentialSource::Stored,
                });
            }
        }
        non_empty(self.cached_key.as_deref()).map(|secret| ResolvedCredential {
            provider: provider.to_string(),
            secret,
            source: CredentialSource::Cached,
        })
    }

    fn load_stored(&self, owner: &str, provider: &str) -> Option<String> {
        let conn = match db::open_read_only(&self.db_path) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::debug!("credential store unavailable: {:#}", err);
                return None;
            }
        };
        let record = match db::get_credential(&conn, owner, provider) {
            Ok(record) => record?,
            Err(err) => {
                tracing::warn!(owner, provider, "credential lookup failed: {:#}", err);
                return None;
            }
        };
        match self.codec.decode(&record.secret) {
            Ok(secret) => non_empty(Some(&secret)),
            Err(err) => {
                tracing::warn!(owner, provider, "stored credential undecodable: {}", err);
                None
            }
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/**
 * \brief 绑定密钥失败的原因。
 */
#[derive(Debug, Error)]
pub enum BindError {
    #[error("api key must not be empty")]
    EmptySecret,
    #[error("api key validation failed: {0}")]
    Validation(#[from] CompletionError),
    #[error("encode api key failed: {0}")]
    Secret(#[from] SecretError),
    #[error("save api key failed: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/**
 * \brief 校验并保存用户密钥。
 * \details 先用该密钥直连 Provider 发起一次测试补全，成功后才写入（upsert），
 *          校验失败时不产生任何持久化。
 * \return 凭据行主键。
 */
pub async fn bind_credential(
    client: &CompletionClient,
    owner: &str,
    secret: &str,
) -> Result<i64, BindError> {
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(BindError::EmptySecret);
    }
    client.validate_key(secret).await?;

    let resolver = client.resolver();
    let encoded = resolver.codec().encode(secret)?;
    let provider = client.settings().provider.clone();
    let db_path = resolver.db_path().to_path_buf();
    let record_owner = owner.to_string();
    let record_provider = provider.clone();
    // 锁冲突时的重试退避是阻塞的，放到阻塞线程池
    let id = tokio::task::spawn_blocking(move || -> anyhow::Result<i64> {
        let conn = db::open_migrated(&db_path)?;
        db::upsert_credential(&conn, &record_owner, &record_provider, &encoded)
    })
    .await
    .map_err(|e| BindError::Storage(anyhow::anyhow!("credential write task failed: {}", e)))??;
    telemetry::log_event(
        "credentials.bind",
        &format!("owner={} provider={} encrypted={}", owner, provider, resolver.codec().is_encrypting()),
    );
    Ok(id)
}

/**
 * \brief 解绑密钥，返回是否确有记录被删除。
 */
pub fn unbind_credential(db_path: &Path, owner: &str, provider: &str) -> anyhow::Result<bool> {
    let conn = db::open_migrated(db_path)?;
    let removed = db::delete_credential(&conn, owner, provider)?;
    telemetry::log_event(
        "credentials.unbind",
        &format!("owner={} provider={} removed={}", owner, provider, removed),
    );
    Ok(removed)
}

/**
 * \brief 注销账号时清除该用户的全部密钥。
 */
pub fn delete_account_credentials(db_path: &Path, owner: &str) -> anyhow::Result<usize> {
    let conn = db::open_migrated(db_path)?;
    let removed = db::delete_owner_credentials(&conn, owner)?;
    telemetry::log_event(
        "credentials.delete_account",
        &format!("owner={} removed={}", owner, removed),
    );
    Ok(removed)
}

pub fn list_credentials(db_path: &Path, owner: &str) -> anyhow::Result<Vec<CredentialSummary>> {
    let conn = db::open_migrated(db_path)?;
    db::list_credentials(&conn, owner)
}
