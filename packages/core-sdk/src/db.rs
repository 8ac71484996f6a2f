use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::{path::Path, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::CredentialSummary;

/**
 * \brief 持久化的凭据行（secret 为编码后的密文）。
 */
#[derive(Debug, Clone)]
pub struct StoredCredential {
    /** \brief 行主键。 */
    pub id: i64,
    /** \brief 所属用户标识。 */
    pub owner_id: String,
    /** \brief Provider 名称。 */
    pub provider: String,
    /** \brief 编码后的密钥。 */
    pub secret: String,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open database {} failed", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 以只读方式打开数据库；文件不存在时返回错误而不是创建。
 */
pub fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("open database {} read-only failed", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 打开数据库并确保表结构存在。
 */
pub fn open_migrated(path: &Path) -> Result<Connection> {
    let conn = open_db(path)?;
    migrate(&conn)?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS user_api_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            secret   TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(owner_id, provider)
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 写入或覆盖 (owner, provider) 对应的凭据，后写者胜出。
 * \return 凭据行主键（覆盖时保持不变）。
 */
pub fn upsert_credential(
    conn: &Connection,
    owner_id: &str,
    provider: &str,
    encoded_secret: &str,
) -> Result<i64> {
    let now = now_rfc3339()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO user_api_keys (owner_id, provider, secret, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(owner_id, provider) DO UPDATE SET
                secret=excluded.secret,
                updated_at=excluded.updated_at",
            params![owner_id, provider, encoded_secret, now],
        )
    })?;
    let id = conn.query_row(
        "SELECT id FROM user_api_keys WHERE owner_id=?1 AND provider=?2",
        params![owner_id, provider],
        |row| row.get(0),
    )?;
    Ok(id)
}

/**
 * \brief 读取 (owner, provider) 的凭据。
 */
pub fn get_credential(
    conn: &Connection,
    owner_id: &str,
    provider: &str,
) -> Result<Option<StoredCredential>> {
    conn.query_row(
        "SELECT id, owner_id, provider, secret, created_at, updated_at
         FROM user_api_keys WHERE owner_id=?1 AND provider=?2",
        params![owner_id, provider],
        |row| {
            Ok(StoredCredential {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                provider: row.get(2)?,
                secret: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出用户已绑定的 Provider（不含密文）。
 */
pub fn list_credentials(conn: &Connection, owner_id: &str) -> Result<Vec<CredentialSummary>> {
    let mut stmt = conn.prepare(
        "SELECT provider, created_at, updated_at FROM user_api_keys
         WHERE owner_id=?1 ORDER BY provider ASC",
    )?;
    let rows = stmt
        .query_map(params![owner_id], |row| {
            Ok(CredentialSummary {
                provider: row.get(0)?,
                created_at: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 解绑指定凭据。
 * \return 是否删除了记录。
 */
pub fn delete_credential(conn: &Connection, owner_id: &str, provider: &str) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM user_api_keys WHERE owner_id=?1 AND provider=?2",
            params![owner_id, provider],
        )
    })?;
    Ok(rows > 0)
}

/**
 * \brief 删除用户的全部凭据（注销账号时调用）。
 */
pub fn delete_owner_credentials(conn: &Connection, owner_id: &str) -> Result<usize> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM user_api_keys WHERE owner_id=?1",
            params![owner_id],
        )
    })?;
    Ok(rows)
}

fn now_rfc3339() -> Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
