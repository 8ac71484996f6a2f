use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "cinemaai.log";

/**
 * \brief 本地遥测文件的开关与落盘目录。
 */
struct Sink {
    enabled: bool,
    dir: PathBuf,
}

static SINK: Lazy<RwLock<Sink>> = Lazy::new(|| {
    RwLock::new(Sink {
        enabled: false,
        dir: PathBuf::from("logs"),
    })
});

#[derive(Clone, Copy)]
enum Level {
    Info,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Error => "ERROR",
        }
    }
}

/**
 * \brief 安装 tracing 订阅器，日志级别由 `RUST_LOG` 控制（默认 info）。
 * \details 重复调用是安全的，后续调用不生效。
 */
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/** \brief 打开或关闭遥测文件。 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut sink) = SINK.write() {
        sink.enabled = enabled;
    }
}

pub fn is_enabled() -> bool {
    SINK.read().map(|s| s.enabled).unwrap_or(false)
}

/** \brief 修改遥测文件所在目录（默认 `logs/`）。 */
pub fn set_log_dir(dir: impl Into<PathBuf>) {
    if let Ok(mut sink) = SINK.write() {
        sink.dir = dir.into();
    }
}

/**
 * \brief 记录常规事件；开关开启时同时追加到遥测文件。
 */
pub fn log_event(category: &str, message: &str) {
    tracing::info!(category, "{}", message);
    append(Level::Info, category, message);
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    tracing::warn!(category, "{}", message);
    append(Level::Error, category, message);
}

fn append(level: Level, category: &str, message: &str) {
    let dir = match SINK.read() {
        Ok(sink) if sink.enabled => sink.dir.clone(),
        _ => return,
    };
    if let Err(err) = write_line(&dir, level, category, message) {
        tracing::warn!("telemetry write failed: {:#}", err);
    }
}

fn write_line(dir: &Path, level: Level, category: &str, message: &str) -> Result<()> {
    fs::create_dir_all(dir)?;
    let line = format!(
        "{} [{}] {} - {}\n",
        OffsetDateTime::now_utc().format(&Rfc3339)?,
        level.tag(),
        category,
        message
    );
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))?
        .write_all(line.as_bytes())?;
    Ok(())
}
