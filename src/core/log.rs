//! 日志
//!
//! 全部输出走 `tracing`。驱动、批处理引擎和兼容层的告警（重复加锁、替换驱动、
//! 拓扑降级等）以结构化字段记录，控制台带颜色，文件按天滚动。
//!
//! ```no_run
//! use legacy_render::core::config::LogLevel;
//! use legacy_render::core::log;
//!
//! log::init_logger(LogLevel::Info, false, None).ok();
//! tracing::info!(width = 800, height = 600, "Window created");
//! ```

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use super::config::LogLevel;
use super::error::{Error, Result};

const DEFAULT_LOG_FILE: &str = "legacy_render.log";

/// 安装全局 subscriber，整个进程只能成功一次
///
/// `RUST_LOG` 设置时覆盖 `level`。`file_output` 为真时额外写入
/// `log_file_path`（缺省 `legacy_render.log`），控制台输出不受影响。
pub fn init_logger(level: LogLevel, file_output: bool, log_file_path: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if file_output {
        let (dir, name) = split_log_path(log_file_path.unwrap_or(DEFAULT_LOG_FILE));
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
        registry
            .with(fmt::layer().with_target(true).with_ansi(true))
            .with(fmt::layer().with_target(true).with_ansi(false).with_writer(appender))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_ansi(true).with_span_events(FmtSpan::CLOSE))
            .try_init()
    };

    installed.map_err(|e| Error::Log(e.to_string()))
}

/// 拆成滚动文件需要的目录和文件名
fn split_log_path(path: &str) -> (PathBuf, String) {
    let path = Path::new(path);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_owned();
    (dir, name)
}

impl LogLevel {
    /// `EnvFilter` 指令
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[macro_export]
macro_rules! engine_info {
    ($($arg:tt)*) => { tracing::info!(target: "legacy_render::engine", $($arg)*) };
}

#[macro_export]
macro_rules! engine_warn {
    ($($arg:tt)*) => { tracing::warn!(target: "legacy_render::engine", $($arg)*) };
}

#[macro_export]
macro_rules! engine_error {
    ($($arg:tt)*) => { tracing::error!(target: "legacy_render::engine", $($arg)*) };
}

/// TRACE 级别的计时 span，配合 `FmtSpan::CLOSE` 在退出时打印耗时
///
/// ```no_run
/// let _span = legacy_render::span_trace!("execute_batch").entered();
/// ```
#[macro_export]
macro_rules! span_trace {
    ($name:expr) => {
        tracing::span!(tracing::Level::TRACE, $name)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(LogLevel::Warn.directive(), "warn");
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path("logs/frame.log");
        assert_eq!(dir, PathBuf::from("logs"));
        assert_eq!(name, "frame.log");

        let (dir, name) = split_log_path("bare.log");
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "bare.log");
    }
}
