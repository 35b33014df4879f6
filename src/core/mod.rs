//! 核心功能模块
//!
//! 提供与具体图形 API 无关的基础设施：配置管理、日志系统和错误处理。
//!
//! # 模块组织
//!
//! - `config`：配置管理，支持从 TOML 文件加载并用命令行参数覆盖
//! - `log`：日志系统，基于 `tracing` 的结构化日志
//! - `error`：错误处理，驱动层与应用层的统一错误类型

pub mod config;
pub mod error;
pub mod log;

pub use config::Config;
pub use error::{DriverError, DriverResult, Error, Result};
