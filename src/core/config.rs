//! 配置
//!
//! 启动时从 `config.toml` 读取，缺失的字段取默认值，命令行参数最后覆盖。
//!
//! ```toml
//! [window]
//! width = 800
//! height = 600
//! title = "legacy_render"
//! resizable = true
//! fullscreen = false
//!
//! [graphics]
//! backend = "vulkan"  # vulkan, opengl, dx12, metal, software
//! vsync = true
//! fence_timeout_ms = 1000
//! frames_in_flight = 2
//! max_commands_per_batch = 4096
//! # vertex_shader = "shaders/custom.vert.spv"
//! # fragment_shader = "shaders/custom.frag.spv"
//!
//! [logging]
//! level = "info"      # trace, debug, info, warn, error
//! file_output = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ConfigError, Result};
use crate::gfx::types::BackendType;
use crate::gfx::sync::FRAMES_IN_FLIGHT;

/// 驱动层配置，三个表都可以省略
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub graphics: GraphicsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub resizable: bool,
    pub fullscreen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// 工厂创建驱动时只读取一次
    pub backend: BackendType,
    pub vsync: bool,
    /// BeginFrame 等待 Fence 的上限（毫秒）
    pub fence_timeout_ms: u64,
    /// 只接受 `FRAMES_IN_FLIGHT`
    pub frames_in_flight: usize,
    pub max_commands_per_batch: usize,
    /// SPIR-V 路径，两个都给出时替换内置固定管线着色器
    pub vertex_shader: Option<String>,
    pub fragment_shader: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub file_output: bool,
    pub log_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            title: "legacy_render".to_owned(),
            resizable: true,
            fullscreen: false,
        }
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Vulkan,
            vsync: true,
            fence_timeout_ms: 1000,
            frames_in_flight: FRAMES_IN_FLIGHT,
            max_commands_per_batch: 4096,
            vertex_shader: None,
            fragment_shader: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file_output: false,
            log_file: "legacy_render.log".to_owned(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()).into())
    }

    /// 读取失败（文件缺失或格式错误）时退回默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// 用命令行覆盖配置
    ///
    /// 识别 `--backend <name>`、`--software`、`--width <n>`、`--height <n>` 和
    /// `--fullscreen`，无法解析的值保持原配置。
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let value_of = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .map(String::as_str)
        };
        let has = |flag: &str| args.iter().any(|a| a == flag);

        if let Some(backend) = value_of("--backend").and_then(BackendType::from_name) {
            self.graphics.backend = backend;
        }
        if has("--software") {
            self.graphics.backend = BackendType::Software;
        }
        if let Some(width) = value_of("--width").and_then(|v| v.parse().ok()) {
            self.window.width = width;
        }
        if let Some(height) = value_of("--height").and_then(|v| v.parse().ok()) {
            self.window.height = height;
        }
        if has("--fullscreen") {
            self.window.fullscreen = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: String| -> Result<()> {
            Err(ConfigError::InvalidValue { field: field.to_owned(), reason }.into())
        };

        if self.window.width == 0 || self.window.height == 0 {
            return invalid("window.width/height", "Window dimensions must be greater than 0".into());
        }
        if self.graphics.frames_in_flight != FRAMES_IN_FLIGHT {
            return invalid(
                "graphics.frames_in_flight",
                format!("Only {FRAMES_IN_FLIGHT} frames in flight are supported"),
            );
        }
        if self.graphics.fence_timeout_ms == 0 {
            return invalid("graphics.fence_timeout_ms", "Fence timeout must be greater than 0".into());
        }
        if self.graphics.max_commands_per_batch == 0 {
            return invalid(
                "graphics.max_commands_per_batch",
                "Batch capacity must be greater than 0".into(),
            );
        }
        if self.graphics.vertex_shader.is_some() != self.graphics.fragment_shader.is_some() {
            return invalid(
                "graphics.vertex_shader/fragment_shader",
                "Custom shaders must be given as a pair".into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.graphics.backend, BackendType::Vulkan);
        assert_eq!(config.graphics.frames_in_flight, 2);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.window.width = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.graphics.frames_in_flight = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.graphics.vertex_shader = Some("fixed.vert.spv".into());
        assert!(config.validate().is_err());
        config.graphics.fragment_shader = Some("fixed.frag.spv".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            "[graphics]\nbackend = \"software\"\nfence_timeout_ms = 50\n",
        )
        .unwrap();
        assert_eq!(config.graphics.backend, BackendType::Software);
        assert_eq!(config.graphics.fence_timeout_ms, 50);
        assert_eq!(config.window.width, 800);
        assert!(config.graphics.vsync);
    }

    #[test]
    fn test_backend_alias() {
        let config = Config::from_toml("[graphics]\nbackend = \"directx12\"\n").unwrap();
        assert_eq!(config.graphics.backend, BackendType::Dx12);
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args(["app", "--backend", "dx12", "--width", "1024", "--fullscreen"]);
        assert_eq!(config.graphics.backend, BackendType::Dx12);
        assert_eq!(config.window.width, 1024);
        assert!(config.window.fullscreen);

        config.apply_args(["app", "--software"]);
        assert_eq!(config.graphics.backend, BackendType::Software);
    }
}
