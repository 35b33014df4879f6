//! 错误处理模块
//!
//! 定义了驱动层、批处理层和兼容层共用的错误类型，使用 `thiserror` 生成错误消息。
//!
//! # 设计原则
//!
//! - 所有失败都以 `Result` 返回，不 panic
//! - `DriverError` 的每个变体对应一类失败：初始化、无效句柄、容量超限、非法状态转换、设备丢失
//! - 有状态的组件在每条失败路径上都会记录最后一条错误消息（见 `GraphicsDriver::last_error`）

/// 引擎统一的 Result 类型
///
/// 应用层（配置、日志、入口）使用这个类型。
pub type Result<T> = std::result::Result<T, Error>;

/// 驱动层的 Result 类型
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// 顶层错误类型
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 驱动错误
    #[error("Graphics driver error: {0}")]
    Driver(#[from] DriverError),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 日志系统错误
    #[error("Logging error: {0}")]
    Log(String),
}

/// 配置相关的错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// 配置文件解析失败
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// 配置值无效
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 驱动、批处理引擎和兼容层的错误
///
/// 变体与错误分类一一对应：
///
/// - 初始化失败：`Initialization` / `NotInitialized`
/// - 无效句柄：`InvalidHandle`
/// - 容量超限：`CapacityExceeded`
/// - 非法状态转换：`InvalidState`
/// - 设备/交换链丢失：`DeviceLost` / `SwapchainLost`，需要显式调用 resize 才能恢复
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// 初始化失败（缺少表面、设备等）
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// 驱动尚未初始化
    #[error("Driver not initialized")]
    NotInitialized,

    /// 未知或已销毁的句柄
    #[error("Invalid {kind} handle: {raw:#x}")]
    InvalidHandle { kind: &'static str, raw: u64 },

    /// 表或批次已满
    #[error("{what} overflow (limit {limit})")]
    CapacityExceeded { what: &'static str, limit: usize },

    /// 非法状态转换（重复 BeginFrame、录制窗口外追加命令、重复加锁等）
    #[error("{0}")]
    InvalidState(String),

    /// 参数无效
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 设备丢失
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// 交换链过期，需要调用 resize_swap_chain
    #[error("Swapchain out of date, resize required")]
    SwapchainLost,

    /// 等待 Fence 超时
    #[error("Fence wait timed out after {0} ms")]
    Timeout(u64),

    /// 显存不足
    #[error("Out of device memory")]
    OutOfMemory,

    /// 后端或格式不支持
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// 其他后端错误
    #[error("Backend error: {0}")]
    Backend(String),
}

impl DriverError {
    /// 构造非法状态错误
    pub fn state(message: impl Into<String>) -> Self {
        DriverError::InvalidState(message.into())
    }

    /// 构造参数错误
    pub fn argument(message: impl Into<String>) -> Self {
        DriverError::InvalidArgument(message.into())
    }

    /// 是否需要调用方显式 resize/reset 才能继续
    pub fn requires_reset(&self) -> bool {
        matches!(self, DriverError::DeviceLost(_) | DriverError::SwapchainLost)
    }
}
