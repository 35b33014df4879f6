//! 图形驱动层
//!
//! 旧式固定管线调用面（`GraphicsDriver`）到显式图形 API 的翻译层：
//! - `driver`：驱动能力接口，调用方只依赖它
//! - `explicit`：基于 `DeviceBackend` 的通用驱动实现（句柄表、状态缓存、双缓冲、延迟销毁）
//! - `vulkan`：vulkano 设备
//! - `headless`：内存设备，软件后端和测试使用
//! - `factory`：后端选择和 `GraphicsContext`
//!
//! 其余模块是驱动契约的组成部分：句柄、类型、格式计算、状态缓存和帧同步。

pub mod device;
pub mod driver;
pub mod explicit;
pub mod factory;
pub mod format;
pub mod handle;
pub mod headless;
pub mod state;
pub mod sync;
pub mod types;
pub mod vulkan;

pub use driver::{DriverCaps, GraphicsDriver, TextureLock, WindowTarget};
pub use explicit::{DriverSettings, ExplicitDriver};
pub use factory::{GraphicsContext, SharedDriver};
pub use headless::HeadlessDevice;
pub use types::BackendType;
pub use vulkan::VulkanDevice;
