//! legacy_render - 旧式固定管线驱动层
//!
//! 让按 DirectX8 习惯编写的固定管线渲染代码运行在显式图形 API（Vulkan）之上。
//! 调用方只面对一个驱动接口，底层负责命令缓冲区、同步和资源生命周期。
//!
//! # 模块结构
//!
//! - `core`: 配置、日志、错误处理
//! - `gfx`: 驱动接口、句柄、状态缓存、帧同步、Vulkan 和无头设备、后端选择
//! - `batch`: 绘制命令批处理（实例化、多 Pass、排序、统计）
//! - `compat`: 旧式调用面（FVF、引用计数缓冲区、内存纹理、设备桩）
//!
//! # 使用示例
//!
//! ```no_run
//! use legacy_render::core::Config;
//! use legacy_render::gfx::{GraphicsContext, BackendType};
//!
//! let config = Config::default();
//! let mut context = GraphicsContext::new();
//! let driver = context.create_driver(&config.graphics, Some(BackendType::Software));
//! driver.borrow_mut().initialize(None, 800, 600, false).unwrap();
//! ```

pub mod batch;
pub mod compat;
pub mod core;
pub mod gfx;
