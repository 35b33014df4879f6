//! Vulkan 后端
//!
//! - `context`：实例、表面、物理/逻辑设备和分配器
//! - `swapchain`：交换链、渲染通道、每槽位的深度图像和帧缓冲
//! - `pipeline`：`PipelineKey` 到 `GraphicsPipeline`
//! - `convert`：格式和状态枚举的转换、错误分类
//! - `device`：`DeviceBackend` 实现
//! - `shaders`：固定管线着色器（编译期由 GLSL 生成 SPIR-V）

pub mod context;
pub mod convert;
pub mod device;
pub mod pipeline;
pub mod shaders;
pub mod swapchain;

pub use context::VulkanContext;
pub use device::{VulkanBuffer, VulkanDevice, VulkanImage, VulkanShader};
pub use pipeline::VulkanPipeline;
