//! 底层设备接口
//!
//! `DeviceBackend` 是显式图形 API 的最小公共面：缓冲区/图像/着色器/管线的创建、
//! 帧槽位的 Fence 等待、命令录制与提交、呈现。`ExplicitDriver` 在它之上实现
//! 句柄表、状态缓存、双缓冲和延迟销毁，所以每个后端只需要翻译这些调用。
//!
//! # 设计原则
//!
//! - **对象即所有权**：后端对象（`Self::Buffer` 等）被 drop 时释放显存，
//!   驱动通过推迟 drop 来实现延迟销毁
//! - **槽位寻址**：所有录制和同步调用都带帧槽位索引，后端为每个槽位维护独立的命令缓冲区和 Fence

use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use super::driver::{DriverCaps, WindowTarget};
use super::state::{PipelineKey, Topology};
use super::types::{BackendType, Color, IndexFormat, Rect, TextureFormat, VertexElement, Viewport};
use crate::core::error::{DriverError, DriverResult};

/// 缓冲区用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

/// 写入结果
///
/// GPU 仍在读取目标资源时后端返回 `Busy`，由驱动换用新的后端对象（重命名）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Busy,
}

/// 图像用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageUsage {
    Sampled,
    RenderTarget,
    DepthStencil,
}

/// 图像描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub mip_levels: u32,
    pub usage: ImageUsage,
}

/// 固定管线着色器使用的推送常量
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FixedFunctionConstants {
    /// projection * view * world，列主序
    pub world_view_projection: [[f32; 4]; 4],
    /// 材质漫反射颜色（关闭光照时为白色）
    pub diffuse: [f32; 4],
}

impl Default for FixedFunctionConstants {
    fn default() -> Self {
        Self {
            world_view_projection: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
            diffuse: [1.0; 4],
        }
    }
}

/// 一次绘制的图元参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub topology: Topology,
    /// 非索引绘制为顶点数，索引绘制为索引数
    pub element_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
    pub indexed: bool,
}

/// 顶点流绑定
pub struct VertexBinding<'a, B> {
    pub stream: u32,
    pub buffer: &'a B,
    pub offset: u64,
    pub stride: u32,
}

/// 索引缓冲区绑定
pub struct IndexBinding<'a, B> {
    pub buffer: &'a B,
    pub offset: u64,
    pub format: IndexFormat,
}

/// 一次完整的绘制调用，驱动解析完句柄后交给设备录制
pub struct DrawCall<'a, D: DeviceBackend + ?Sized> {
    pub pipeline: &'a D::Pipeline,
    pub vertex_buffers: Vec<VertexBinding<'a, D::Buffer>>,
    pub index_buffer: Option<IndexBinding<'a, D::Buffer>>,
    /// (采样器阶段, 图像)
    pub textures: Vec<(u32, &'a D::Image)>,
    pub render_target: Option<&'a D::Image>,
    pub constants: FixedFunctionConstants,
    pub viewport: Viewport,
    pub scissor: Option<Rect>,
    pub params: DrawParams,
}

/// SPIR-V 魔数
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// 把 SPIR-V 字节码转换为 32 位字
///
/// 长度必须是 4 的倍数且以魔数开头。
pub fn spirv_words(bytes: &[u8]) -> DriverResult<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(DriverError::argument(format!(
            "SPIR-V bytecode length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(DriverError::argument("SPIR-V bytecode has no magic number"));
    }
    Ok(words)
}

/// 显式图形 API 的设备
pub trait DeviceBackend {
    /// 缓冲区对象，drop 时释放
    type Buffer;
    /// 图像对象（纹理、渲染目标、深度模板）
    type Image;
    /// 着色器程序
    type Shader;
    /// 管线对象
    type Pipeline;

    fn backend_type(&self) -> BackendType;

    fn name(&self) -> &'static str;

    fn version(&self) -> String;

    fn capabilities(&self) -> DriverCaps;

    fn supports_format(&self, format: TextureFormat) -> bool;

    /// 创建实例、表面、设备和交换链
    fn initialize(
        &mut self,
        window: Option<WindowTarget>,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> DriverResult<()>;

    /// 释放全部设备对象；调用前驱动已经等待设备空闲
    fn shutdown(&mut self);

    /// 重建交换链
    fn resize(&mut self, width: u32, height: u32) -> DriverResult<()>;

    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> DriverResult<Self::Buffer>;

    fn write_buffer(
        &mut self,
        buffer: &Self::Buffer,
        offset: usize,
        data: &[u8],
    ) -> DriverResult<WriteOutcome>;

    fn create_image(&mut self, desc: &ImageDesc) -> DriverResult<Self::Image>;

    /// 写入一层 mip 的子区域，`data` 按 `row_pitch` 紧密排列
    fn write_image(
        &mut self,
        image: &Self::Image,
        level: u32,
        region: Rect,
        data: &[u8],
        row_pitch: u32,
    ) -> DriverResult<WriteOutcome>;

    /// 从 SPIR-V 字节码创建着色器程序
    fn create_shader(&mut self, vertex: &[u8], fragment: &[u8]) -> DriverResult<Self::Shader>;

    /// 创建管线，`shader` 为空时使用固定管线着色器
    fn create_pipeline(
        &mut self,
        key: &PipelineKey,
        elements: &[VertexElement],
        shader: Option<&Self::Shader>,
    ) -> DriverResult<Self::Pipeline>;

    /// 等待槽位上一次提交的 Fence，超时返回 `DriverError::Timeout`
    fn wait_for_slot(&mut self, slot: usize, timeout: Duration) -> DriverResult<()>;

    /// 获取交换链图像并开始录制槽位的命令缓冲区
    fn begin_frame(&mut self, slot: usize, clear_color: Color, timeout: Duration) -> DriverResult<()>;

    /// 帧内清屏
    fn clear(&mut self, slot: usize, color: Option<Color>, depth: Option<f32>) -> DriverResult<()>;

    fn draw(&mut self, slot: usize, call: &DrawCall<'_, Self>) -> DriverResult<()>;

    /// 结束录制并提交，提交时挂上槽位的 Fence
    fn end_frame(&mut self, slot: usize) -> DriverResult<()>;

    /// 呈现槽位对应的交换链图像
    fn present(&mut self, slot: usize) -> DriverResult<()>;

    /// 放弃槽位上录制到一半的命令
    fn abandon_frame(&mut self, slot: usize);

    /// 等待设备空闲
    fn wait_idle(&mut self) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_layout() {
        // 推送常量按 std430 布局：mat4 + vec4
        assert_eq!(std::mem::size_of::<FixedFunctionConstants>(), 80);
        let constants = FixedFunctionConstants::default();
        let bytes = bytemuck::bytes_of(&constants);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn test_spirv_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 0, 1, 0]);
        assert_eq!(spirv_words(&bytes).unwrap(), vec![SPIRV_MAGIC, 0x0001_0001]);

        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&bytes[..6]).is_err());
        assert!(spirv_words(&[0, 0, 0, 0]).is_err());
    }
}
