//! 图形驱动的统一抽象接口
//!
//! `GraphicsDriver` 是旧式固定管线调用面与具体后端之间唯一稳定的契约。
//! 调用方只持有句柄和 `dyn GraphicsDriver`，从不依赖具体类型。
//!
//! # 设计理念
//!
//! - **句柄寻址**：所有资源都通过 `gfx::handle` 中的不透明句柄访问
//! - **失败即返回**：可能失败的操作返回 `DriverResult`，同时更新 `last_error()`，从不 panic
//! - **状态缓存**：状态设置只写缓存，绘制时再统一应用到后端

use raw_window_handle::{
    HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle,
};

use super::handle::{
    DepthStencilHandle, IndexBufferHandle, RenderTargetHandle, ShaderHandle, TextureHandle,
    VertexBufferHandle, VertexFormatHandle,
};
use super::sync::FrameState;
use super::types::{
    BackendType, BlendStateDescriptor, Color, DepthStencilStateDescriptor, IndexFormat, Light,
    Material, Matrix4, PrimitiveType, RasterizerStateDescriptor, Rect, RenderState, SamplerState,
    TextureDescriptor, TextureFormat, TransformType, VertexElement, Viewport,
};
use crate::core::error::{DriverError, DriverResult};

/// 原生窗口目标
///
/// 驱动只借用窗口句柄创建表面，从不拥有窗口本身。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTarget {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
}

impl WindowTarget {
    pub fn new(window: RawWindowHandle, display: RawDisplayHandle) -> Self {
        Self { window, display }
    }

    /// 从任意提供窗口/显示句柄的对象（如 winit 窗口）构造
    pub fn from_window<W>(window: &W) -> DriverResult<Self>
    where
        W: HasWindowHandle + HasDisplayHandle + ?Sized,
    {
        let window_handle = window
            .window_handle()
            .map_err(|e| DriverError::Initialization(format!("Window handle unavailable: {e}")))?;
        let display_handle = window
            .display_handle()
            .map_err(|e| DriverError::Initialization(format!("Display handle unavailable: {e}")))?;
        Ok(Self::new(window_handle.as_raw(), display_handle.as_raw()))
    }
}

/// 单次绘制允许的最多图元数
pub const MAX_PRIMITIVE_COUNT: u32 = 0x00FF_FFFF;

/// 设备能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCaps {
    pub max_texture_width: u32,
    pub max_texture_height: u32,
    pub max_texture_stages: u32,
    pub max_lights: u32,
    pub max_streams: u32,
    pub max_stream_stride: u32,
    pub max_primitive_count: u32,
    pub max_vertex_index: u32,
    pub max_anisotropy: u32,
    pub hardware_transform_and_light: bool,
    pub pixel_shaders: bool,
    pub vertex_shaders: bool,
    pub compressed_textures: bool,
}

impl Default for DriverCaps {
    fn default() -> Self {
        Self {
            max_texture_width: 4096,
            max_texture_height: 4096,
            max_texture_stages: super::state::MAX_TEXTURE_STAGES as u32,
            max_lights: super::state::MAX_LIGHTS as u32,
            max_streams: super::state::MAX_STREAMS as u32,
            max_stream_stride: 2048,
            max_primitive_count: MAX_PRIMITIVE_COUNT,
            max_vertex_index: 0x00FF_FFFF,
            max_anisotropy: 16,
            hardware_transform_and_light: true,
            pixel_shaders: true,
            vertex_shaders: true,
            compressed_textures: true,
        }
    }
}

/// 纹理锁定得到的 CPU 可写窗口
#[derive(Debug)]
pub struct TextureLock<'a> {
    pub data: &'a mut [u8],
    /// 行距（压缩格式为一行块的字节数）
    pub pitch: u32,
}

/// 图形驱动接口
///
/// 所有后端驱动都实现此 trait。帧状态机：
/// `Idle -(begin_frame)-> Recording -(end_frame)-> Submitted -(present)-> Idle`，
/// 同一时间只能有一帧处于打开状态。
pub trait GraphicsDriver {
    // ---- 生命周期 ----

    /// 初始化驱动
    ///
    /// # 参数
    ///
    /// * `window` - 原生窗口；软件后端允许为空
    /// * `width` / `height` - 交换链尺寸
    /// * `fullscreen` - 是否全屏
    ///
    /// # 返回值
    ///
    /// 后端或窗口表面不可用时返回 `DriverError::Initialization`
    fn initialize(
        &mut self,
        window: Option<WindowTarget>,
        width: u32,
        height: u32,
        fullscreen: bool,
    ) -> DriverResult<()>;

    /// 释放全部资源，可重复调用
    fn shutdown(&mut self);

    fn is_initialized(&self) -> bool;

    fn backend_type(&self) -> BackendType;

    /// 后端名称（如 "Vulkan"）
    fn backend_name(&self) -> &str;

    /// 后端和设备的版本描述
    fn version_string(&self) -> String;

    // ---- 帧 ----

    /// 开始新的一帧
    ///
    /// 等待同一槽位上一次提交的 Fence（有超时），获取交换链图像并开始录制。
    /// 已有打开的帧或设备丢失时失败。
    fn begin_frame(&mut self) -> DriverResult<()>;

    /// 结束录制并提交
    fn end_frame(&mut self) -> DriverResult<()>;

    /// 呈现已提交的帧
    fn present(&mut self) -> DriverResult<()>;

    fn frame_state(&self) -> FrameState;

    /// 帧内清屏（颜色，可选深度）
    fn clear(&mut self, color: Color, clear_depth: bool) -> DriverResult<()>;

    /// 设置下一帧开始时使用的清屏颜色
    fn set_clear_color(&mut self, color: Color);

    // ---- 绘制 ----

    fn draw_primitive(
        &mut self,
        primitive: PrimitiveType,
        start_vertex: u32,
        primitive_count: u32,
    ) -> DriverResult<()>;

    /// 使用 `set_index_buffer` 绑定的索引缓冲区绘制
    fn draw_indexed_primitive(
        &mut self,
        primitive: PrimitiveType,
        base_vertex: i32,
        start_index: u32,
        primitive_count: u32,
    ) -> DriverResult<()>;

    fn draw_primitive_instanced(
        &mut self,
        primitive: PrimitiveType,
        start_vertex: u32,
        primitive_count: u32,
        instance_count: u32,
        first_instance: u32,
    ) -> DriverResult<()>;

    fn draw_indexed_primitive_instanced(
        &mut self,
        primitive: PrimitiveType,
        base_vertex: i32,
        start_index: u32,
        primitive_count: u32,
        instance_count: u32,
        first_instance: u32,
    ) -> DriverResult<()>;

    /// 用户内存中的顶点，驱动复制到临时缓冲区后绘制
    fn draw_primitive_up(
        &mut self,
        primitive: PrimitiveType,
        primitive_count: u32,
        vertex_data: &[u8],
        vertex_stride: u32,
    ) -> DriverResult<()>;

    /// 用户内存中的索引和顶点
    #[allow(clippy::too_many_arguments)]
    fn draw_indexed_primitive_up(
        &mut self,
        primitive: PrimitiveType,
        min_vertex_index: u32,
        vertex_count: u32,
        primitive_count: u32,
        index_data: &[u8],
        index_format: IndexFormat,
        vertex_data: &[u8],
        vertex_stride: u32,
    ) -> DriverResult<()>;

    // ---- 渲染状态 ----

    fn set_render_state(&mut self, state: RenderState, value: u64) -> DriverResult<()>;

    fn render_state(&self, state: RenderState) -> u64;

    fn set_blend_state(&mut self, desc: &BlendStateDescriptor) -> DriverResult<()>;

    fn set_depth_stencil_state(&mut self, desc: &DepthStencilStateDescriptor) -> DriverResult<()>;

    fn set_rasterizer_state(&mut self, desc: &RasterizerStateDescriptor) -> DriverResult<()>;

    /// `left >= right` 或 `top >= bottom` 的矩形被拒绝
    fn set_scissor_rect(&mut self, rect: Rect) -> DriverResult<()>;

    fn set_viewport(&mut self, viewport: Viewport) -> DriverResult<()>;

    fn viewport(&self) -> Viewport;

    fn set_transform(&mut self, ty: TransformType, matrix: Matrix4);

    fn transform(&self, ty: TransformType) -> Matrix4;

    fn set_material(&mut self, material: Material);

    fn material(&self) -> Material;

    fn set_light(&mut self, index: u32, light: &Light) -> DriverResult<()>;

    fn disable_light(&mut self, index: u32) -> DriverResult<()>;

    fn is_light_enabled(&self, index: u32) -> bool;

    fn set_ambient_light(&mut self, color: Color);

    fn set_sampler_state(&mut self, stage: u32, state: SamplerState, value: u32) -> DriverResult<()>;

    fn sampler_state(&self, stage: u32, state: SamplerState) -> DriverResult<u32>;

    // ---- 顶点/索引缓冲区 ----

    fn create_vertex_buffer(
        &mut self,
        size: usize,
        dynamic: bool,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<VertexBufferHandle>;

    /// 销毁缓冲区；GPU 仍在使用时推迟到对应帧的 Fence 完成后释放
    fn destroy_vertex_buffer(&mut self, buffer: VertexBufferHandle) -> DriverResult<()>;

    /// 锁定 `[offset, offset + size)`，`size` 为 0 表示到末尾
    ///
    /// 重复锁定返回之前锁定的窗口并记录警告。
    fn lock_vertex_buffer(
        &mut self,
        buffer: VertexBufferHandle,
        offset: usize,
        size: usize,
    ) -> DriverResult<&mut [u8]>;

    fn unlock_vertex_buffer(&mut self, buffer: VertexBufferHandle) -> DriverResult<()>;

    /// 当前锁定的窗口，未锁定时返回 `None`
    fn locked_vertex_data(&mut self, buffer: VertexBufferHandle) -> Option<&mut [u8]>;

    fn vertex_buffer_size(&self, buffer: VertexBufferHandle) -> DriverResult<usize>;

    fn create_index_buffer(
        &mut self,
        size: usize,
        format: IndexFormat,
        dynamic: bool,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<IndexBufferHandle>;

    fn destroy_index_buffer(&mut self, buffer: IndexBufferHandle) -> DriverResult<()>;

    fn lock_index_buffer(
        &mut self,
        buffer: IndexBufferHandle,
        offset: usize,
        size: usize,
    ) -> DriverResult<&mut [u8]>;

    fn unlock_index_buffer(&mut self, buffer: IndexBufferHandle) -> DriverResult<()>;

    fn locked_index_data(&mut self, buffer: IndexBufferHandle) -> Option<&mut [u8]>;

    fn index_buffer_size(&self, buffer: IndexBufferHandle) -> DriverResult<usize>;

    fn create_vertex_format(&mut self, elements: &[VertexElement]) -> DriverResult<VertexFormatHandle>;

    fn destroy_vertex_format(&mut self, format: VertexFormatHandle) -> DriverResult<()>;

    fn set_vertex_format(&mut self, format: VertexFormatHandle) -> DriverResult<()>;

    /// 绑定顶点流，传入无效句柄表示解绑
    fn set_stream_source(
        &mut self,
        stream: u32,
        buffer: VertexBufferHandle,
        offset: u32,
        stride: u32,
    ) -> DriverResult<()>;

    /// 绑定索引缓冲区，`base_index` 加到每次索引绘制的起始索引上
    fn set_index_buffer(&mut self, buffer: IndexBufferHandle, base_index: u32) -> DriverResult<()>;

    // ---- 纹理 ----

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<TextureHandle>;

    fn destroy_texture(&mut self, texture: TextureHandle) -> DriverResult<()>;

    /// 绑定到采样器阶段，传入无效句柄表示解绑
    fn set_texture(&mut self, stage: u32, texture: TextureHandle) -> DriverResult<()>;

    fn texture(&self, stage: u32) -> TextureHandle;

    fn lock_texture(&mut self, texture: TextureHandle, level: u32) -> DriverResult<TextureLock<'_>>;

    fn unlock_texture(&mut self, texture: TextureHandle, level: u32) -> DriverResult<()>;

    fn texture_descriptor(&self, texture: TextureHandle) -> DriverResult<TextureDescriptor>;

    /// 更新第 0 层的子区域，`data` 按区域宽度紧密排列
    fn update_texture(&mut self, texture: TextureHandle, region: Rect, data: &[u8]) -> DriverResult<()>;

    // ---- 渲染目标 ----

    fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<RenderTargetHandle>;

    fn destroy_render_target(&mut self, target: RenderTargetHandle) -> DriverResult<()>;

    /// 无效句柄表示交换链的后台缓冲区
    fn set_render_target(&mut self, index: u32, target: RenderTargetHandle) -> DriverResult<()>;

    fn render_target(&self, index: u32) -> RenderTargetHandle;

    fn create_depth_stencil(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<DepthStencilHandle>;

    fn destroy_depth_stencil(&mut self, depth: DepthStencilHandle) -> DriverResult<()>;

    fn set_depth_stencil(&mut self, depth: DepthStencilHandle) -> DriverResult<()>;

    fn depth_stencil(&self) -> DepthStencilHandle;

    // ---- 着色器 ----

    /// 从调用方提供的 SPIR-V 字节码创建着色器程序
    fn create_shader_program(&mut self, vertex: &[u8], fragment: &[u8]) -> DriverResult<ShaderHandle>;

    fn destroy_shader_program(&mut self, shader: ShaderHandle) -> DriverResult<()>;

    /// 无效句柄表示固定管线着色器
    fn set_shader_program(&mut self, shader: ShaderHandle) -> DriverResult<()>;

    fn shader_program(&self) -> ShaderHandle;

    // ---- 能力查询 ----

    fn capabilities(&self) -> DriverCaps;

    fn supports_texture_format(&self, format: TextureFormat) -> bool;

    fn max_texture_size(&self) -> (u32, u32) {
        let caps = self.capabilities();
        (caps.max_texture_width, caps.max_texture_height)
    }

    fn max_lights(&self) -> u32 {
        self.capabilities().max_lights
    }

    fn supports_hardware_transform_and_light(&self) -> bool {
        self.capabilities().hardware_transform_and_light
    }

    fn supports_pixel_shaders(&self) -> bool {
        self.capabilities().pixel_shaders
    }

    fn supports_vertex_shaders(&self) -> bool {
        self.capabilities().vertex_shaders
    }

    fn supports_compressed_textures(&self) -> bool {
        self.capabilities().compressed_textures
    }

    fn max_primitive_count(&self) -> u32 {
        self.capabilities().max_primitive_count
    }

    fn max_vertex_index(&self) -> u32 {
        self.capabilities().max_vertex_index
    }

    fn max_stream_stride(&self) -> u32 {
        self.capabilities().max_stream_stride
    }

    // ---- 显示 ----

    /// 重建交换链；设备/交换链丢失后必须调用
    fn resize_swap_chain(&mut self, width: u32, height: u32) -> DriverResult<()>;

    fn display_size(&self) -> (u32, u32);

    fn set_fullscreen(&mut self, fullscreen: bool) -> DriverResult<()>;

    fn is_fullscreen(&self) -> bool;

    /// 回收已经完成的帧资源，不阻塞
    fn flush(&mut self) -> DriverResult<()>;

    /// 等待 GPU 完成全部已提交工作
    fn wait_for_gpu(&mut self) -> DriverResult<()>;

    /// 最近一次失败的描述，没有失败时为空字符串
    fn last_error(&self) -> &str;
}
