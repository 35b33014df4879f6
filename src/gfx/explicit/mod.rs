//! 显式 API 后端驱动
//!
//! `ExplicitDriver<D>` 在任意 `DeviceBackend` 之上实现完整的 `GraphicsDriver`：
//!
//! - **句柄表**：每种资源一张 `HandleTable`，句柄带代数，销毁后的旧句柄被拒绝
//! - **状态缓存**：状态设置只写 `DriverStateCache`，绘制前按管线键懒惰地创建/绑定管线
//! - **双缓冲帧**：`FrameRing` 驱动帧状态机，开始第 i 帧前等待第 i-2 帧的 Fence
//! - **延迟销毁**：被在飞帧引用的设备对象挂在帧槽位上，Fence 完成后才 drop
//! - **CPU 影子副本**：锁定操作写入影子副本，解锁时上传；GPU 占用时换用新的设备对象
//!
//! 设备丢失或交换链失效后，帧操作一直失败，直到调用方显式 `resize_swap_chain`。

mod draw;
mod resources;

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::device::DeviceBackend;
use super::driver::{DriverCaps, GraphicsDriver, TextureLock, WindowTarget};
use super::handle::{
    DepthStencilHandle, Handle, HandleTable, IndexBufferHandle, RenderTargetHandle,
    ShaderHandle, TextureHandle, VertexBufferHandle, VertexFormatHandle,
};
use super::state::{DriverStateCache, PipelineKey, MAX_LIGHTS, MAX_TEXTURE_STAGES};
use super::sync::{FrameRing, FrameState};
use super::types::{
    BackendType, BlendStateDescriptor, Color, DepthStencilStateDescriptor, IndexFormat, Light,
    Material, Matrix4, PrimitiveType, RasterizerStateDescriptor, Rect, RenderState, SamplerState,
    TextureDescriptor, TextureFormat, TransformType, VertexElement, Viewport,
};
use crate::core::config::GraphicsConfig;
use crate::core::error::{DriverError, DriverResult};

use resources::{BufferEntry, SurfaceEntry, TextureEntry};

/// 驱动设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    /// 等待帧 Fence 的上限
    pub fence_timeout: Duration,
    pub vsync: bool,
}

impl DriverSettings {
    pub fn from_config(config: &GraphicsConfig) -> Self {
        Self {
            fence_timeout: Duration::from_millis(config.fence_timeout_ms),
            vsync: config.vsync,
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            fence_timeout: Duration::from_millis(1000),
            vsync: true,
        }
    }
}

/// 等待延迟销毁的设备对象
pub enum Retired<D: DeviceBackend> {
    Buffer(D::Buffer),
    Image(D::Image),
    Shader(D::Shader),
    Pipeline(D::Pipeline),
}

/// 显式 API 后端驱动
pub struct ExplicitDriver<D: DeviceBackend> {
    device: D,
    settings: DriverSettings,
    initialized: bool,
    fullscreen: bool,
    extent: (u32, u32),
    /// 设备丢失或交换链失效，等待 `resize_swap_chain`
    lost: Option<DriverError>,
    state: DriverStateCache,
    ring: FrameRing<Retired<D>>,
    vertex_buffers: HandleTable<VertexBufferHandle, BufferEntry<D::Buffer>>,
    index_buffers: HandleTable<IndexBufferHandle, BufferEntry<D::Buffer>>,
    textures: HandleTable<TextureHandle, TextureEntry<D::Image>>,
    render_targets: HandleTable<RenderTargetHandle, SurfaceEntry<D::Image>>,
    depth_stencils: HandleTable<DepthStencilHandle, SurfaceEntry<D::Image>>,
    vertex_formats: HandleTable<VertexFormatHandle, Vec<VertexElement>>,
    shaders: HandleTable<ShaderHandle, D::Shader>,
    pipelines: HashMap<PipelineKey, D::Pipeline>,
    last_error: String,
}

impl<D: DeviceBackend> ExplicitDriver<D> {
    pub fn new(device: D, settings: DriverSettings) -> Self {
        Self {
            device,
            settings,
            initialized: false,
            fullscreen: false,
            extent: (0, 0),
            lost: None,
            state: DriverStateCache::new(),
            ring: FrameRing::new(),
            vertex_buffers: HandleTable::new(),
            index_buffers: HandleTable::new(),
            textures: HandleTable::new(),
            render_targets: HandleTable::new(),
            depth_stencils: HandleTable::new(),
            vertex_formats: HandleTable::new(),
            shaders: HandleTable::new(),
            pipelines: HashMap::new(),
            last_error: String::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// 等待释放的设备对象数
    pub fn pending_destructions(&self) -> usize {
        self.ring.pending_destructions()
    }

    /// 已缓存的管线对象数
    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    /// 句柄当前对应的设备缓冲区（重命名后会变化）
    pub fn vertex_buffer_object(&self, buffer: VertexBufferHandle) -> DriverResult<&D::Buffer> {
        Ok(&self.vertex_buffers.get(buffer)?.buffer)
    }

    pub fn texture_object(&self, texture: TextureHandle) -> DriverResult<&D::Image> {
        Ok(&self.textures.get(texture)?.image)
    }

    /// 记录失败，设备/交换链丢失时进入待重置状态
    fn fail(&mut self, err: DriverError) -> DriverError {
        if err.requires_reset() && self.lost.is_none() {
            error!(error = %err, "Device requires reset");
            self.lost = Some(err.clone());
        } else {
            debug!(error = %err, "Driver call failed");
        }
        self.last_error = err.to_string();
        err
    }

    fn track<T>(&mut self, result: DriverResult<T>) -> DriverResult<T> {
        result.map_err(|err| self.fail(err))
    }

    fn ensure_initialized(&self) -> DriverResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(DriverError::NotInitialized)
        }
    }

    fn recording_slot(&self) -> DriverResult<usize> {
        if self.ring.state() != FrameState::Recording {
            return Err(DriverError::state("No frame is recording"));
        }
        Ok(self.ring.current_index())
    }

    /// 空闲时立即释放，否则挂到当前帧槽位
    fn retire(&mut self, resource: Retired<D>) {
        drop(self.ring.retire(resource));
    }

    /// 释放槽位 Fence 已完成的对象
    fn release_slot(&mut self, slot: usize) {
        let released = self.ring.complete(slot);
        if !released.is_empty() {
            debug!(slot, count = released.len(), "Released deferred resources");
        }
    }

    fn begin_frame_impl(&mut self) -> DriverResult<()> {
        self.ensure_initialized()?;
        if let Some(lost) = &self.lost {
            return Err(lost.clone());
        }
        if self.ring.state() != FrameState::Idle {
            return Err(DriverError::state("Frame already in progress"));
        }

        // 复用槽位前等待第 i-2 帧的 Fence
        let slot = self.ring.next_index();
        if self.ring.pending_fence_for_next().is_some() {
            self.device.wait_for_slot(slot, self.settings.fence_timeout)?;
        }
        self.release_slot(slot);

        let clear_color = self.state.clear_color();
        self.device
            .begin_frame(slot, clear_color, self.settings.fence_timeout)?;
        self.ring.begin();
        self.state.invalidate_pipeline();
        Ok(())
    }

    fn end_frame_impl(&mut self) -> DriverResult<()> {
        let slot = self.recording_slot()?;
        if let Err(err) = self.device.end_frame(slot) {
            self.device.abandon_frame(slot);
            self.ring.abandon();
            return Err(err);
        }
        self.ring.submit();
        Ok(())
    }

    fn present_impl(&mut self) -> DriverResult<()> {
        if self.ring.state() != FrameState::Submitted {
            return Err(DriverError::state("Frame has not been submitted"));
        }
        let slot = self.ring.current_index();
        // 呈现失败时帧已经提交，状态机仍然回到 Idle
        let result = self.device.present(slot);
        self.ring.present();
        result
    }

    fn clear_impl(&mut self, color: Color, clear_depth: bool) -> DriverResult<()> {
        let slot = self.recording_slot()?;
        self.device
            .clear(slot, Some(color), clear_depth.then_some(1.0))
    }

    fn resize_impl(&mut self, width: u32, height: u32) -> DriverResult<()> {
        self.ensure_initialized()?;
        if width == 0 || height == 0 {
            return Err(DriverError::argument("Swap chain extent must be non-zero"));
        }
        if self.ring.state() != FrameState::Idle {
            return Err(DriverError::state("Cannot resize the swap chain during a frame"));
        }
        if let Err(err) = self.device.wait_idle() {
            warn!(error = %err, "Wait for idle failed before swap chain rebuild");
        }
        drop(self.ring.complete_all());
        self.device.resize(width, height)?;

        if let Some(lost) = self.lost.take() {
            info!(reason = %lost, "Device reset");
        }
        self.extent = (width, height);
        self.state.set_viewport(Viewport::new(0, 0, width, height));
        self.state.invalidate_pipeline();
        debug!(width, height, "Swap chain resized");
        Ok(())
    }

    fn wait_for_gpu_impl(&mut self) -> DriverResult<()> {
        self.ensure_initialized()?;
        self.device.wait_idle()?;
        drop(self.ring.complete_all());
        Ok(())
    }

    fn flush_impl(&mut self) -> DriverResult<()> {
        self.ensure_initialized()?;
        let current = self.ring.current_index();
        let recording = self.ring.state() == FrameState::Recording;
        for slot in 0..super::sync::FRAMES_IN_FLIGHT {
            let in_flight = self.ring.slot(slot).map(|s| s.is_in_flight()).unwrap_or(false);
            if !in_flight || (recording && slot == current) {
                continue;
            }
            // 零超时轮询，未完成的槽位留到下次
            if self.device.wait_for_slot(slot, Duration::ZERO).is_ok() {
                self.release_slot(slot);
            }
        }
        Ok(())
    }

    fn stage_index(stage: u32) -> DriverResult<usize> {
        let stage = stage as usize;
        if stage >= MAX_TEXTURE_STAGES {
            return Err(DriverError::argument(format!("Texture stage {stage} out of range")));
        }
        Ok(stage)
    }

    fn light_index(&self, index: u32) -> DriverResult<usize> {
        let limit = (self.device.capabilities().max_lights as usize).min(MAX_LIGHTS);
        if index as usize >= limit {
            return Err(DriverError::CapacityExceeded {
                what: "light",
                limit,
            });
        }
        Ok(index as usize)
    }
}

impl<D: DeviceBackend> GraphicsDriver for ExplicitDriver<D> {
    fn initialize(
        &mut self,
        window: Option<WindowTarget>,
        width: u32,
        height: u32,
        fullscreen: bool,
    ) -> DriverResult<()> {
        if self.initialized {
            return Err(self.fail(DriverError::state("Driver already initialized")));
        }
        if width == 0 || height == 0 {
            return Err(self.fail(DriverError::argument("Swap chain extent must be non-zero")));
        }
        let vsync = self.settings.vsync;
        if let Err(err) = self.device.initialize(window, width, height, vsync) {
            let err = match err {
                DriverError::Initialization(_) => err,
                other => DriverError::Initialization(other.to_string()),
            };
            return Err(self.fail(err));
        }

        self.initialized = true;
        self.fullscreen = fullscreen;
        self.extent = (width, height);
        self.lost = None;
        self.state.reset();
        self.state.set_viewport(Viewport::new(0, 0, width, height));
        info!(
            backend = self.device.name(),
            width,
            height,
            fullscreen,
            "Graphics driver initialized"
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        if self.ring.state() == FrameState::Recording {
            self.device.abandon_frame(self.ring.current_index());
            self.ring.abandon();
        }
        if let Err(err) = self.device.wait_idle() {
            warn!(error = %err, "Wait for idle failed during shutdown");
        }

        drop(self.ring.complete_all());
        self.pipelines.clear();
        self.vertex_buffers.drain().for_each(drop);
        self.index_buffers.drain().for_each(drop);
        self.textures.drain().for_each(drop);
        self.render_targets.drain().for_each(drop);
        self.depth_stencils.drain().for_each(drop);
        self.vertex_formats.drain().for_each(drop);
        self.shaders.drain().for_each(drop);
        self.device.shutdown();

        self.state.reset();
        self.ring = FrameRing::new();
        self.lost = None;
        self.initialized = false;
        info!(backend = self.device.name(), "Graphics driver shut down");
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn backend_type(&self) -> BackendType {
        self.device.backend_type()
    }

    fn backend_name(&self) -> &str {
        self.device.name()
    }

    fn version_string(&self) -> String {
        self.device.version()
    }

    fn begin_frame(&mut self) -> DriverResult<()> {
        let result = self.begin_frame_impl();
        self.track(result)
    }

    fn end_frame(&mut self) -> DriverResult<()> {
        let result = self.end_frame_impl();
        self.track(result)
    }

    fn present(&mut self) -> DriverResult<()> {
        let result = self.present_impl();
        self.track(result)
    }

    fn frame_state(&self) -> FrameState {
        self.ring.state()
    }

    fn clear(&mut self, color: Color, clear_depth: bool) -> DriverResult<()> {
        let result = self.clear_impl(color, clear_depth);
        self.track(result)
    }

    fn set_clear_color(&mut self, color: Color) {
        self.state.set_clear_color(color);
    }

    fn draw_primitive(
        &mut self,
        primitive: PrimitiveType,
        start_vertex: u32,
        primitive_count: u32,
    ) -> DriverResult<()> {
        let result = self.draw_impl(primitive, draw::DrawRange::vertices(start_vertex, primitive_count));
        self.track(result)
    }

    fn draw_indexed_primitive(
        &mut self,
        primitive: PrimitiveType,
        base_vertex: i32,
        start_index: u32,
        primitive_count: u32,
    ) -> DriverResult<()> {
        let range = draw::DrawRange::indices(base_vertex, start_index, primitive_count);
        let result = self.draw_impl(primitive, range);
        self.track(result)
    }

    fn draw_primitive_instanced(
        &mut self,
        primitive: PrimitiveType,
        start_vertex: u32,
        primitive_count: u32,
        instance_count: u32,
        first_instance: u32,
    ) -> DriverResult<()> {
        let range = draw::DrawRange::vertices(start_vertex, primitive_count)
            .instanced(instance_count, first_instance);
        let result = self.draw_impl(primitive, range);
        self.track(result)
    }

    fn draw_indexed_primitive_instanced(
        &mut self,
        primitive: PrimitiveType,
        base_vertex: i32,
        start_index: u32,
        primitive_count: u32,
        instance_count: u32,
        first_instance: u32,
    ) -> DriverResult<()> {
        let range = draw::DrawRange::indices(base_vertex, start_index, primitive_count)
            .instanced(instance_count, first_instance);
        let result = self.draw_impl(primitive, range);
        self.track(result)
    }

    fn draw_primitive_up(
        &mut self,
        primitive: PrimitiveType,
        primitive_count: u32,
        vertex_data: &[u8],
        vertex_stride: u32,
    ) -> DriverResult<()> {
        let result = self.draw_user_impl(
            primitive,
            primitive_count,
            draw::UserVertices { data: vertex_data, stride: vertex_stride, min_index: 0, count: 0 },
            None,
        );
        self.track(result)
    }

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
    ) -> DriverResult<()> {
        let result = self.draw_user_impl(
            primitive,
            primitive_count,
            draw::UserVertices {
                data: vertex_data,
                stride: vertex_stride,
                min_index: min_vertex_index,
                count: vertex_count,
            },
            Some((index_data, index_format)),
        );
        self.track(result)
    }

    fn set_render_state(&mut self, state: RenderState, value: u64) -> DriverResult<()> {
        self.state.set_render_state(state, value);
        Ok(())
    }

    fn render_state(&self, state: RenderState) -> u64 {
        self.state.render_state(state)
    }

    fn set_blend_state(&mut self, desc: &BlendStateDescriptor) -> DriverResult<()> {
        self.state.set_blend_state(desc);
        Ok(())
    }

    fn set_depth_stencil_state(&mut self, desc: &DepthStencilStateDescriptor) -> DriverResult<()> {
        self.state.set_depth_stencil_state(desc);
        Ok(())
    }

    fn set_rasterizer_state(&mut self, desc: &RasterizerStateDescriptor) -> DriverResult<()> {
        self.state.set_rasterizer_state(desc);
        Ok(())
    }

    fn set_scissor_rect(&mut self, rect: Rect) -> DriverResult<()> {
        if rect.is_empty() {
            return Err(self.fail(DriverError::argument(format!(
                "Invalid scissor rectangle ({}, {}, {}, {})",
                rect.left, rect.top, rect.right, rect.bottom
            ))));
        }
        self.state.set_scissor(rect);
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) -> DriverResult<()> {
        if viewport.width == 0 || viewport.height == 0 || viewport.min_z > viewport.max_z {
            return Err(self.fail(DriverError::argument("Invalid viewport")));
        }
        self.state.set_viewport(viewport);
        Ok(())
    }

    fn viewport(&self) -> Viewport {
        self.state.viewport()
    }

    fn set_transform(&mut self, ty: TransformType, matrix: Matrix4) {
        self.state.set_transform(ty, matrix);
    }

    fn transform(&self, ty: TransformType) -> Matrix4 {
        self.state.transform(ty)
    }

    fn set_material(&mut self, material: Material) {
        self.state.set_material(material);
    }

    fn material(&self) -> Material {
        self.state.material()
    }

    fn set_light(&mut self, index: u32, light: &Light) -> DriverResult<()> {
        let result = self.light_index(index);
        let index = self.track(result)?;
        self.state.set_light(index, *light);
        Ok(())
    }

    fn disable_light(&mut self, index: u32) -> DriverResult<()> {
        let result = self.light_index(index);
        let index = self.track(result)?;
        self.state.disable_light(index);
        Ok(())
    }

    fn is_light_enabled(&self, index: u32) -> bool {
        self.state.is_light_enabled(index as usize)
    }

    fn set_ambient_light(&mut self, color: Color) {
        self.state.set_ambient(color);
    }

    fn set_sampler_state(&mut self, stage: u32, state: SamplerState, value: u32) -> DriverResult<()> {
        let stage = self.track(Self::stage_index(stage))?;
        self.state.set_sampler_state(stage, state, value);
        Ok(())
    }

    fn sampler_state(&self, stage: u32, state: SamplerState) -> DriverResult<u32> {
        let stage = Self::stage_index(stage)?;
        self.state
            .sampler_state(stage, state)
            .ok_or_else(|| DriverError::argument(format!("Unknown sampler state {state:?}")))
    }

    fn create_vertex_buffer(
        &mut self,
        size: usize,
        dynamic: bool,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<VertexBufferHandle> {
        let result = self.create_vertex_buffer_impl(size, dynamic, initial_data);
        self.track(result)
    }

    fn destroy_vertex_buffer(&mut self, buffer: VertexBufferHandle) -> DriverResult<()> {
        let result = self.destroy_vertex_buffer_impl(buffer);
        self.track(result)
    }

    fn lock_vertex_buffer(
        &mut self,
        buffer: VertexBufferHandle,
        offset: usize,
        size: usize,
    ) -> DriverResult<&mut [u8]> {
        let range = match self
            .vertex_buffers
            .get_mut(buffer)
            .and_then(|entry| entry.lock("Vertex buffer", offset, size))
        {
            Ok(range) => range,
            Err(err) => return Err(self.fail(err)),
        };
        Ok(&mut self.vertex_buffers.get_mut(buffer)?.shadow[range])
    }

    fn unlock_vertex_buffer(&mut self, buffer: VertexBufferHandle) -> DriverResult<()> {
        let result = self.unlock_vertex_buffer_impl(buffer);
        self.track(result)
    }

    fn locked_vertex_data(&mut self, buffer: VertexBufferHandle) -> Option<&mut [u8]> {
        self.vertex_buffers.get_mut(buffer).ok()?.locked_window()
    }

    fn vertex_buffer_size(&self, buffer: VertexBufferHandle) -> DriverResult<usize> {
        Ok(self.vertex_buffers.get(buffer)?.shadow.len())
    }

    fn create_index_buffer(
        &mut self,
        size: usize,
        format: IndexFormat,
        dynamic: bool,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<IndexBufferHandle> {
        let result = self.create_index_buffer_impl(size, format, dynamic, initial_data);
        self.track(result)
    }

    fn destroy_index_buffer(&mut self, buffer: IndexBufferHandle) -> DriverResult<()> {
        let result = self.destroy_index_buffer_impl(buffer);
        self.track(result)
    }

    fn lock_index_buffer(
        &mut self,
        buffer: IndexBufferHandle,
        offset: usize,
        size: usize,
    ) -> DriverResult<&mut [u8]> {
        let range = match self
            .index_buffers
            .get_mut(buffer)
            .and_then(|entry| entry.lock("Index buffer", offset, size))
        {
            Ok(range) => range,
            Err(err) => return Err(self.fail(err)),
        };
        Ok(&mut self.index_buffers.get_mut(buffer)?.shadow[range])
    }

    fn unlock_index_buffer(&mut self, buffer: IndexBufferHandle) -> DriverResult<()> {
        let result = self.unlock_index_buffer_impl(buffer);
        self.track(result)
    }

    fn locked_index_data(&mut self, buffer: IndexBufferHandle) -> Option<&mut [u8]> {
        self.index_buffers.get_mut(buffer).ok()?.locked_window()
    }

    fn index_buffer_size(&self, buffer: IndexBufferHandle) -> DriverResult<usize> {
        Ok(self.index_buffers.get(buffer)?.shadow.len())
    }

    fn create_vertex_format(&mut self, elements: &[VertexElement]) -> DriverResult<VertexFormatHandle> {
        let result = self.create_vertex_format_impl(elements);
        self.track(result)
    }

    fn destroy_vertex_format(&mut self, format: VertexFormatHandle) -> DriverResult<()> {
        let result = self.destroy_vertex_format_impl(format);
        self.track(result)
    }

    fn set_vertex_format(&mut self, format: VertexFormatHandle) -> DriverResult<()> {
        if format.is_valid() && !self.vertex_formats.contains(format) {
            return Err(self.fail(format.invalid_error()));
        }
        self.state.set_vertex_format(format);
        Ok(())
    }

    fn set_stream_source(
        &mut self,
        stream: u32,
        buffer: VertexBufferHandle,
        offset: u32,
        stride: u32,
    ) -> DriverResult<()> {
        let result = self.set_stream_source_impl(stream, buffer, offset, stride);
        self.track(result)
    }

    fn set_index_buffer(&mut self, buffer: IndexBufferHandle, base_index: u32) -> DriverResult<()> {
        if buffer.is_valid() && !self.index_buffers.contains(buffer) {
            return Err(self.fail(buffer.invalid_error()));
        }
        self.state.set_index_buffer(buffer, base_index);
        Ok(())
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<TextureHandle> {
        let result = self.create_texture_impl(desc, initial_data);
        self.track(result)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) -> DriverResult<()> {
        let result = self.destroy_texture_impl(texture);
        self.track(result)
    }

    fn set_texture(&mut self, stage: u32, texture: TextureHandle) -> DriverResult<()> {
        let stage = self.track(Self::stage_index(stage))?;
        if texture.is_valid() && !self.textures.contains(texture) {
            return Err(self.fail(texture.invalid_error()));
        }
        self.state.set_texture(stage, texture);
        Ok(())
    }

    fn texture(&self, stage: u32) -> TextureHandle {
        self.state.texture(stage as usize)
    }

    fn lock_texture(&mut self, texture: TextureHandle, level: u32) -> DriverResult<TextureLock<'_>> {
        let pitch = match self
            .textures
            .get_mut(texture)
            .and_then(|entry| entry.lock(level))
        {
            Ok(pitch) => pitch,
            Err(err) => return Err(self.fail(err)),
        };
        let entry = self.textures.get_mut(texture)?;
        Ok(TextureLock {
            data: &mut entry.levels[level as usize],
            pitch,
        })
    }

    fn unlock_texture(&mut self, texture: TextureHandle, level: u32) -> DriverResult<()> {
        let result = self.unlock_texture_impl(texture, level);
        self.track(result)
    }

    fn texture_descriptor(&self, texture: TextureHandle) -> DriverResult<TextureDescriptor> {
        Ok(self.textures.get(texture)?.desc)
    }

    fn update_texture(&mut self, texture: TextureHandle, region: Rect, data: &[u8]) -> DriverResult<()> {
        let result = self.update_texture_impl(texture, region, data);
        self.track(result)
    }

    fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<RenderTargetHandle> {
        let result = self.create_render_target_impl(width, height, format);
        self.track(result)
    }

    fn destroy_render_target(&mut self, target: RenderTargetHandle) -> DriverResult<()> {
        let result = self.render_targets.remove(target);
        let entry = self.track(result)?;
        debug!(width = entry.desc.width, height = entry.desc.height, "Render target destroyed");
        self.state.unbind_render_target(target);
        self.retire(Retired::Image(entry.image));
        Ok(())
    }

    fn set_render_target(&mut self, index: u32, target: RenderTargetHandle) -> DriverResult<()> {
        if target.is_valid() && !self.render_targets.contains(target) {
            return Err(self.fail(target.invalid_error()));
        }
        if !self.state.set_render_target(index as usize, target) {
            return Err(self.fail(DriverError::argument(format!(
                "Render target index {index} out of range"
            ))));
        }
        Ok(())
    }

    fn render_target(&self, index: u32) -> RenderTargetHandle {
        self.state.render_target(index as usize)
    }

    fn create_depth_stencil(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<DepthStencilHandle> {
        let result = self.create_depth_stencil_impl(width, height, format);
        self.track(result)
    }

    fn destroy_depth_stencil(&mut self, depth: DepthStencilHandle) -> DriverResult<()> {
        let result = self.depth_stencils.remove(depth);
        let entry = self.track(result)?;
        debug!(format = ?entry.desc.format, "Depth stencil destroyed");
        self.state.unbind_depth_stencil(depth);
        self.retire(Retired::Image(entry.image));
        Ok(())
    }

    fn set_depth_stencil(&mut self, depth: DepthStencilHandle) -> DriverResult<()> {
        if depth.is_valid() && !self.depth_stencils.contains(depth) {
            return Err(self.fail(depth.invalid_error()));
        }
        self.state.set_depth_stencil(depth);
        Ok(())
    }

    fn depth_stencil(&self) -> DepthStencilHandle {
        self.state.depth_stencil()
    }

    fn create_shader_program(&mut self, vertex: &[u8], fragment: &[u8]) -> DriverResult<ShaderHandle> {
        let result = self
            .ensure_initialized()
            .and_then(|_| self.device.create_shader(vertex, fragment));
        let shader = self.track(result)?;
        let handle = self.shaders.insert(shader);
        debug!(handle = handle.to_raw(), "Shader program created");
        Ok(handle)
    }

    fn destroy_shader_program(&mut self, shader: ShaderHandle) -> DriverResult<()> {
        let result = self.shaders.remove(shader);
        let program = self.track(result)?;
        if self.state.shader() == shader {
            self.state.set_shader(ShaderHandle::invalid());
        }
        self.evict_pipelines(|key| key.shader == shader);
        self.retire(Retired::Shader(program));
        Ok(())
    }

    fn set_shader_program(&mut self, shader: ShaderHandle) -> DriverResult<()> {
        if shader.is_valid() && !self.shaders.contains(shader) {
            return Err(self.fail(shader.invalid_error()));
        }
        self.state.set_shader(shader);
        Ok(())
    }

    fn shader_program(&self) -> ShaderHandle {
        self.state.shader()
    }

    fn capabilities(&self) -> DriverCaps {
        self.device.capabilities()
    }

    fn supports_texture_format(&self, format: TextureFormat) -> bool {
        self.device.supports_format(format)
    }

    fn resize_swap_chain(&mut self, width: u32, height: u32) -> DriverResult<()> {
        let result = self.resize_impl(width, height);
        self.track(result)
    }

    fn display_size(&self) -> (u32, u32) {
        self.extent
    }

    fn set_fullscreen(&mut self, fullscreen: bool) -> DriverResult<()> {
        // 窗口模式切换由窗口系统完成，驱动只记录状态
        if self.fullscreen != fullscreen {
            info!(fullscreen, "Fullscreen mode changed");
        }
        self.fullscreen = fullscreen;
        Ok(())
    }

    fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    fn flush(&mut self) -> DriverResult<()> {
        let result = self.flush_impl();
        self.track(result)
    }

    fn wait_for_gpu(&mut self) -> DriverResult<()> {
        let result = self.wait_for_gpu_impl();
        self.track(result)
    }

    fn last_error(&self) -> &str {
        &self.last_error
    }
}

impl<D: DeviceBackend> Drop for ExplicitDriver<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
