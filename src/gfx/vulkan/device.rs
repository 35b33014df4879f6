//! Vulkan 设备
//!
//! 用 vulkano 实现 `DeviceBackend`。每个帧槽位持有自己的命令缓冲区构建器、
//! 交换链获取 future 和提交后的 Fence future；等待 Fence 后 drop future，
//! vulkano 随之释放该帧对缓冲区和图像的占用。
//!
//! # 资源占用
//!
//! 槽位记录自己命令引用的资源 id。写入被录制中或在飞槽位引用的资源时返回
//! `WriteOutcome::Busy`，驱动换用新对象；vulkano 报告的访问冲突同样视为 `Busy`。
//!
//! # 限制
//!
//! - 离屏渲染目标只做簿记，绘制仍然输出到交换链（首次出现时警告）
//! - 纹理上传是同步的：录制一次性命令缓冲区并等待其 Fence

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use vulkano::buffer::{Buffer, BufferCreateInfo, BufferUsage, Subbuffer};
use vulkano::command_buffer::{
    AutoCommandBufferBuilder, BufferImageCopy, ClearAttachment, ClearRect, CommandBufferUsage,
    CopyBufferToImageInfo, PrimaryAutoCommandBuffer, RenderPassBeginInfo, SubpassBeginInfo,
    SubpassContents, SubpassEndInfo,
};
use vulkano::descriptor_set::{PersistentDescriptorSet, WriteDescriptorSet};
use vulkano::format::{ClearColorValue, FormatFeatures};
use vulkano::image::sampler::{Sampler, SamplerCreateInfo};
use vulkano::image::view::ImageView;
use vulkano::image::{
    Image, ImageAspects, ImageCreateInfo, ImageSubresourceLayers, ImageType,
    ImageUsage as VkImageUsage,
};
use vulkano::memory::allocator::{AllocationCreateInfo, MemoryTypeFilter};
use vulkano::pipeline::graphics::viewport::{Scissor, Viewport as VkViewport};
use vulkano::pipeline::{Pipeline, PipelineBindPoint};
use vulkano::render_pass::Subpass;
use vulkano::shader::{ShaderModule, ShaderModuleCreateInfo};
use vulkano::swapchain::{acquire_next_image, SwapchainAcquireFuture, SwapchainPresentInfo};
use vulkano::sync::future::FenceSignalFuture;
use vulkano::sync::{self, GpuFuture};

use super::context::VulkanContext;
use super::convert::{self, classify, classify_wait};
use super::pipeline::{self, PipelineInputs, VulkanPipeline};
use super::shaders::{fixed_fs, fixed_vs};
use super::swapchain::SwapchainTargets;
use crate::core::error::{DriverError, DriverResult};
use crate::gfx::device::{
    spirv_words, BufferKind, DeviceBackend, DrawCall, ImageDesc, ImageUsage, WriteOutcome,
};
use crate::gfx::driver::{DriverCaps, WindowTarget};
use crate::gfx::format::FormatInfo;
use crate::gfx::state::{PipelineKey, MAX_STREAMS};
use crate::gfx::sync::FRAMES_IN_FLIGHT;
use crate::gfx::types::{BackendType, Color, IndexFormat, Rect, TextureFormat, VertexElement};

/// 顶点或索引缓冲区
pub struct VulkanBuffer {
    id: u64,
    kind: BufferKind,
    /// 调用方请求的大小（实际分配向上取整到 4 字节）
    size: usize,
    buffer: Subbuffer<[u8]>,
}

impl VulkanBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }
}

pub struct VulkanImage {
    id: u64,
    desc: ImageDesc,
    image: Arc<Image>,
    view: Arc<ImageView>,
}

impl VulkanImage {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct VulkanShader {
    id: u64,
    vertex: Arc<ShaderModule>,
    fragment: Arc<ShaderModule>,
}

impl VulkanShader {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// 初始化后才存在的设备对象
struct Gpu {
    context: VulkanContext,
    targets: SwapchainTargets,
    fixed_vs: Arc<ShaderModule>,
    fixed_fs: Arc<ShaderModule>,
    sampler: Arc<Sampler>,
    /// 着色器需要纹理但采样器阶段 0 未绑定时使用的 1x1 白色纹理
    white: Arc<ImageView>,
}

#[derive(Default)]
struct FrameSlot {
    builder: Option<AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>>,
    acquire: Option<SwapchainAcquireFuture>,
    image_index: u32,
    /// 已提交、尚未呈现
    submitted: Option<Box<dyn GpuFuture>>,
    fence: Option<FenceSignalFuture<Box<dyn GpuFuture>>>,
    referenced: HashSet<u64>,
}

impl FrameSlot {
    fn is_busy(&self) -> bool {
        self.builder.is_some() || self.submitted.is_some() || self.fence.is_some()
    }

    fn reset(&mut self) {
        *self = FrameSlot::default();
    }
}

/// vulkano 设备
pub struct VulkanDevice {
    gpu: Option<Gpu>,
    slots: Vec<FrameSlot>,
    next_id: u64,
    offscreen_warned: bool,
}

impl VulkanDevice {
    pub fn new() -> Self {
        Self {
            gpu: None,
            slots: (0..FRAMES_IN_FLIGHT).map(|_| FrameSlot::default()).collect(),
            next_id: 1,
            offscreen_warned: false,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn gpu(&self) -> DriverResult<&Gpu> {
        self.gpu.as_ref().ok_or(DriverError::NotInitialized)
    }

    fn slot_mut(&mut self, slot: usize) -> DriverResult<&mut FrameSlot> {
        self.slots
            .get_mut(slot)
            .ok_or_else(|| DriverError::argument(format!("Frame slot {slot} out of range")))
    }

    fn in_use(&self, id: u64) -> bool {
        self.slots
            .iter()
            .any(|s| s.is_busy() && s.referenced.contains(&id))
    }

    fn wait_all(&mut self) -> DriverResult<()> {
        for slot in &mut self.slots {
            if let Some(submitted) = slot.submitted.take() {
                let fence = submitted
                    .then_signal_fence_and_flush()
                    .map_err(|e| classify("Failed to flush frame", e))?;
                slot.fence = Some(fence);
            }
            if let Some(fence) = slot.fence.take() {
                fence
                    .wait(None)
                    .map_err(|e| classify("Fence wait failed", e))?;
            }
            slot.referenced.clear();
        }
        Ok(())
    }
}

impl Default for VulkanDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn buffer_usage(kind: BufferKind) -> BufferUsage {
    match kind {
        BufferKind::Vertex => BufferUsage::VERTEX_BUFFER,
        BufferKind::Index => BufferUsage::INDEX_BUFFER,
    }
}

fn create_image(context: &VulkanContext, desc: &ImageDesc) -> DriverResult<(Arc<Image>, Arc<ImageView>)> {
    let format = convert::texture_format(desc.format).ok_or_else(|| {
        DriverError::Unsupported(format!("Texture format {:?} has no Vulkan equivalent", desc.format))
    })?;
    let usage = match desc.usage {
        ImageUsage::Sampled => VkImageUsage::SAMPLED | VkImageUsage::TRANSFER_DST,
        ImageUsage::RenderTarget => VkImageUsage::COLOR_ATTACHMENT | VkImageUsage::SAMPLED,
        ImageUsage::DepthStencil => VkImageUsage::DEPTH_STENCIL_ATTACHMENT,
    };
    let image = Image::new(
        context.memory_allocator.clone(),
        ImageCreateInfo {
            image_type: ImageType::Dim2d,
            format,
            extent: [desc.width, desc.height, 1],
            mip_levels: desc.mip_levels.max(1),
            usage,
            ..Default::default()
        },
        AllocationCreateInfo::default(),
    )
    .map_err(|e| classify("Failed to create image", e))?;
    let view = ImageView::new_default(image.clone())
        .map_err(|e| classify("Failed to create image view", e))?;
    Ok((image, view))
}

/// 经暂存缓冲区把一块数据复制到图像的一层 mip，并等待完成
fn upload_image(
    context: &VulkanContext,
    image: &Arc<Image>,
    level: u32,
    region: Rect,
    data: &[u8],
    row_length: u32,
) -> DriverResult<()> {
    if data.is_empty() {
        return Err(DriverError::argument("Image upload data is empty"));
    }
    let staging = Buffer::from_iter(
        context.memory_allocator.clone(),
        BufferCreateInfo {
            usage: BufferUsage::TRANSFER_SRC,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_HOST
                | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
            ..Default::default()
        },
        data.iter().copied(),
    )
    .map_err(|e| classify("Failed to create staging buffer", e))?;

    let mut builder = AutoCommandBufferBuilder::primary(
        &context.command_buffer_allocator,
        context.queue_family_index(),
        CommandBufferUsage::OneTimeSubmit,
    )
    .map_err(|e| classify("Failed to create upload command buffer", e))?;

    builder
        .copy_buffer_to_image(CopyBufferToImageInfo {
            regions: [BufferImageCopy {
                buffer_row_length: row_length,
                image_subresource: ImageSubresourceLayers {
                    aspects: ImageAspects::COLOR,
                    mip_level: level,
                    array_layers: 0..1,
                },
                image_offset: [region.left.max(0) as u32, region.top.max(0) as u32, 0],
                image_extent: [region.width(), region.height(), 1],
                ..Default::default()
            }]
            .into(),
            ..CopyBufferToImageInfo::buffer_image(staging, image.clone())
        })
        .map_err(|e| classify("Failed to record image upload", e))?;

    let command_buffer = builder
        .build()
        .map_err(|e| classify("Failed to build upload command buffer", e))?;

    sync::now(context.device.clone())
        .then_execute(context.queue.clone(), command_buffer)
        .map_err(|e| classify("Failed to execute image upload", e))?
        .then_signal_fence_and_flush()
        .map_err(|e| classify("Failed to flush image upload", e))?
        .wait(None)
        .map_err(|e| classify("Image upload wait failed", e))?;
    Ok(())
}

/// 行距换算为纹素（压缩格式按 4x4 块）
fn row_length_texels(format: TextureFormat, row_pitch: u32) -> u32 {
    if format.is_compressed() {
        row_pitch / format.block_bytes() * 4
    } else {
        row_pitch / format.bytes_per_pixel().max(1)
    }
}

impl DeviceBackend for VulkanDevice {
    type Buffer = VulkanBuffer;
    type Image = VulkanImage;
    type Shader = VulkanShader;
    type Pipeline = VulkanPipeline;

    fn backend_type(&self) -> BackendType {
        BackendType::Vulkan
    }

    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn version(&self) -> String {
        match &self.gpu {
            Some(gpu) => {
                let properties = gpu.context.physical.properties();
                format!(
                    "Vulkan {} ({})",
                    gpu.context.physical.api_version(),
                    properties.device_name
                )
            }
            None => "Vulkan (not initialized)".to_string(),
        }
    }

    fn capabilities(&self) -> DriverCaps {
        let Some(gpu) = &self.gpu else {
            return DriverCaps::default();
        };
        let physical = &gpu.context.physical;
        let properties = physical.properties();
        DriverCaps {
            max_texture_width: properties.max_image_dimension2_d,
            max_texture_height: properties.max_image_dimension2_d,
            max_streams: properties.max_vertex_input_bindings.min(MAX_STREAMS as u32),
            max_stream_stride: properties.max_vertex_input_binding_stride,
            max_vertex_index: properties.max_draw_indexed_index_value,
            max_anisotropy: properties.max_sampler_anisotropy as u32,
            compressed_textures: physical.supported_features().texture_compression_bc,
            ..DriverCaps::default()
        }
    }

    fn supports_format(&self, format: TextureFormat) -> bool {
        let Some(vk_format) = convert::texture_format(format) else {
            return false;
        };
        let Some(gpu) = &self.gpu else {
            return true;
        };
        let required = if format.is_depth() {
            FormatFeatures::DEPTH_STENCIL_ATTACHMENT
        } else {
            FormatFeatures::SAMPLED_IMAGE
        };
        gpu.context
            .physical
            .format_properties(vk_format)
            .map(|properties| properties.optimal_tiling_features.intersects(required))
            .unwrap_or(false)
    }

    fn initialize(
        &mut self,
        window: Option<WindowTarget>,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> DriverResult<()> {
        let target = window.ok_or_else(|| {
            DriverError::Initialization("Vulkan backend requires a window".into())
        })?;

        let context = VulkanContext::new(&target)?;
        let targets = SwapchainTargets::new(&context, [width, height], vsync)?;

        let fixed_vs = fixed_vs::load(context.device.clone())
            .map_err(|e| classify("Failed to load fixed-function vertex shader", e))?;
        let fixed_fs = fixed_fs::load(context.device.clone())
            .map_err(|e| classify("Failed to load fixed-function fragment shader", e))?;

        let sampler = Sampler::new(context.device.clone(), SamplerCreateInfo::simple_repeat_linear())
            .map_err(|e| classify("Failed to create sampler", e))?;

        let white_desc = ImageDesc {
            width: 1,
            height: 1,
            format: TextureFormat::A8B8G8R8,
            mip_levels: 1,
            usage: ImageUsage::Sampled,
        };
        let (white_image, white) = create_image(&context, &white_desc)?;
        upload_image(&context, &white_image, 0, Rect::new(0, 0, 1, 1), &[0xFF; 4], 0)?;

        self.gpu = Some(Gpu {
            context,
            targets,
            fixed_vs,
            fixed_fs,
            sampler,
            white,
        });
        for slot in &mut self.slots {
            slot.reset();
        }
        info!(version = %self.version(), "Vulkan device initialized");
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.wait_all() {
            warn!(error = %err, "Wait for frames failed during shutdown");
        }
        for slot in &mut self.slots {
            slot.reset();
        }
        self.gpu = None;
        debug!("Vulkan device shut down");
    }

    fn resize(&mut self, width: u32, height: u32) -> DriverResult<()> {
        self.gpu()?;
        // 设备丢失后 Fence 可能永远不会完成，这里只记录错误
        if let Err(err) = self.wait_all() {
            warn!(error = %err, "Wait for frames failed before swapchain rebuild");
        }
        for slot in &mut self.slots {
            slot.reset();
        }
        let gpu = self.gpu.as_mut().ok_or(DriverError::NotInitialized)?;
        gpu.targets.rebuild(&gpu.context, [width, height])
    }

    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> DriverResult<Self::Buffer> {
        if size == 0 {
            return Err(DriverError::argument("Buffer size must be non-zero"));
        }
        let gpu = self.gpu()?;
        // 索引缓冲区按 u16/u32 重新解释，分配大小保持 4 字节对齐
        let allocated = (size + 3) & !3;
        let buffer = Buffer::new_slice::<u8>(
            gpu.context.memory_allocator.clone(),
            BufferCreateInfo {
                usage: buffer_usage(kind),
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE
                    | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            allocated as u64,
        )
        .map_err(|e| classify("Failed to create buffer", e))?;

        let id = self.allocate_id();
        trace!(id, size, ?kind, "Buffer created");
        Ok(VulkanBuffer { id, kind, size, buffer })
    }

    fn write_buffer(
        &mut self,
        buffer: &Self::Buffer,
        offset: usize,
        data: &[u8],
    ) -> DriverResult<WriteOutcome> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= buffer.size)
            .ok_or_else(|| DriverError::argument("Buffer write out of range"))?;
        if self.in_use(buffer.id) {
            return Ok(WriteOutcome::Busy);
        }
        match buffer.buffer.write() {
            Ok(mut contents) => {
                contents[offset..end].copy_from_slice(data);
                Ok(WriteOutcome::Written)
            }
            Err(e) if format!("{:?}", e).contains("AccessConflict") => Ok(WriteOutcome::Busy),
            Err(e) => Err(classify("Failed to map buffer", e)),
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> DriverResult<Self::Image> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DriverError::argument("Image extent must be non-zero"));
        }
        let (image, view) = create_image(&self.gpu()?.context, desc)?;
        let id = self.allocate_id();
        trace!(id, width = desc.width, height = desc.height, format = ?desc.format, "Image created");
        Ok(VulkanImage {
            id,
            desc: *desc,
            image,
            view,
        })
    }

    fn write_image(
        &mut self,
        image: &Self::Image,
        level: u32,
        region: Rect,
        data: &[u8],
        row_pitch: u32,
    ) -> DriverResult<WriteOutcome> {
        if image.desc.usage != ImageUsage::Sampled {
            return Err(DriverError::Unsupported(
                "Only sampled images accept CPU uploads".into(),
            ));
        }
        if level >= image.desc.mip_levels.max(1) || region.is_empty() {
            return Err(DriverError::argument("Image write region out of range"));
        }
        if self.in_use(image.id) {
            return Ok(WriteOutcome::Busy);
        }
        let row_length = row_length_texels(image.desc.format, row_pitch);
        let context = &self.gpu()?.context;
        match upload_image(context, &image.image, level, region, data, row_length) {
            Ok(()) => Ok(WriteOutcome::Written),
            Err(DriverError::Backend(message)) if message.contains("AccessConflict") => {
                Ok(WriteOutcome::Busy)
            }
            Err(err) => Err(err),
        }
    }

    fn create_shader(&mut self, vertex: &[u8], fragment: &[u8]) -> DriverResult<Self::Shader> {
        let vertex_words = spirv_words(vertex)?;
        let fragment_words = spirv_words(fragment)?;
        let device = self.gpu()?.context.device.clone();

        let vertex = unsafe { ShaderModule::new(device.clone(), ShaderModuleCreateInfo::new(&vertex_words)) }
            .map_err(|e| DriverError::argument(format!("Invalid vertex shader: {:?}", e)))?;
        let fragment = unsafe { ShaderModule::new(device, ShaderModuleCreateInfo::new(&fragment_words)) }
            .map_err(|e| DriverError::argument(format!("Invalid fragment shader: {:?}", e)))?;

        let id = self.allocate_id();
        debug!(id, "Shader program created");
        Ok(VulkanShader { id, vertex, fragment })
    }

    fn create_pipeline(
        &mut self,
        key: &PipelineKey,
        elements: &[VertexElement],
        shader: Option<&Self::Shader>,
    ) -> DriverResult<Self::Pipeline> {
        let id = self.allocate_id();
        let gpu = self.gpu()?;
        let (vertex, fragment) = match shader {
            Some(shader) => (&shader.vertex, &shader.fragment),
            None => (&gpu.fixed_vs, &gpu.fixed_fs),
        };
        let subpass = Subpass::from(gpu.targets.render_pass.clone(), 0)
            .ok_or_else(|| DriverError::Backend("Render pass has no subpass 0".into()))?;
        pipeline::build(
            id,
            PipelineInputs {
                device: &gpu.context.device,
                subpass,
                vertex,
                fragment,
                non_solid_fill: gpu.context.non_solid_fill,
            },
            key,
            elements,
        )
    }

    fn wait_for_slot(&mut self, slot: usize, timeout: Duration) -> DriverResult<()> {
        let state = self.slot_mut(slot)?;
        if let Some(fence) = &state.fence {
            fence
                .wait(Some(timeout))
                .map_err(|e| classify_wait("Fence wait failed", e, timeout))?;
        }
        // drop 后 vulkano 释放该帧对资源的占用
        state.fence = None;
        state.referenced.clear();
        trace!(slot, "Frame slot fence signaled");
        Ok(())
    }

    fn begin_frame(&mut self, slot: usize, clear_color: Color, timeout: Duration) -> DriverResult<()> {
        let gpu = self.gpu.as_ref().ok_or(DriverError::NotInitialized)?;
        let state = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| DriverError::argument(format!("Frame slot {slot} out of range")))?;
        if state.builder.is_some() {
            return Err(DriverError::state("Frame slot is already recording"));
        }

        let (image_index, suboptimal, acquire) =
            acquire_next_image(gpu.targets.swapchain.clone(), Some(timeout))
                .map_err(|e| classify_wait("Failed to acquire swapchain image", e, timeout))?;
        if suboptimal {
            debug!("Swapchain suboptimal, resize recommended");
        }

        let framebuffer = gpu
            .targets
            .framebuffers
            .get(slot)
            .and_then(|images| images.get(image_index as usize))
            .cloned()
            .ok_or_else(|| DriverError::Backend(format!("No framebuffer for image {image_index}")))?;

        let mut builder = AutoCommandBufferBuilder::primary(
            &gpu.context.command_buffer_allocator,
            gpu.context.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )
        .map_err(|e| classify("Failed to create command buffer builder", e))?;

        builder
            .begin_render_pass(
                RenderPassBeginInfo {
                    clear_values: vec![Some(clear_color.to_array().into()), Some(1f32.into())],
                    ..RenderPassBeginInfo::framebuffer(framebuffer)
                },
                SubpassBeginInfo {
                    contents: SubpassContents::Inline,
                    ..Default::default()
                },
            )
            .map_err(|e| classify("Failed to begin render pass", e))?;

        state.builder = Some(builder);
        state.acquire = Some(acquire);
        state.image_index = image_index;
        state.referenced.clear();
        trace!(slot, image_index, "Frame recording started");
        Ok(())
    }

    fn clear(&mut self, slot: usize, color: Option<Color>, depth: Option<f32>) -> DriverResult<()> {
        let extent = self.gpu()?.targets.extent;
        let state = self.slot_mut(slot)?;
        let builder = state
            .builder
            .as_mut()
            .ok_or_else(|| DriverError::state("No command buffer is recording"))?;

        let mut attachments = Vec::with_capacity(2);
        if let Some(color) = color {
            attachments.push(ClearAttachment::Color {
                color_attachment: 0,
                clear_value: ClearColorValue::Float(color.to_array()),
            });
        }
        if let Some(depth) = depth {
            attachments.push(ClearAttachment::Depth(depth));
        }
        if attachments.is_empty() {
            return Ok(());
        }
        builder
            .clear_attachments(
                attachments.into_iter().collect(),
                [ClearRect {
                    offset: [0, 0],
                    extent,
                    array_layers: 0..1,
                }]
                .into_iter()
                .collect(),
            )
            .map_err(|e| classify("Failed to record clear", e))?;
        Ok(())
    }

    fn draw(&mut self, slot: usize, call: &DrawCall<'_, Self>) -> DriverResult<()> {
        if call.render_target.is_some() && !self.offscreen_warned {
            warn!("Offscreen render targets are not supported by the Vulkan device, drawing to the swapchain");
            self.offscreen_warned = true;
        }
        let gpu = self.gpu.as_ref().ok_or(DriverError::NotInitialized)?;
        let state = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| DriverError::argument(format!("Frame slot {slot} out of range")))?;
        let builder = state
            .builder
            .as_mut()
            .ok_or_else(|| DriverError::state("No command buffer is recording"))?;

        let pipeline = call.pipeline;
        let layout = pipeline.pipeline.layout().clone();
        let extent = gpu.targets.extent;

        let viewport = VkViewport {
            offset: [call.viewport.x as f32, call.viewport.y as f32],
            extent: [call.viewport.width as f32, call.viewport.height as f32],
            depth_range: call.viewport.min_z..=call.viewport.max_z,
        };
        let scissor = match call.scissor {
            Some(rect) => {
                let left = (rect.left.max(0) as u32).min(extent[0]);
                let top = (rect.top.max(0) as u32).min(extent[1]);
                Scissor {
                    offset: [left, top],
                    extent: [
                        rect.width().min(extent[0] - left),
                        rect.height().min(extent[1] - top),
                    ],
                }
            }
            None => Scissor {
                offset: [0, 0],
                extent,
            },
        };

        builder
            .set_viewport(0, [viewport].into_iter().collect())
            .map_err(|e| classify("Failed to set viewport", e))?
            .set_scissor(0, [scissor].into_iter().collect())
            .map_err(|e| classify("Failed to set scissor", e))?
            .bind_pipeline_graphics(pipeline.pipeline.clone())
            .map_err(|e| classify("Failed to bind pipeline", e))?;

        if pipeline.push_constants {
            builder
                .push_constants(layout.clone(), 0, call.constants)
                .map_err(|e| classify("Failed to push constants", e))?;
        }

        if pipeline.sampled {
            let view = call
                .textures
                .iter()
                .find(|(stage, _)| *stage == 0)
                .map(|(_, image)| image.view.clone())
                .unwrap_or_else(|| gpu.white.clone());
            let set_layout = layout
                .set_layouts()
                .first()
                .ok_or_else(|| DriverError::Backend("Pipeline has no descriptor set layouts".into()))?;
            let set = PersistentDescriptorSet::new(
                &gpu.context.descriptor_allocator,
                set_layout.clone(),
                [WriteDescriptorSet::image_view_sampler(0, view, gpu.sampler.clone())],
                [],
            )
            .map_err(|e| classify("Failed to create descriptor set", e))?;
            builder
                .bind_descriptor_sets(PipelineBindPoint::Graphics, layout.clone(), 0, set)
                .map_err(|e| classify("Failed to bind descriptor set", e))?;
        }

        for binding in &call.vertex_buffers {
            if binding.offset >= binding.buffer.size as u64 {
                return Err(DriverError::argument("Vertex buffer offset out of range"));
            }
            if let Some((_, declared)) = pipeline.strides.iter().find(|(s, _)| *s == binding.stream) {
                if *declared != binding.stride {
                    debug!(
                        stream = binding.stream,
                        bound = binding.stride,
                        declared,
                        "Stream stride differs from vertex format"
                    );
                }
            }
            builder
                .bind_vertex_buffers(binding.stream, binding.buffer.buffer.clone().slice(binding.offset..))
                .map_err(|e| classify("Failed to bind vertex buffer", e))?;
            state.referenced.insert(binding.buffer.id);
        }

        for (_, image) in &call.textures {
            state.referenced.insert(image.id);
        }

        let params = call.params;
        if params.indexed {
            let index = call
                .index_buffer
                .as_ref()
                .ok_or_else(|| DriverError::state("No index buffer bound"))?;
            let size = index.format.size() as u64;
            if index.offset % size != 0 || index.offset >= index.buffer.size as u64 {
                return Err(DriverError::argument("Index buffer offset out of range or misaligned"));
            }
            let indices = index.buffer.buffer.clone().slice(index.offset..);
            match index.format {
                IndexFormat::U16 => builder.bind_index_buffer(indices.reinterpret::<[u16]>()),
                IndexFormat::U32 => builder.bind_index_buffer(indices.reinterpret::<[u32]>()),
            }
            .map_err(|e| classify("Failed to bind index buffer", e))?;
            state.referenced.insert(index.buffer.id);

            builder
                .draw_indexed(
                    params.element_count,
                    params.instance_count,
                    params.first_index,
                    params.vertex_offset,
                    params.first_instance,
                )
                .map_err(|e| classify("Failed to record indexed draw", e))?;
        } else {
            builder
                .draw(
                    params.element_count,
                    params.instance_count,
                    params.first_vertex,
                    params.first_instance,
                )
                .map_err(|e| classify("Failed to record draw", e))?;
        }

        trace!(
            slot,
            pipeline = pipeline.id,
            elements = params.element_count,
            instances = params.instance_count,
            "Draw recorded"
        );
        Ok(())
    }

    fn end_frame(&mut self, slot: usize) -> DriverResult<()> {
        let gpu = self.gpu.as_ref().ok_or(DriverError::NotInitialized)?;
        let state = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| DriverError::argument(format!("Frame slot {slot} out of range")))?;
        let mut builder = state
            .builder
            .take()
            .ok_or_else(|| DriverError::state("No command buffer is recording"))?;
        let acquire = state
            .acquire
            .take()
            .ok_or_else(|| DriverError::state("No swapchain image acquired"))?;

        builder
            .end_render_pass(SubpassEndInfo::default())
            .map_err(|e| classify("Failed to end render pass", e))?;
        let command_buffer = builder
            .build()
            .map_err(|e| classify("Failed to build command buffer", e))?;

        let submitted = acquire
            .then_execute(gpu.context.queue.clone(), command_buffer)
            .map_err(|e| classify("Failed to execute command buffer", e))?
            .then_signal_semaphore_and_flush()
            .map_err(|e| classify("Failed to submit command buffer", e))?;

        state.submitted = Some(submitted.boxed());
        trace!(slot, "Command buffer submitted");
        Ok(())
    }

    fn present(&mut self, slot: usize) -> DriverResult<()> {
        let gpu = self.gpu.as_ref().ok_or(DriverError::NotInitialized)?;
        let state = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| DriverError::argument(format!("Frame slot {slot} out of range")))?;
        let submitted = state
            .submitted
            .take()
            .ok_or_else(|| DriverError::state("Frame slot has no submitted work"))?;

        let fence = submitted
            .then_swapchain_present(
                gpu.context.queue.clone(),
                SwapchainPresentInfo::swapchain_image_index(
                    gpu.targets.swapchain.clone(),
                    state.image_index,
                ),
            )
            .boxed()
            .then_signal_fence_and_flush()
            .map_err(|e| classify("Failed to present", e))?;

        state.fence = Some(fence);
        trace!(slot, image_index = state.image_index, "Frame presented");
        Ok(())
    }

    fn abandon_frame(&mut self, slot: usize) {
        if let Some(state) = self.slots.get_mut(slot) {
            if state.builder.take().is_some() {
                warn!(slot, "Abandoned a recording frame");
            }
            state.acquire = None;
            state.referenced.clear();
        }
    }

    fn wait_idle(&mut self) -> DriverResult<()> {
        if self.gpu.is_none() {
            return Ok(());
        }
        self.wait_all()
    }
}
