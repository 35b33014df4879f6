//! 驱动状态缓存
//!
//! 记录最后一次设置的渲染状态、每个采样器绑定的纹理、视口、变换矩阵、材质和光源，
//! 使 `get_render_state` / `get_texture` 等查询不需要访问后端。
//!
//! # 延迟管线重建
//!
//! 影响管线对象的状态（混合、深度、剔除、填充、模板、颜色写掩码）发生变化时只置脏标记，
//! 绘制时由驱动用 `pipeline_key()` 生成当前键，与已绑定管线的键比较，不同才重建。

use tracing::warn;

use super::handle::{
    DepthStencilHandle, Handle, IndexBufferHandle, RenderTargetHandle, ShaderHandle,
    TextureHandle, VertexBufferHandle, VertexFormatHandle,
};
use super::types::{
    BlendMode, BlendOp, BlendStateDescriptor, Color, ComparisonFunc, CullMode,
    DepthStencilStateDescriptor, FillMode, Light, Material, Matrix4, PrimitiveType,
    RasterizerStateDescriptor, Rect, RenderState, SamplerState, StencilOp, TransformType,
    Viewport,
};

/// 纹理阶段（采样器）数量
pub const MAX_TEXTURE_STAGES: usize = 8;
/// 光源数量上限
pub const MAX_LIGHTS: usize = 8;
/// 顶点流数量上限
pub const MAX_STREAMS: usize = 16;
/// 同时绑定的渲染目标数量上限
pub const MAX_RENDER_TARGETS: usize = 4;

const SAMPLER_STATE_COUNT: usize = SamplerState::ALL.len();

/// 后端图元拓扑
///
/// 四边形在显式 API 中不存在：四边形带按三角形带绘制，四边形列表降级为三角形列表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl Topology {
    /// 图元类型到拓扑的映射，第二个值表示是否发生了有损降级
    pub fn from_primitive(primitive: PrimitiveType) -> (Self, bool) {
        match primitive {
            PrimitiveType::PointList => (Topology::PointList, false),
            PrimitiveType::LineList => (Topology::LineList, false),
            PrimitiveType::LineStrip => (Topology::LineStrip, false),
            PrimitiveType::TriangleList => (Topology::TriangleList, false),
            PrimitiveType::TriangleStrip | PrimitiveType::QuadStrip => {
                (Topology::TriangleStrip, false)
            }
            PrimitiveType::TriangleFan => (Topology::TriangleFan, false),
            PrimitiveType::QuadList => (Topology::TriangleList, true),
        }
    }
}

/// 管线键
///
/// 决定一个后端管线对象的全部状态。键相同则可以复用已绑定的管线。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub topology: Topology,
    pub blend: BlendStateDescriptor,
    pub depth_stencil: DepthStencilStateDescriptor,
    pub cull_mode: CullMode,
    pub fill_mode: FillMode,
    pub color_write_mask: u8,
    pub vertex_format: VertexFormatHandle,
    pub shader: ShaderHandle,
}

/// 顶点流绑定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSource {
    pub buffer: VertexBufferHandle,
    pub offset: u32,
    pub stride: u32,
}

/// 驱动状态缓存
pub struct DriverStateCache {
    render_states: [u64; RenderState::COUNT],
    sampler_states: [[u32; SAMPLER_STATE_COUNT]; MAX_TEXTURE_STAGES],
    textures: [TextureHandle; MAX_TEXTURE_STAGES],
    streams: [StreamSource; MAX_STREAMS],
    index_buffer: IndexBufferHandle,
    base_index: u32,
    vertex_format: VertexFormatHandle,
    shader: ShaderHandle,
    render_targets: [RenderTargetHandle; MAX_RENDER_TARGETS],
    depth_stencil: DepthStencilHandle,
    viewport: Viewport,
    scissor: Rect,
    depth_bias: (i32, f32),
    world: Matrix4,
    view: Matrix4,
    projection: Matrix4,
    material: Material,
    lights: [Option<Light>; MAX_LIGHTS],
    light_enabled: [bool; MAX_LIGHTS],
    clear_color: Color,
    pipeline_dirty: bool,
    bound_pipeline: Option<PipelineKey>,
}

impl DriverStateCache {
    pub fn new() -> Self {
        let mut sampler_states = [[0u32; SAMPLER_STATE_COUNT]; MAX_TEXTURE_STAGES];
        for stage in sampler_states.iter_mut() {
            for (slot, state) in stage.iter_mut().zip(SamplerState::ALL) {
                *slot = state.default_value();
            }
        }

        let mut render_states = [0u64; RenderState::COUNT];
        for state in RenderState::ALL {
            render_states[state.index()] = state.default_value();
        }

        Self {
            render_states,
            sampler_states,
            textures: [TextureHandle::invalid(); MAX_TEXTURE_STAGES],
            streams: [StreamSource::default(); MAX_STREAMS],
            index_buffer: IndexBufferHandle::invalid(),
            base_index: 0,
            vertex_format: VertexFormatHandle::invalid(),
            shader: ShaderHandle::invalid(),
            render_targets: [RenderTargetHandle::invalid(); MAX_RENDER_TARGETS],
            depth_stencil: DepthStencilHandle::invalid(),
            viewport: Viewport::default(),
            scissor: Rect::default(),
            depth_bias: (0, 0.0),
            world: Matrix4::identity(),
            view: Matrix4::identity(),
            projection: Matrix4::identity(),
            material: Material::default(),
            lights: [None; MAX_LIGHTS],
            light_enabled: [false; MAX_LIGHTS],
            clear_color: Color::BLACK,
            pipeline_dirty: true,
            bound_pipeline: None,
        }
    }

    /// 恢复全部默认状态（设备重置后调用）
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    // ---- 渲染状态 ----

    /// 设置渲染状态，返回旧值
    pub fn set_render_state(&mut self, state: RenderState, value: u64) -> u64 {
        let slot = &mut self.render_states[state.index()];
        let previous = std::mem::replace(slot, value);
        if previous != value && state.affects_pipeline() {
            self.pipeline_dirty = true;
        }
        previous
    }

    pub fn render_state(&self, state: RenderState) -> u64 {
        self.render_states[state.index()]
    }

    fn flag(&self, state: RenderState) -> bool {
        self.render_state(state) != 0
    }

    pub fn set_blend_state(&mut self, desc: &BlendStateDescriptor) {
        self.set_render_state(RenderState::AlphaBlendEnable, desc.enabled as u64);
        self.set_render_state(RenderState::SrcBlend, desc.src_blend.raw());
        self.set_render_state(RenderState::DstBlend, desc.dst_blend.raw());
        self.set_render_state(RenderState::BlendOp, desc.op.raw());
    }

    pub fn set_depth_stencil_state(&mut self, desc: &DepthStencilStateDescriptor) {
        self.set_render_state(RenderState::ZEnable, desc.depth_enable as u64);
        self.set_render_state(RenderState::ZWriteEnable, desc.depth_write_enable as u64);
        self.set_render_state(RenderState::ZFunc, desc.depth_func.raw());
        self.set_render_state(RenderState::StencilEnable, desc.stencil_enable as u64);
        self.set_render_state(RenderState::StencilMask, desc.stencil_read_mask as u64);
        self.set_render_state(RenderState::StencilWriteMask, desc.stencil_write_mask as u64);
        self.set_render_state(RenderState::StencilFunc, desc.stencil_func.raw());
        self.set_render_state(RenderState::StencilFail, desc.stencil_fail.raw());
        self.set_render_state(RenderState::StencilZFail, desc.stencil_depth_fail.raw());
        self.set_render_state(RenderState::StencilPass, desc.stencil_pass.raw());
    }

    pub fn set_rasterizer_state(&mut self, desc: &RasterizerStateDescriptor) {
        self.set_render_state(RenderState::FillMode, desc.fill_mode.raw());
        self.set_render_state(RenderState::CullMode, desc.cull_mode.raw());
        self.set_render_state(RenderState::ScissorTestEnable, desc.scissor_enable as u64);
        self.depth_bias = (desc.depth_bias, desc.slope_scaled_depth_bias);
    }

    pub fn depth_bias(&self) -> (i32, f32) {
        self.depth_bias
    }

    /// 从缓存的渲染状态解码出混合描述，非法数值退回默认值
    pub fn blend_state(&self) -> BlendStateDescriptor {
        let defaults = BlendStateDescriptor::default();
        BlendStateDescriptor {
            enabled: self.flag(RenderState::AlphaBlendEnable),
            src_blend: BlendMode::from_raw(self.render_state(RenderState::SrcBlend))
                .unwrap_or(defaults.src_blend),
            dst_blend: BlendMode::from_raw(self.render_state(RenderState::DstBlend))
                .unwrap_or(defaults.dst_blend),
            op: BlendOp::from_raw(self.render_state(RenderState::BlendOp)).unwrap_or(defaults.op),
        }
    }

    pub fn depth_stencil_state(&self) -> DepthStencilStateDescriptor {
        let defaults = DepthStencilStateDescriptor::default();
        let func = |state| ComparisonFunc::from_raw(self.render_state(state));
        let op = |state| StencilOp::from_raw(self.render_state(state));
        DepthStencilStateDescriptor {
            depth_enable: self.flag(RenderState::ZEnable),
            depth_write_enable: self.flag(RenderState::ZWriteEnable),
            depth_func: func(RenderState::ZFunc).unwrap_or(defaults.depth_func),
            stencil_enable: self.flag(RenderState::StencilEnable),
            stencil_read_mask: self.render_state(RenderState::StencilMask) as u8,
            stencil_write_mask: self.render_state(RenderState::StencilWriteMask) as u8,
            stencil_func: func(RenderState::StencilFunc).unwrap_or(defaults.stencil_func),
            stencil_fail: op(RenderState::StencilFail).unwrap_or(defaults.stencil_fail),
            stencil_depth_fail: op(RenderState::StencilZFail).unwrap_or(defaults.stencil_depth_fail),
            stencil_pass: op(RenderState::StencilPass).unwrap_or(defaults.stencil_pass),
        }
    }

    pub fn cull_mode(&self) -> CullMode {
        CullMode::from_raw(self.render_state(RenderState::CullMode))
            .unwrap_or(CullMode::CounterClockwise)
    }

    pub fn fill_mode(&self) -> FillMode {
        FillMode::from_raw(self.render_state(RenderState::FillMode)).unwrap_or(FillMode::Solid)
    }

    // ---- 管线 ----

    /// 生成当前状态对应的管线键
    pub fn pipeline_key(&self, primitive: PrimitiveType) -> PipelineKey {
        let (topology, downgraded) = Topology::from_primitive(primitive);
        if downgraded {
            warn!(?primitive, "Quad lists are not supported natively, drawing as triangle list");
        }
        PipelineKey {
            topology,
            blend: self.blend_state(),
            depth_stencil: self.depth_stencil_state(),
            cull_mode: self.cull_mode(),
            fill_mode: self.fill_mode(),
            color_write_mask: (self.render_state(RenderState::ColorWriteEnable) & 0xF) as u8,
            vertex_format: self.vertex_format,
            shader: self.shader,
        }
    }

    /// 是否需要为 `key` 重建或重新绑定管线
    pub fn needs_pipeline(&self, key: &PipelineKey) -> bool {
        self.pipeline_dirty || self.bound_pipeline.as_ref() != Some(key)
    }

    /// 记录已经绑定的管线，清除脏标记
    pub fn mark_pipeline_bound(&mut self, key: PipelineKey) {
        self.bound_pipeline = Some(key);
        self.pipeline_dirty = false;
    }

    /// 强制下一次绘制重新绑定管线（新的命令缓冲区开始录制时）
    pub fn invalidate_pipeline(&mut self) {
        self.bound_pipeline = None;
        self.pipeline_dirty = true;
    }

    pub fn is_pipeline_dirty(&self) -> bool {
        self.pipeline_dirty
    }

    // ---- 资源绑定 ----

    pub fn set_texture(&mut self, stage: usize, texture: TextureHandle) -> Option<TextureHandle> {
        let slot = self.textures.get_mut(stage)?;
        Some(std::mem::replace(slot, texture))
    }

    pub fn texture(&self, stage: usize) -> TextureHandle {
        self.textures.get(stage).copied().unwrap_or_else(TextureHandle::invalid)
    }

    pub fn set_sampler_state(&mut self, stage: usize, state: SamplerState, value: u32) -> bool {
        match (self.sampler_states.get_mut(stage), sampler_slot(state)) {
            (Some(states), Some(slot)) => {
                states[slot] = value;
                true
            }
            _ => false,
        }
    }

    pub fn sampler_state(&self, stage: usize, state: SamplerState) -> Option<u32> {
        let states = self.sampler_states.get(stage)?;
        sampler_slot(state).map(|slot| states[slot])
    }

    pub fn set_stream_source(&mut self, stream: usize, source: StreamSource) -> bool {
        match self.streams.get_mut(stream) {
            Some(slot) => {
                *slot = source;
                true
            }
            None => false,
        }
    }

    pub fn stream_source(&self, stream: usize) -> Option<StreamSource> {
        self.streams.get(stream).copied()
    }

    pub fn streams(&self) -> &[StreamSource] {
        &self.streams
    }

    pub fn set_index_buffer(&mut self, buffer: IndexBufferHandle, base_index: u32) {
        self.index_buffer = buffer;
        self.base_index = base_index;
    }

    pub fn index_buffer(&self) -> (IndexBufferHandle, u32) {
        (self.index_buffer, self.base_index)
    }

    pub fn set_vertex_format(&mut self, format: VertexFormatHandle) {
        if self.vertex_format != format {
            self.vertex_format = format;
            self.pipeline_dirty = true;
        }
    }

    pub fn vertex_format(&self) -> VertexFormatHandle {
        self.vertex_format
    }

    pub fn set_shader(&mut self, shader: ShaderHandle) {
        if self.shader != shader {
            self.shader = shader;
            self.pipeline_dirty = true;
        }
    }

    pub fn shader(&self) -> ShaderHandle {
        self.shader
    }

    pub fn set_render_target(&mut self, index: usize, target: RenderTargetHandle) -> bool {
        match self.render_targets.get_mut(index) {
            Some(slot) => {
                *slot = target;
                true
            }
            None => false,
        }
    }

    pub fn render_target(&self, index: usize) -> RenderTargetHandle {
        self.render_targets
            .get(index)
            .copied()
            .unwrap_or_else(RenderTargetHandle::invalid)
    }

    pub fn set_depth_stencil(&mut self, depth: DepthStencilHandle) {
        self.depth_stencil = depth;
    }

    pub fn depth_stencil(&self) -> DepthStencilHandle {
        self.depth_stencil
    }

    /// 资源被销毁后清除所有指向它的绑定
    pub fn unbind_texture(&mut self, texture: TextureHandle) {
        for slot in self.textures.iter_mut().filter(|t| **t == texture) {
            *slot = TextureHandle::invalid();
        }
    }

    pub fn unbind_vertex_buffer(&mut self, buffer: VertexBufferHandle) {
        for stream in self.streams.iter_mut().filter(|s| s.buffer == buffer) {
            *stream = StreamSource::default();
        }
    }

    pub fn unbind_index_buffer(&mut self, buffer: IndexBufferHandle) {
        if self.index_buffer == buffer {
            self.index_buffer = IndexBufferHandle::invalid();
            self.base_index = 0;
        }
    }

    pub fn unbind_render_target(&mut self, target: RenderTargetHandle) {
        for slot in self.render_targets.iter_mut().filter(|t| **t == target) {
            *slot = RenderTargetHandle::invalid();
        }
    }

    pub fn unbind_depth_stencil(&mut self, depth: DepthStencilHandle) {
        if self.depth_stencil == depth {
            self.depth_stencil = DepthStencilHandle::invalid();
        }
    }

    // ---- 视口、变换、光照 ----

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_scissor(&mut self, rect: Rect) {
        self.scissor = rect;
    }

    pub fn scissor(&self) -> Rect {
        self.scissor
    }

    pub fn set_transform(&mut self, ty: TransformType, matrix: Matrix4) {
        match ty {
            TransformType::World => self.world = matrix,
            TransformType::View => self.view = matrix,
            TransformType::Projection => self.projection = matrix,
        }
    }

    pub fn transform(&self, ty: TransformType) -> Matrix4 {
        match ty {
            TransformType::World => self.world,
            TransformType::View => self.view,
            TransformType::Projection => self.projection,
        }
    }

    /// 列向量约定下的 projection * view * world
    pub fn world_view_projection(&self) -> Matrix4 {
        self.projection * self.view * self.world
    }

    pub fn set_material(&mut self, material: Material) {
        self.material = material;
    }

    pub fn material(&self) -> Material {
        self.material
    }

    pub fn set_light(&mut self, index: usize, light: Light) -> bool {
        match self.lights.get_mut(index) {
            Some(slot) => {
                *slot = Some(light);
                self.light_enabled[index] = true;
                true
            }
            None => false,
        }
    }

    pub fn light(&self, index: usize) -> Option<Light> {
        self.lights.get(index).copied().flatten()
    }

    pub fn disable_light(&mut self, index: usize) -> bool {
        match self.light_enabled.get_mut(index) {
            Some(enabled) => {
                *enabled = false;
                true
            }
            None => false,
        }
    }

    pub fn is_light_enabled(&self, index: usize) -> bool {
        self.light_enabled.get(index).copied().unwrap_or(false)
    }

    pub fn set_ambient(&mut self, color: Color) {
        self.set_render_state(RenderState::Ambient, color.to_argb() as u64);
    }

    pub fn ambient(&self) -> Color {
        Color::from_argb(self.render_state(RenderState::Ambient) as u32)
    }

    pub fn set_clear_color(&mut self, color: Color) {
        self.clear_color = color;
    }

    pub fn clear_color(&self) -> Color {
        self.clear_color
    }
}

impl Default for DriverStateCache {
    fn default() -> Self {
        Self::new()
    }
}

fn sampler_slot(state: SamplerState) -> Option<usize> {
    SamplerState::ALL.iter().position(|s| *s == state)
}
