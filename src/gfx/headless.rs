//! 无窗口设备
//!
//! 在内存中实现 `DeviceBackend`：缓冲区和图像就是字节数组，命令录制只记下绘制参数，
//! 提交和 Fence 等待都只做簿记。软件后端和所有驱动测试都运行在它上面。
//!
//! # 可观察性
//!
//! - 每次提交、Fence 等待、绘制和清屏都被记录，测试可以逐条检查
//! - 每个设备对象持有一个共享计数，`live_objects()` 返回尚未释放的对象数，延迟销毁因此可见
//! - GPU 对资源的占用按槽位追踪：录制中或在飞的槽位引用的资源被写入时返回 `WriteOutcome::Busy`
//!
//! # 故障注入
//!
//! `inject_device_lost`、`stall_fences`、`invalidate_swapchain` 模拟设备丢失、Fence 超时和交换链过期。

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, info, trace};

use super::device::{
    spirv_words, BufferKind, DeviceBackend, DrawCall, DrawParams, FixedFunctionConstants,
    ImageDesc, WriteOutcome,
};
use super::driver::{DriverCaps, WindowTarget};
use super::format::{self, FormatInfo};
use super::state::PipelineKey;
use super::sync::FRAMES_IN_FLIGHT;
use super::types::{stream_stride, BackendType, Color, Rect, TextureFormat, VertexElement};
use crate::core::error::{DriverError, DriverResult};

/// 内存缓冲区
#[derive(Debug)]
pub struct HeadlessBuffer {
    id: u64,
    kind: BufferKind,
    data: Rc<RefCell<Vec<u8>>>,
    _live: Rc<()>,
}

impl HeadlessBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }
}

/// 内存图像，每层 mip 一段字节
#[derive(Debug)]
pub struct HeadlessImage {
    id: u64,
    desc: ImageDesc,
    levels: RefCell<Vec<Vec<u8>>>,
    _live: Rc<()>,
}

impl HeadlessImage {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn level(&self, level: u32) -> Option<Vec<u8>> {
        self.levels.borrow().get(level as usize).cloned()
    }
}

#[derive(Debug)]
pub struct HeadlessShader {
    id: u64,
    word_count: usize,
    _live: Rc<()>,
}

impl HeadlessShader {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
pub struct HeadlessPipeline {
    id: u64,
    key: PipelineKey,
    stride: u32,
    shader: Option<u64>,
    _live: Rc<()>,
}

impl HeadlessPipeline {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PipelineKey {
        &self.key
    }
}

/// 一次录制的绘制
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub slot: usize,
    pub pipeline: u64,
    pub shader: Option<u64>,
    pub params: DrawParams,
    /// (流, 缓冲区 id, 偏移, 跨度)
    pub vertex_buffers: Vec<(u32, u64, u64, u32)>,
    pub index_buffer: Option<u64>,
    /// (采样器阶段, 图像 id)
    pub textures: Vec<(u32, u64)>,
    pub render_target: Option<u64>,
    pub scissor: Option<Rect>,
    pub constants: FixedFunctionConstants,
}

/// 一次提交
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitRecord {
    pub slot: usize,
    pub draw_count: usize,
    /// 提交时该槽位的帧序号（从 1 开始）
    pub frame: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearRecord {
    pub slot: usize,
    pub color: Option<Color>,
    pub depth: Option<f32>,
}

#[derive(Debug, Default)]
struct SlotState {
    recording: bool,
    in_flight: bool,
    draws: usize,
    /// 该槽位命令引用的资源 id
    referenced: HashSet<u64>,
}

/// 内存设备
pub struct HeadlessDevice {
    initialized: bool,
    extent: (u32, u32),
    vsync: bool,
    caps: DriverCaps,
    next_id: u64,
    live: Rc<()>,
    slots: Vec<SlotState>,
    frames_submitted: u64,
    buffers: HashMap<u64, Weak<RefCell<Vec<u8>>>>,

    draws: Vec<DrawRecord>,
    submissions: Vec<SubmitRecord>,
    fence_waits: Vec<usize>,
    clears: Vec<ClearRecord>,
    presents: u64,
    pipelines_created: u64,
    swapchain_rebuilds: u64,

    device_lost: bool,
    fences_stalled: bool,
    swapchain_out_of_date: bool,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_caps(DriverCaps::default())
    }

    pub fn with_caps(caps: DriverCaps) -> Self {
        Self {
            initialized: false,
            extent: (0, 0),
            vsync: true,
            caps,
            next_id: 1,
            live: Rc::new(()),
            slots: (0..FRAMES_IN_FLIGHT).map(|_| SlotState::default()).collect(),
            frames_submitted: 0,
            buffers: HashMap::new(),
            draws: Vec::new(),
            submissions: Vec::new(),
            fence_waits: Vec::new(),
            clears: Vec::new(),
            presents: 0,
            pipelines_created: 0,
            swapchain_rebuilds: 0,
            device_lost: false,
            fences_stalled: false,
            swapchain_out_of_date: false,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn slot_mut(&mut self, slot: usize) -> DriverResult<&mut SlotState> {
        self.slots
            .get_mut(slot)
            .ok_or_else(|| DriverError::argument(format!("Frame slot {slot} out of range")))
    }

    fn recording_slot(&mut self, slot: usize) -> DriverResult<&mut SlotState> {
        let state = self.slot_mut(slot)?;
        if !state.recording {
            return Err(DriverError::state("No command buffer is recording"));
        }
        Ok(state)
    }

    fn check_device(&self) -> DriverResult<()> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        if self.device_lost {
            return Err(DriverError::DeviceLost("Headless device lost".into()));
        }
        Ok(())
    }

    /// GPU 是否仍可能读取资源
    fn in_use(&self, id: u64) -> bool {
        self.slots
            .iter()
            .any(|s| (s.recording || s.in_flight) && s.referenced.contains(&id))
    }

    // ---- 故障注入 ----

    /// 之后的帧操作返回 `DeviceLost`，直到 `resize`
    pub fn inject_device_lost(&mut self) {
        self.device_lost = true;
    }

    /// Fence 永不完成，等待在飞槽位时返回 `Timeout`
    pub fn stall_fences(&mut self, stalled: bool) {
        self.fences_stalled = stalled;
    }

    /// 下一次获取图像返回 `SwapchainLost`
    pub fn invalidate_swapchain(&mut self) {
        self.swapchain_out_of_date = true;
    }

    // ---- 观察 ----

    /// 尚未释放的设备对象数
    pub fn live_objects(&self) -> usize {
        Rc::strong_count(&self.live) - 1
    }

    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn submissions(&self) -> &[SubmitRecord] {
        &self.submissions
    }

    /// 实际发生阻塞等待的槽位序列
    pub fn fence_waits(&self) -> &[usize] {
        &self.fence_waits
    }

    pub fn clears(&self) -> &[ClearRecord] {
        &self.clears
    }

    pub fn presents(&self) -> u64 {
        self.presents
    }

    pub fn pipelines_created(&self) -> u64 {
        self.pipelines_created
    }

    pub fn swapchain_rebuilds(&self) -> u64 {
        self.swapchain_rebuilds
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn is_slot_in_flight(&self, slot: usize) -> bool {
        self.slots.get(slot).map(|s| s.in_flight).unwrap_or(false)
    }

    /// 按 id 读取缓冲区当前内容，已释放时返回 `None`
    pub fn buffer_contents(&self, id: u64) -> Option<Vec<u8>> {
        self.buffers
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|data| data.borrow().clone())
    }

    /// 清空记录（不影响资源）
    pub fn clear_records(&mut self) {
        self.draws.clear();
        self.submissions.clear();
        self.fence_waits.clear();
        self.clears.clear();
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for HeadlessDevice {
    type Buffer = HeadlessBuffer;
    type Image = HeadlessImage;
    type Shader = HeadlessShader;
    type Pipeline = HeadlessPipeline;

    fn backend_type(&self) -> BackendType {
        BackendType::Software
    }

    fn name(&self) -> &'static str {
        "Software"
    }

    fn version(&self) -> String {
        format!("Headless device {}", env!("CARGO_PKG_VERSION"))
    }

    fn capabilities(&self) -> DriverCaps {
        self.caps
    }

    fn supports_format(&self, format: TextureFormat) -> bool {
        !matches!(
            format,
            TextureFormat::Unknown | TextureFormat::P8 | TextureFormat::Index16 | TextureFormat::Index32
        )
    }

    fn initialize(
        &mut self,
        _window: Option<WindowTarget>,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> DriverResult<()> {
        self.initialized = true;
        self.extent = (width, height);
        self.vsync = vsync;
        info!(width, height, vsync, "Headless device initialized");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.initialized = false;
        self.buffers.clear();
        for slot in &mut self.slots {
            *slot = SlotState::default();
        }
        debug!(live = self.live_objects(), "Headless device shut down");
    }

    fn resize(&mut self, width: u32, height: u32) -> DriverResult<()> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        self.extent = (width, height);
        self.device_lost = false;
        self.swapchain_out_of_date = false;
        self.swapchain_rebuilds += 1;
        Ok(())
    }

    fn create_buffer(&mut self, kind: BufferKind, size: usize) -> DriverResult<Self::Buffer> {
        self.check_device()?;
        if size == 0 {
            return Err(DriverError::argument("Buffer size must be non-zero"));
        }
        let id = self.allocate_id();
        let data = Rc::new(RefCell::new(vec![0u8; size]));
        self.buffers.insert(id, Rc::downgrade(&data));
        trace!(id, size, ?kind, "Buffer created");
        Ok(HeadlessBuffer {
            id,
            kind,
            data,
            _live: Rc::clone(&self.live),
        })
    }

    fn write_buffer(
        &mut self,
        buffer: &Self::Buffer,
        offset: usize,
        data: &[u8],
    ) -> DriverResult<WriteOutcome> {
        if self.in_use(buffer.id) {
            return Ok(WriteOutcome::Busy);
        }
        let mut contents = buffer.data.borrow_mut();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= contents.len())
            .ok_or_else(|| DriverError::argument("Buffer write out of range"))?;
        contents[offset..end].copy_from_slice(data);
        Ok(WriteOutcome::Written)
    }

    fn create_image(&mut self, desc: &ImageDesc) -> DriverResult<Self::Image> {
        self.check_device()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(DriverError::argument("Image extent must be non-zero"));
        }
        let levels = (0..desc.mip_levels.max(1))
            .map(|level| {
                let (w, h) = format::mip_extent(desc.width, desc.height, level);
                vec![0u8; format::level_size(desc.format, w, h)]
            })
            .collect();
        let id = self.allocate_id();
        Ok(HeadlessImage {
            id,
            desc: *desc,
            levels: RefCell::new(levels),
            _live: Rc::clone(&self.live),
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
        if self.in_use(image.id) {
            return Ok(WriteOutcome::Busy);
        }
        let fmt = image.desc.format;
        let (level_width, _) = format::mip_extent(image.desc.width, image.desc.height, level);
        let mut levels = image.levels.borrow_mut();
        let target = levels
            .get_mut(level as usize)
            .ok_or_else(|| DriverError::argument(format!("Mip level {level} out of range")))?;

        // 压缩格式按 4x4 块寻址
        let (unit, unit_bytes) = if fmt.is_compressed() {
            (4, fmt.block_bytes() as usize)
        } else {
            (1, fmt.bytes_per_pixel() as usize)
        };
        let x0 = region.left.max(0) as usize / unit;
        let y0 = region.top.max(0) as usize / unit;
        let columns = (region.width() as usize).div_ceil(unit);
        let rows = (region.height() as usize).div_ceil(unit);
        let dst_pitch = format::row_pitch(fmt, level_width) as usize;
        let span = columns * unit_bytes;

        for row in 0..rows {
            let src = row * row_pitch as usize;
            let dst = (y0 + row) * dst_pitch + x0 * unit_bytes;
            let (Some(src_row), true) = (data.get(src..src + span), dst + span <= target.len())
            else {
                return Err(DriverError::argument("Image write out of range"));
            };
            target[dst..dst + span].copy_from_slice(src_row);
        }
        Ok(WriteOutcome::Written)
    }

    fn create_shader(&mut self, vertex: &[u8], fragment: &[u8]) -> DriverResult<Self::Shader> {
        self.check_device()?;
        let word_count = spirv_words(vertex)?.len() + spirv_words(fragment)?.len();
        let id = self.allocate_id();
        debug!(id, word_count, "Shader program created");
        Ok(HeadlessShader {
            id,
            word_count,
            _live: Rc::clone(&self.live),
        })
    }

    fn create_pipeline(
        &mut self,
        key: &PipelineKey,
        elements: &[VertexElement],
        shader: Option<&Self::Shader>,
    ) -> DriverResult<Self::Pipeline> {
        self.check_device()?;
        let id = self.allocate_id();
        self.pipelines_created += 1;
        trace!(id, topology = ?key.topology, words = shader.map(|s| s.word_count), "Pipeline created");
        Ok(HeadlessPipeline {
            id,
            key: *key,
            stride: stream_stride(elements, 0),
            shader: shader.map(|s| s.id),
            _live: Rc::clone(&self.live),
        })
    }

    fn wait_for_slot(&mut self, slot: usize, timeout: Duration) -> DriverResult<()> {
        let stalled = self.fences_stalled;
        let state = self.slot_mut(slot)?;
        if !state.in_flight {
            return Ok(());
        }
        if stalled {
            return Err(DriverError::Timeout(timeout.as_millis() as u64));
        }
        state.in_flight = false;
        state.referenced.clear();
        self.fence_waits.push(slot);
        Ok(())
    }

    fn begin_frame(&mut self, slot: usize, clear_color: Color, _timeout: Duration) -> DriverResult<()> {
        self.check_device()?;
        if self.swapchain_out_of_date {
            return Err(DriverError::SwapchainLost);
        }
        let state = self.slot_mut(slot)?;
        if state.in_flight {
            return Err(DriverError::state(format!(
                "Frame slot {slot} reused before its fence signaled"
            )));
        }
        if state.recording {
            return Err(DriverError::state(format!("Frame slot {slot} is already recording")));
        }
        state.recording = true;
        state.draws = 0;
        state.referenced.clear();
        self.clears.push(ClearRecord {
            slot,
            color: Some(clear_color),
            depth: Some(1.0),
        });
        Ok(())
    }

    fn clear(&mut self, slot: usize, color: Option<Color>, depth: Option<f32>) -> DriverResult<()> {
        self.recording_slot(slot)?;
        self.clears.push(ClearRecord { slot, color, depth });
        Ok(())
    }

    fn draw(&mut self, slot: usize, call: &DrawCall<'_, Self>) -> DriverResult<()> {
        self.check_device()?;
        if call.params.element_count == 0 || call.params.instance_count == 0 {
            return Err(DriverError::argument("Empty draw"));
        }
        if let Some(binding) = call.vertex_buffers.iter().find(|b| b.stream == 0) {
            if binding.stride != call.pipeline.stride && call.pipeline.stride != 0 {
                trace!(
                    bound = binding.stride,
                    declared = call.pipeline.stride,
                    "Stream 0 stride differs from vertex format"
                );
            }
        }

        let record = DrawRecord {
            slot,
            pipeline: call.pipeline.id,
            shader: call.pipeline.shader,
            params: call.params,
            vertex_buffers: call
                .vertex_buffers
                .iter()
                .map(|b| (b.stream, b.buffer.id, b.offset, b.stride))
                .collect(),
            index_buffer: call.index_buffer.as_ref().map(|b| b.buffer.id),
            textures: call.textures.iter().map(|(stage, image)| (*stage, image.id)).collect(),
            render_target: call.render_target.map(|image| image.id),
            scissor: call.scissor,
            constants: call.constants,
        };

        let state = self.recording_slot(slot)?;
        state.draws += 1;
        state.referenced.extend(record.vertex_buffers.iter().map(|b| b.1));
        state.referenced.extend(record.index_buffer);
        state.referenced.extend(record.textures.iter().map(|t| t.1));
        state.referenced.extend(record.render_target);
        self.draws.push(record);
        Ok(())
    }

    fn end_frame(&mut self, slot: usize) -> DriverResult<()> {
        self.check_device()?;
        let state = self.recording_slot(slot)?;
        state.recording = false;
        state.in_flight = true;
        let draw_count = state.draws;
        self.frames_submitted += 1;
        self.submissions.push(SubmitRecord {
            slot,
            draw_count,
            frame: self.frames_submitted,
        });
        Ok(())
    }

    fn present(&mut self, slot: usize) -> DriverResult<()> {
        self.check_device()?;
        self.slot_mut(slot)?;
        self.presents += 1;
        Ok(())
    }

    fn abandon_frame(&mut self, slot: usize) {
        if let Some(state) = self.slots.get_mut(slot) {
            state.recording = false;
            state.draws = 0;
            state.referenced.clear();
        }
    }

    fn wait_idle(&mut self) -> DriverResult<()> {
        for slot in 0..self.slots.len() {
            self.wait_for_slot(slot, Duration::from_secs(1))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::device::ImageUsage;

    fn device() -> HeadlessDevice {
        let mut device = HeadlessDevice::new();
        device.initialize(None, 64, 64, false).unwrap();
        device
    }

    #[test]
    fn test_live_object_tracking() {
        let mut device = device();
        let buffer = device.create_buffer(BufferKind::Vertex, 16).unwrap();
        assert_eq!(device.live_objects(), 1);
        let id = buffer.id();
        assert!(device.buffer_contents(id).is_some());
        drop(buffer);
        assert_eq!(device.live_objects(), 0);
        assert!(device.buffer_contents(id).is_none());
    }

    #[test]
    fn test_write_buffer_bounds() {
        let mut device = device();
        let buffer = device.create_buffer(BufferKind::Index, 4).unwrap();
        assert_eq!(device.write_buffer(&buffer, 2, &[9, 9]).unwrap(), WriteOutcome::Written);
        assert_eq!(buffer.contents(), vec![0, 0, 9, 9]);
        assert!(device.write_buffer(&buffer, 3, &[1, 1]).is_err());
    }

    #[test]
    fn test_slot_reuse_requires_fence_wait() {
        let mut device = device();
        let timeout = Duration::from_millis(10);
        device.begin_frame(0, Color::BLACK, timeout).unwrap();
        device.end_frame(0).unwrap();
        assert!(device.is_slot_in_flight(0));
        assert!(device.begin_frame(0, Color::BLACK, timeout).is_err());

        device.wait_for_slot(0, timeout).unwrap();
        assert_eq!(device.fence_waits(), &[0]);
        device.begin_frame(0, Color::BLACK, timeout).unwrap();
    }

    #[test]
    fn test_stalled_fence_times_out() {
        let mut device = device();
        let timeout = Duration::from_millis(25);
        device.begin_frame(1, Color::BLACK, timeout).unwrap();
        device.end_frame(1).unwrap();
        device.stall_fences(true);
        assert_eq!(device.wait_for_slot(1, timeout), Err(DriverError::Timeout(25)));
        device.stall_fences(false);
        assert!(device.wait_for_slot(1, timeout).is_ok());
    }

    #[test]
    fn test_device_lost_until_resize() {
        let mut device = device();
        device.inject_device_lost();
        let err = device.begin_frame(0, Color::BLACK, Duration::ZERO).unwrap_err();
        assert!(err.requires_reset());
        device.resize(32, 32).unwrap();
        assert!(device.begin_frame(0, Color::BLACK, Duration::ZERO).is_ok());
        assert_eq!(device.extent(), (32, 32));
    }

    #[test]
    fn test_write_image_dxt1_region() {
        let mut device = device();
        let image = device
            .create_image(&ImageDesc {
                width: 8,
                height: 8,
                format: TextureFormat::Dxt1,
                mip_levels: 1,
                usage: ImageUsage::Sampled,
            })
            .unwrap();
        // 第二行第二个块
        let block = [7u8; 8];
        device
            .write_image(&image, 0, Rect::new(4, 4, 8, 8), &block, 8)
            .unwrap();
        let level = image.level(0).unwrap();
        assert_eq!(level.len(), 32);
        assert_eq!(&level[24..32], &block);
        assert!(level[..24].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_invalid_shader_rejected() {
        let mut device = device();
        assert!(device.create_shader(&[1, 2, 3], &[]).is_err());
    }
}
