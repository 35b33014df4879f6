//! 资源创建、锁定与销毁
//!
//! 缓冲区和纹理都保留一份 CPU 影子副本：锁定直接返回影子副本上的窗口，
//! 解锁时把窗口上传到设备对象。GPU 仍在读取设备对象时换一个新对象写入完整副本，
//! 旧对象交给帧环延迟释放。

use std::ops::Range;

use tracing::{debug, trace, warn};

use super::{ExplicitDriver, Retired};
use crate::core::error::{DriverError, DriverResult};
use crate::gfx::device::{BufferKind, DeviceBackend, ImageDesc, ImageUsage, WriteOutcome};
use crate::gfx::format::{self, FormatInfo};
use crate::gfx::handle::{
    DepthStencilHandle, Handle, IndexBufferHandle, RenderTargetHandle, TextureHandle,
    VertexBufferHandle, VertexFormatHandle,
};
use crate::gfx::state::{PipelineKey, StreamSource, MAX_STREAMS};
use crate::gfx::sync::FrameRing;
use crate::gfx::types::{IndexFormat, Rect, TextureDescriptor, TextureFormat, VertexElement};

/// 顶点/索引缓冲区
pub(crate) struct BufferEntry<B> {
    pub buffer: B,
    pub shadow: Vec<u8>,
    pub kind: BufferKind,
    pub dynamic: bool,
    /// 索引缓冲区的索引格式
    pub format: Option<IndexFormat>,
    locked: Option<Range<usize>>,
    /// 因 GPU 占用而换新的次数
    pub renames: u32,
}

impl<B> BufferEntry<B> {
    fn new(buffer: B, kind: BufferKind, size: usize, dynamic: bool) -> Self {
        Self {
            buffer,
            shadow: vec![0u8; size],
            kind,
            dynamic,
            format: None,
            locked: None,
            renames: 0,
        }
    }

    /// 锁定一个区间，`size` 为 0 表示到末尾；重复锁定返回之前的区间
    pub fn lock(&mut self, what: &str, offset: usize, size: usize) -> DriverResult<Range<usize>> {
        if let Some(range) = &self.locked {
            warn!(
                offset = range.start,
                size = range.len(),
                "{what} is already locked, returning the previous window"
            );
            return Ok(range.clone());
        }

        let len = self.shadow.len();
        let size = if size == 0 { len.saturating_sub(offset) } else { size };
        let end = offset
            .checked_add(size)
            .filter(|end| size > 0 && *end <= len)
            .ok_or_else(|| {
                DriverError::argument(format!(
                    "{what} lock range {offset}+{size} exceeds buffer size {len}"
                ))
            })?;
        self.locked = Some(offset..end);
        Ok(offset..end)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }

    pub fn locked_window(&mut self) -> Option<&mut [u8]> {
        let range = self.locked.clone()?;
        Some(&mut self.shadow[range])
    }

    fn unlock(&mut self, what: &str) -> DriverResult<Range<usize>> {
        self.locked
            .take()
            .ok_or_else(|| DriverError::state(format!("{what} is not locked")))
    }
}

/// 纹理
pub(crate) struct TextureEntry<I> {
    pub image: I,
    /// mip 层数已经解析为实际值
    pub desc: TextureDescriptor,
    pub levels: Vec<Vec<u8>>,
    locked: Vec<bool>,
}

impl<I> TextureEntry<I> {
    fn image_desc(&self) -> ImageDesc {
        image_desc(&self.desc)
    }

    fn level_extent(&self, level: u32) -> (u32, u32) {
        format::mip_extent(self.desc.width, self.desc.height, level)
    }

    /// 锁定一层 mip，返回行距
    pub fn lock(&mut self, level: u32) -> DriverResult<u32> {
        let slot = self
            .locked
            .get_mut(level as usize)
            .ok_or_else(|| DriverError::argument(format!("Mip level {level} out of range")))?;
        if *slot {
            warn!(level, "Texture level is already locked, returning the previous window");
        }
        *slot = true;
        let (width, _) = format::mip_extent(self.desc.width, self.desc.height, level);
        Ok(format::row_pitch(self.desc.format, width))
    }

    fn unlock(&mut self, level: u32) -> DriverResult<()> {
        match self.locked.get_mut(level as usize) {
            Some(slot) if *slot => {
                *slot = false;
                Ok(())
            }
            Some(_) => Err(DriverError::state(format!("Texture level {level} is not locked"))),
            None => Err(DriverError::argument(format!("Mip level {level} out of range"))),
        }
    }
}

/// 渲染目标或深度模板缓冲区
pub(crate) struct SurfaceEntry<I> {
    pub image: I,
    pub desc: ImageDesc,
}

fn image_desc(desc: &TextureDescriptor) -> ImageDesc {
    let usage = if desc.depth_stencil {
        ImageUsage::DepthStencil
    } else if desc.render_target {
        ImageUsage::RenderTarget
    } else {
        ImageUsage::Sampled
    };
    ImageDesc {
        width: desc.width,
        height: desc.height,
        format: desc.format,
        mip_levels: desc.mip_levels,
        usage,
    }
}

/// 把影子副本的一个区间上传到设备缓冲区，GPU 占用时换新
fn upload_buffer<D: DeviceBackend>(
    device: &mut D,
    ring: &mut FrameRing<Retired<D>>,
    entry: &mut BufferEntry<D::Buffer>,
    range: Range<usize>,
) -> DriverResult<()> {
    let outcome = device.write_buffer(&entry.buffer, range.start, &entry.shadow[range])?;
    if outcome == WriteOutcome::Written {
        return Ok(());
    }

    let fresh = device.create_buffer(entry.kind, entry.shadow.len())?;
    if device.write_buffer(&fresh, 0, &entry.shadow)? == WriteOutcome::Busy {
        return Err(DriverError::Backend("Newly created buffer reported busy".into()));
    }
    let old = std::mem::replace(&mut entry.buffer, fresh);
    drop(ring.retire(Retired::Buffer(old)));
    entry.renames += 1;
    trace!(
        kind = ?entry.kind,
        dynamic = entry.dynamic,
        renames = entry.renames,
        "Buffer in use by GPU, renamed"
    );
    Ok(())
}

fn write_level<D: DeviceBackend>(
    device: &mut D,
    image: &D::Image,
    desc: &TextureDescriptor,
    level: u32,
    data: &[u8],
) -> DriverResult<WriteOutcome> {
    let (width, height) = format::mip_extent(desc.width, desc.height, level);
    let region = Rect::new(0, 0, width as i32, height as i32);
    device.write_image(image, level, region, data, format::row_pitch(desc.format, width))
}

/// 创建新图像并写入全部 mip 层，替换 GPU 仍在读取的旧图像
fn rename_texture<D: DeviceBackend>(
    device: &mut D,
    ring: &mut FrameRing<Retired<D>>,
    entry: &mut TextureEntry<D::Image>,
) -> DriverResult<()> {
    let fresh = device.create_image(&entry.image_desc())?;
    for (level, data) in entry.levels.iter().enumerate() {
        if write_level(device, &fresh, &entry.desc, level as u32, data)? == WriteOutcome::Busy {
            return Err(DriverError::Backend("Newly created image reported busy".into()));
        }
    }
    let old = std::mem::replace(&mut entry.image, fresh);
    drop(ring.retire(Retired::Image(old)));
    trace!(width = entry.desc.width, height = entry.desc.height, "Texture in use by GPU, renamed");
    Ok(())
}

impl<D: DeviceBackend> ExplicitDriver<D> {
    fn create_buffer_entry(
        &mut self,
        kind: BufferKind,
        size: usize,
        dynamic: bool,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<BufferEntry<D::Buffer>> {
        self.ensure_initialized()?;
        if size == 0 {
            return Err(DriverError::argument("Buffer size must be non-zero"));
        }
        let initial = initial_data.unwrap_or(&[]);
        if initial.len() > size {
            return Err(DriverError::argument(format!(
                "Initial data ({} bytes) exceeds buffer size {size}",
                initial.len()
            )));
        }

        let buffer = self.device.create_buffer(kind, size)?;
        let mut entry = BufferEntry::new(buffer, kind, size, dynamic);
        entry.shadow[..initial.len()].copy_from_slice(initial);
        // 新缓冲区内容未定义，整块写入
        upload_buffer(&mut self.device, &mut self.ring, &mut entry, 0..size)?;
        Ok(entry)
    }

    pub(super) fn create_vertex_buffer_impl(
        &mut self,
        size: usize,
        dynamic: bool,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<VertexBufferHandle> {
        let entry = self.create_buffer_entry(BufferKind::Vertex, size, dynamic, initial_data)?;
        let handle = self.vertex_buffers.insert(entry);
        debug!(handle = handle.to_raw(), size, dynamic, "Vertex buffer created");
        Ok(handle)
    }

    pub(super) fn create_index_buffer_impl(
        &mut self,
        size: usize,
        format: IndexFormat,
        dynamic: bool,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<IndexBufferHandle> {
        let mut entry = self.create_buffer_entry(BufferKind::Index, size, dynamic, initial_data)?;
        entry.format = Some(format);
        let handle = self.index_buffers.insert(entry);
        debug!(handle = handle.to_raw(), size, ?format, dynamic, "Index buffer created");
        Ok(handle)
    }

    pub(super) fn destroy_vertex_buffer_impl(&mut self, buffer: VertexBufferHandle) -> DriverResult<()> {
        let entry = self.vertex_buffers.remove(buffer)?;
        if entry.is_locked() {
            warn!(handle = buffer.to_raw(), "Vertex buffer destroyed while locked");
        }
        self.state.unbind_vertex_buffer(buffer);
        self.retire(Retired::Buffer(entry.buffer));
        Ok(())
    }

    pub(super) fn destroy_index_buffer_impl(&mut self, buffer: IndexBufferHandle) -> DriverResult<()> {
        let entry = self.index_buffers.remove(buffer)?;
        if entry.is_locked() {
            warn!(handle = buffer.to_raw(), "Index buffer destroyed while locked");
        }
        self.state.unbind_index_buffer(buffer);
        self.retire(Retired::Buffer(entry.buffer));
        Ok(())
    }

    pub(super) fn unlock_vertex_buffer_impl(&mut self, buffer: VertexBufferHandle) -> DriverResult<()> {
        let entry = self.vertex_buffers.get_mut(buffer)?;
        let range = entry.unlock("Vertex buffer")?;
        upload_buffer(&mut self.device, &mut self.ring, entry, range)
    }

    pub(super) fn unlock_index_buffer_impl(&mut self, buffer: IndexBufferHandle) -> DriverResult<()> {
        let entry = self.index_buffers.get_mut(buffer)?;
        let range = entry.unlock("Index buffer")?;
        upload_buffer(&mut self.device, &mut self.ring, entry, range)
    }

    pub(super) fn set_stream_source_impl(
        &mut self,
        stream: u32,
        buffer: VertexBufferHandle,
        offset: u32,
        stride: u32,
    ) -> DriverResult<()> {
        if stream as usize >= MAX_STREAMS {
            return Err(DriverError::CapacityExceeded {
                what: "vertex stream",
                limit: MAX_STREAMS,
            });
        }
        if buffer.is_valid() {
            let size = self.vertex_buffers.get(buffer)?.shadow.len();
            if offset as usize >= size {
                return Err(DriverError::argument(format!(
                    "Stream offset {offset} exceeds buffer size {size}"
                )));
            }
        }
        let source = if buffer.is_valid() {
            StreamSource { buffer, offset, stride }
        } else {
            StreamSource::default()
        };
        self.state.set_stream_source(stream as usize, source);
        Ok(())
    }

    pub(super) fn create_vertex_format_impl(
        &mut self,
        elements: &[VertexElement],
    ) -> DriverResult<VertexFormatHandle> {
        if elements.is_empty() {
            return Err(DriverError::argument("Vertex format has no elements"));
        }
        if let Some(element) = elements.iter().find(|e| e.stream as usize >= MAX_STREAMS) {
            return Err(DriverError::argument(format!(
                "Vertex element stream {} out of range",
                element.stream
            )));
        }
        let handle = self.vertex_formats.insert(elements.to_vec());
        trace!(handle = handle.to_raw(), elements = elements.len(), "Vertex format created");
        Ok(handle)
    }

    pub(super) fn destroy_vertex_format_impl(&mut self, format: VertexFormatHandle) -> DriverResult<()> {
        self.vertex_formats.remove(format)?;
        if self.state.vertex_format() == format {
            self.state.set_vertex_format(VertexFormatHandle::invalid());
        }
        self.evict_pipelines(|key| key.vertex_format == format);
        Ok(())
    }

    /// 丢弃满足条件的缓存管线
    pub(super) fn evict_pipelines(&mut self, predicate: impl Fn(&PipelineKey) -> bool) {
        let keys: Vec<PipelineKey> = self.pipelines.keys().filter(|k| predicate(k)).copied().collect();
        for key in keys {
            if let Some(pipeline) = self.pipelines.remove(&key) {
                self.retire(Retired::Pipeline(pipeline));
            }
        }
        self.state.invalidate_pipeline();
    }

    fn validate_extent(&self, width: u32, height: u32) -> DriverResult<()> {
        let caps = self.device.capabilities();
        if width == 0 || height == 0 {
            return Err(DriverError::argument("Texture extent must be non-zero"));
        }
        if width > caps.max_texture_width || height > caps.max_texture_height {
            return Err(DriverError::argument(format!(
                "Texture {width}x{height} exceeds the maximum {}x{}",
                caps.max_texture_width, caps.max_texture_height
            )));
        }
        Ok(())
    }

    fn check_format(&self, format: TextureFormat) -> DriverResult<()> {
        if self.device.supports_format(format) {
            Ok(())
        } else {
            Err(DriverError::Unsupported(format!("Texture format {format:?}")))
        }
    }

    pub(super) fn create_texture_impl(
        &mut self,
        desc: &TextureDescriptor,
        initial_data: Option<&[u8]>,
    ) -> DriverResult<TextureHandle> {
        self.ensure_initialized()?;
        self.validate_extent(desc.width, desc.height)?;
        self.check_format(desc.format)?;

        let mut desc = *desc;
        desc.mip_levels = format::resolve_mip_count(desc.width, desc.height, desc.mip_levels);
        let mut levels: Vec<Vec<u8>> = (0..desc.mip_levels)
            .map(|level| {
                let (w, h) = format::mip_extent(desc.width, desc.height, level);
                vec![0u8; format::level_size(desc.format, w, h)]
            })
            .collect();

        // 初始数据按 mip 链顺序紧密排列，可以只覆盖前几层
        if let Some(mut data) = initial_data {
            let total = format::chain_size(desc.format, desc.width, desc.height, desc.mip_levels);
            if data.len() > total {
                return Err(DriverError::argument(format!(
                    "Initial data ({} bytes) exceeds texture size {total}",
                    data.len()
                )));
            }
            for level in levels.iter_mut() {
                let count = level.len().min(data.len());
                level[..count].copy_from_slice(&data[..count]);
                data = &data[count..];
            }
        }

        let image = self.device.create_image(&image_desc(&desc))?;
        if !desc.depth_stencil && !desc.render_target {
            for (level, data) in levels.iter().enumerate() {
                write_level(&mut self.device, &image, &desc, level as u32, data)?;
            }
        }

        let locked = vec![false; levels.len()];
        let handle = self.textures.insert(TextureEntry { image, desc, levels, locked });
        debug!(
            handle = handle.to_raw(),
            width = desc.width,
            height = desc.height,
            format = ?desc.format,
            mips = desc.mip_levels,
            "Texture created"
        );
        Ok(handle)
    }

    pub(super) fn destroy_texture_impl(&mut self, texture: TextureHandle) -> DriverResult<()> {
        let entry = self.textures.remove(texture)?;
        self.state.unbind_texture(texture);
        self.retire(Retired::Image(entry.image));
        Ok(())
    }

    pub(super) fn unlock_texture_impl(&mut self, texture: TextureHandle, level: u32) -> DriverResult<()> {
        let entry = self.textures.get_mut(texture)?;
        entry.unlock(level)?;
        if entry.desc.render_target || entry.desc.depth_stencil {
            return Ok(());
        }
        let data = &entry.levels[level as usize];
        let outcome = write_level(&mut self.device, &entry.image, &entry.desc, level, data)?;
        if outcome == WriteOutcome::Busy {
            rename_texture(&mut self.device, &mut self.ring, entry)?;
        }
        Ok(())
    }

    pub(super) fn update_texture_impl(
        &mut self,
        texture: TextureHandle,
        region: Rect,
        data: &[u8],
    ) -> DriverResult<()> {
        let entry = self.textures.get_mut(texture)?;
        let (width, height) = entry.level_extent(0);
        let fmt = entry.desc.format;
        if region.is_empty()
            || region.left < 0
            || region.top < 0
            || region.right as u32 > width
            || region.bottom as u32 > height
        {
            return Err(DriverError::argument("Texture update region out of bounds"));
        }

        let (unit, unit_bytes) = if fmt.is_compressed() {
            (4usize, fmt.block_bytes() as usize)
        } else {
            (1usize, fmt.bytes_per_pixel() as usize)
        };
        if fmt.is_compressed() && (region.left % 4 != 0 || region.top % 4 != 0) {
            return Err(DriverError::argument("Compressed texture region must be block aligned"));
        }

        let src_pitch = format::row_pitch(fmt, region.width()) as usize;
        let rows = format::row_count(fmt, region.height()) as usize;
        if data.len() < src_pitch * rows {
            return Err(DriverError::argument(format!(
                "Texture update needs {} bytes, got {}",
                src_pitch * rows,
                data.len()
            )));
        }

        let dst_pitch = format::row_pitch(fmt, width) as usize;
        let x0 = region.left as usize / unit * unit_bytes;
        let y0 = region.top as usize / unit;
        let level = &mut entry.levels[0];
        for row in 0..rows {
            let dst = (y0 + row) * dst_pitch + x0;
            let span = src_pitch.min(level.len().saturating_sub(dst));
            level[dst..dst + span].copy_from_slice(&data[row * src_pitch..row * src_pitch + span]);
        }

        let outcome =
            self.device
                .write_image(&entry.image, 0, region, &data[..src_pitch * rows], src_pitch as u32)?;
        if outcome == WriteOutcome::Busy {
            rename_texture(&mut self.device, &mut self.ring, entry)?;
        }
        Ok(())
    }

    pub(super) fn create_render_target_impl(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<RenderTargetHandle> {
        self.ensure_initialized()?;
        self.validate_extent(width, height)?;
        self.check_format(format)?;
        if format.is_depth() || format.is_compressed() {
            return Err(DriverError::argument(format!(
                "{format:?} cannot be used as a render target"
            )));
        }
        let desc = ImageDesc {
            width,
            height,
            format,
            mip_levels: 1,
            usage: ImageUsage::RenderTarget,
        };
        let image = self.device.create_image(&desc)?;
        let handle = self.render_targets.insert(SurfaceEntry { image, desc });
        debug!(handle = handle.to_raw(), width, height, ?format, "Render target created");
        Ok(handle)
    }

    pub(super) fn create_depth_stencil_impl(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> DriverResult<DepthStencilHandle> {
        self.ensure_initialized()?;
        self.validate_extent(width, height)?;
        if !format.is_depth() {
            return Err(DriverError::argument(format!("{format:?} is not a depth format")));
        }
        self.check_format(format)?;
        let desc = ImageDesc {
            width,
            height,
            format,
            mip_levels: 1,
            usage: ImageUsage::DepthStencil,
        };
        let image = self.device.create_image(&desc)?;
        let handle = self.depth_stencils.insert(SurfaceEntry { image, desc });
        debug!(handle = handle.to_raw(), width, height, ?format, "Depth stencil created");
        Ok(handle)
    }
}
