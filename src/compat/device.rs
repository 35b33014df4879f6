//! 旧式设备桩
//!
//! `LegacyDevice` 模拟 D3D8 设备的方法表：每个方法返回 HRESULT 风格的结果码，
//! 把调用转发给当前驱动。D3D8 的数值（渲染状态编号、图元类型、变换类型）在这里
//! 换算成驱动的类型；混合、比较、模板、剔除、填充的取值与驱动一致，按原值传递。
//!
//! # 设计原则
//!
//! - 驱动错误统一换算为结果码（`hresult`），不会 panic
//! - 绑定的顶点/索引缓冲区持有一个引用，解绑前不会被销毁
//! - 设备丢失后所有绘制照常失败，直到 `reset` 成功

use std::cell::RefMut;
use std::collections::HashMap;

use slotmap::SecondaryMap;
use tracing::{debug, trace, warn};

use super::buffer::{BufferUsage, IndexBufferClass, VertexBufferClass};
use super::fvf;
use super::texture::{LockedRect, MemoryTexture, Pool};
use crate::core::error::{DriverError, DriverResult};
use crate::gfx::driver::{DriverCaps, GraphicsDriver};
use crate::gfx::factory::SharedDriver;
use crate::gfx::handle::{
    Handle, IndexBufferHandle, TextureHandle, VertexBufferHandle, VertexFormatHandle,
};
use crate::gfx::state::MAX_STREAMS;
use crate::gfx::types::{
    Color, IndexFormat, Matrix4, PrimitiveType, Rect, RenderState, TextureFormat, TransformType,
};

/// HRESULT 风格的结果码
pub type HResult = i32;

pub const D3D_OK: HResult = 0;
pub const E_FAIL: HResult = 0x8000_4005_u32 as i32;
pub const D3DERR_OUTOFVIDEOMEMORY: HResult = 0x8876_017C_u32 as i32;
pub const D3DERR_NOTAVAILABLE: HResult = 0x8876_0866_u32 as i32;
pub const D3DERR_DEVICELOST: HResult = 0x8876_0868_u32 as i32;
pub const D3DERR_DEVICENOTRESET: HResult = 0x8876_0869_u32 as i32;
pub const D3DERR_INVALIDCALL: HResult = 0x8876_086C_u32 as i32;

pub const D3DCLEAR_TARGET: u32 = 0x1;
pub const D3DCLEAR_ZBUFFER: u32 = 0x2;
pub const D3DCLEAR_STENCIL: u32 = 0x4;

pub const D3DTS_VIEW: u32 = 2;
pub const D3DTS_PROJECTION: u32 = 3;
pub const D3DTS_WORLD: u32 = 256;

pub fn succeeded(hr: HResult) -> bool {
    hr >= 0
}

pub fn failed(hr: HResult) -> bool {
    hr < 0
}

/// 驱动错误对应的结果码
pub fn hresult(err: &DriverError) -> HResult {
    match err {
        DriverError::InvalidHandle { .. }
        | DriverError::InvalidState(_)
        | DriverError::InvalidArgument(_)
        | DriverError::CapacityExceeded { .. } => D3DERR_INVALIDCALL,
        DriverError::NotInitialized | DriverError::Unsupported(_) => D3DERR_NOTAVAILABLE,
        DriverError::OutOfMemory => D3DERR_OUTOFVIDEOMEMORY,
        DriverError::DeviceLost(_) | DriverError::SwapchainLost => D3DERR_DEVICELOST,
        DriverError::Initialization(_) | DriverError::Timeout(_) | DriverError::Backend(_) => E_FAIL,
    }
}

/// D3D 图元类型 1..=6
pub fn primitive_type(d3d: u32) -> Option<PrimitiveType> {
    match d3d {
        1 => Some(PrimitiveType::PointList),
        2 => Some(PrimitiveType::LineList),
        3 => Some(PrimitiveType::LineStrip),
        4 => Some(PrimitiveType::TriangleList),
        5 => Some(PrimitiveType::TriangleStrip),
        6 => Some(PrimitiveType::TriangleFan),
        _ => None,
    }
}

pub fn transform_type(d3d: u32) -> Option<TransformType> {
    match d3d {
        D3DTS_WORLD => Some(TransformType::World),
        D3DTS_VIEW => Some(TransformType::View),
        D3DTS_PROJECTION => Some(TransformType::Projection),
        _ => None,
    }
}

/// D3D8 渲染状态编号对应的驱动渲染状态
pub fn render_state(d3d: u32) -> Option<RenderState> {
    let state = match d3d {
        7 => RenderState::ZEnable,
        8 => RenderState::FillMode,
        14 => RenderState::ZWriteEnable,
        15 => RenderState::AlphaTestEnable,
        19 => RenderState::SrcBlend,
        20 => RenderState::DstBlend,
        22 => RenderState::CullMode,
        23 => RenderState::ZFunc,
        24 => RenderState::AlphaRef,
        25 => RenderState::AlphaFunc,
        26 => RenderState::DitherEnable,
        27 => RenderState::AlphaBlendEnable,
        28 => RenderState::FogEnable,
        29 => RenderState::SpecularEnable,
        34 => RenderState::FogColor,
        36 => RenderState::FogStart,
        37 => RenderState::FogEnd,
        38 => RenderState::FogDensity,
        52 => RenderState::StencilEnable,
        53 => RenderState::StencilFail,
        54 => RenderState::StencilZFail,
        55 => RenderState::StencilPass,
        56 => RenderState::StencilFunc,
        57 => RenderState::StencilRef,
        58 => RenderState::StencilMask,
        59 => RenderState::StencilWriteMask,
        60 => RenderState::TextureFactor,
        137 => RenderState::Lighting,
        139 => RenderState::Ambient,
        143 => RenderState::NormalizeNormals,
        152 => RenderState::ClipPlaneEnable,
        154 => RenderState::PointSize,
        168 => RenderState::ColorWriteEnable,
        171 => RenderState::BlendOp,
        _ => return None,
    };
    Some(state)
}

/// D3D8 设备桩
pub struct LegacyDevice {
    driver: SharedDriver,
    fvf: u32,
    vertex_formats: HashMap<u32, VertexFormatHandle>,
    streams: Vec<Option<VertexBufferClass>>,
    indices: Option<IndexBufferClass>,
    base_vertex: u32,
    textures: SecondaryMap<TextureHandle, MemoryTexture>,
    in_scene: bool,
    lost: bool,
}

impl LegacyDevice {
    pub fn new(driver: SharedDriver) -> Self {
        Self {
            driver,
            fvf: 0,
            vertex_formats: HashMap::new(),
            streams: vec![None; MAX_STREAMS],
            indices: None,
            base_vertex: 0,
            textures: SecondaryMap::new(),
            in_scene: false,
            lost: false,
        }
    }

    pub fn driver(&self) -> &SharedDriver {
        &self.driver
    }

    /// 当前 FVF
    pub fn fvf(&self) -> u32 {
        self.fvf
    }

    pub fn is_in_scene(&self) -> bool {
        self.in_scene
    }

    fn borrow(&self) -> Result<RefMut<'_, Box<dyn GraphicsDriver>>, HResult> {
        self.driver.try_borrow_mut().map_err(|_| {
            debug!("Graphics driver is busy (a lock window is still borrowed)");
            D3DERR_INVALIDCALL
        })
    }

    fn check<T>(&mut self, result: DriverResult<T>) -> Result<T, HResult> {
        result.map_err(|err| {
            if err.requires_reset() {
                if !self.lost {
                    warn!(error = %err, "Legacy device lost");
                }
                self.lost = true;
            } else {
                debug!(error = %err, "Legacy call failed");
            }
            hresult(&err)
        })
    }

    /// 把驱动调用结果转换为结果码
    fn call(&mut self, f: impl FnOnce(&mut dyn GraphicsDriver) -> DriverResult<()>) -> HResult {
        let result = match self.borrow() {
            Ok(mut driver) => f(&mut **driver),
            Err(hr) => return hr,
        };
        match self.check(result) {
            Ok(()) => D3D_OK,
            Err(hr) => hr,
        }
    }

    // ---- 场景 ----

    pub fn begin_scene(&mut self) -> HResult {
        if self.in_scene {
            debug!("BeginScene called twice");
            return D3DERR_INVALIDCALL;
        }
        let hr = self.call(|d| d.begin_frame());
        self.in_scene = succeeded(hr);
        hr
    }

    pub fn end_scene(&mut self) -> HResult {
        if !self.in_scene {
            debug!("EndScene without BeginScene");
            return D3DERR_INVALIDCALL;
        }
        self.in_scene = false;
        self.call(|d| d.end_frame())
    }

    pub fn present(&mut self) -> HResult {
        self.call(|d| d.present())
    }

    /// 清屏；场景外只记录清屏颜色，在下一次 `begin_scene` 时生效
    pub fn clear(&mut self, flags: u32, color: u32, _z: f32, _stencil: u32) -> HResult {
        let color = Color::from_argb(color);
        if !self.in_scene {
            if flags & D3DCLEAR_TARGET != 0 {
                return self.call(|d| {
                    d.set_clear_color(color);
                    Ok(())
                });
            }
            return D3D_OK;
        }
        let clear_depth = flags & (D3DCLEAR_ZBUFFER | D3DCLEAR_STENCIL) != 0;
        if flags & D3DCLEAR_TARGET == 0 && !clear_depth {
            return D3D_OK;
        }
        self.call(|d| d.clear(color, clear_depth))
    }

    // ---- 状态 ----

    /// 未映射的渲染状态被忽略并返回成功
    pub fn set_render_state(&mut self, state: u32, value: u32) -> HResult {
        match render_state(state) {
            Some(state) => self.call(|d| d.set_render_state(state, value as u64)),
            None => {
                trace!(state, value, "Ignoring unmapped render state");
                D3D_OK
            }
        }
    }

    pub fn get_render_state(&self, state: u32) -> Result<u32, HResult> {
        let state = render_state(state).ok_or(D3DERR_INVALIDCALL)?;
        Ok(self.borrow()?.render_state(state) as u32)
    }

    pub fn set_transform(&mut self, state: u32, matrix: &Matrix4) -> HResult {
        let Some(ty) = transform_type(state) else {
            trace!(state, "Ignoring unsupported transform type");
            return D3DERR_INVALIDCALL;
        };
        self.call(|d| {
            d.set_transform(ty, *matrix);
            Ok(())
        })
    }

    pub fn get_transform(&self, state: u32) -> Result<Matrix4, HResult> {
        let ty = transform_type(state).ok_or(D3DERR_INVALIDCALL)?;
        Ok(self.borrow()?.transform(ty))
    }

    /// 按 FVF 选择顶点格式，同一 FVF 的格式只创建一次
    pub fn set_vertex_shader(&mut self, fvf: u32) -> HResult {
        let format = match self.vertex_formats.get(&fvf) {
            Some(&format) => format,
            None => {
                let elements = fvf::vertex_elements(fvf);
                if elements.is_empty() {
                    debug!(fvf = %format_args!("{fvf:#x}"), "FVF has no vertex elements");
                    return D3DERR_INVALIDCALL;
                }
                let result = match self.borrow() {
                    Ok(mut driver) => driver.create_vertex_format(&elements),
                    Err(hr) => return hr,
                };
                match self.check(result) {
                    Ok(format) => {
                        self.vertex_formats.insert(fvf, format);
                        format
                    }
                    Err(hr) => return hr,
                }
            }
        };
        let hr = self.call(|d| d.set_vertex_format(format));
        if succeeded(hr) {
            self.fvf = fvf;
        }
        hr
    }

    pub fn set_stream_source(
        &mut self,
        stream: u32,
        buffer: Option<&VertexBufferClass>,
        stride: u32,
    ) -> HResult {
        let slot = stream as usize;
        if slot >= self.streams.len() {
            return D3DERR_INVALIDCALL;
        }
        let handle = buffer.map_or(VertexBufferHandle::invalid(), VertexBufferClass::handle);
        let hr = self.call(|d| d.set_stream_source(stream, handle, 0, stride));
        if succeeded(hr) {
            self.streams[slot] = buffer.map(VertexBufferClass::add_ref);
        }
        hr
    }

    /// `base_vertex` 加到之后每次索引绘制的顶点索引上
    pub fn set_indices(&mut self, buffer: Option<&IndexBufferClass>, base_vertex: u32) -> HResult {
        let handle = buffer.map_or(IndexBufferHandle::invalid(), IndexBufferClass::handle);
        let hr = self.call(|d| d.set_index_buffer(handle, 0));
        if succeeded(hr) {
            self.indices = buffer.map(IndexBufferClass::add_ref);
            self.base_vertex = base_vertex;
        }
        hr
    }

    pub fn set_texture(&mut self, stage: u32, texture: Option<TextureHandle>) -> HResult {
        let texture = texture.unwrap_or_else(TextureHandle::invalid);
        self.call(|d| d.set_texture(stage, texture))
    }

    // ---- 绘制 ----

    pub fn draw_primitive(&mut self, primitive: u32, start_vertex: u32, count: u32) -> HResult {
        let Some(primitive) = primitive_type(primitive) else {
            return D3DERR_INVALIDCALL;
        };
        self.call(|d| d.draw_primitive(primitive, start_vertex, count))
    }

    pub fn draw_indexed_primitive(
        &mut self,
        primitive: u32,
        _min_index: u32,
        _num_vertices: u32,
        start_index: u32,
        count: u32,
    ) -> HResult {
        let Some(primitive) = primitive_type(primitive) else {
            return D3DERR_INVALIDCALL;
        };
        if self.indices.is_none() {
            debug!("DrawIndexedPrimitive without an index buffer");
            return D3DERR_INVALIDCALL;
        }
        let base_vertex = self.base_vertex as i32;
        self.call(|d| d.draw_indexed_primitive(primitive, base_vertex, start_index, count))
    }

    /// 用户内存绘制；之后 0 号流和索引缓冲区处于未绑定状态
    pub fn draw_primitive_up(
        &mut self,
        primitive: u32,
        count: u32,
        vertex_data: &[u8],
        stride: u32,
    ) -> HResult {
        let Some(primitive) = primitive_type(primitive) else {
            return D3DERR_INVALIDCALL;
        };
        let hr = self.call(|d| d.draw_primitive_up(primitive, count, vertex_data, stride));
        self.unbind_after_up();
        hr
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed_primitive_up(
        &mut self,
        primitive: u32,
        min_index: u32,
        num_vertices: u32,
        count: u32,
        index_data: &[u8],
        index_format: IndexFormat,
        vertex_data: &[u8],
        stride: u32,
    ) -> HResult {
        let Some(primitive) = primitive_type(primitive) else {
            return D3DERR_INVALIDCALL;
        };
        let hr = self.call(|d| {
            d.draw_indexed_primitive_up(
                primitive,
                min_index,
                num_vertices,
                count,
                index_data,
                index_format,
                vertex_data,
                stride,
            )
        });
        self.unbind_after_up();
        hr
    }

    fn unbind_after_up(&mut self) {
        let had_stream = self.streams[0].take().is_some();
        let had_indices = self.indices.take().is_some();
        self.base_vertex = 0;
        if !had_stream && !had_indices {
            return;
        }
        let Ok(mut driver) = self.driver.try_borrow_mut() else {
            warn!("Graphics driver is busy, stream 0 and indices stay bound after UP draw");
            return;
        };
        if had_stream {
            if let Err(err) = driver.set_stream_source(0, VertexBufferHandle::invalid(), 0, 0) {
                warn!(error = %err, "Failed to unbind stream 0 after UP draw");
            }
        }
        if had_indices {
            if let Err(err) = driver.set_index_buffer(IndexBufferHandle::invalid(), 0) {
                warn!(error = %err, "Failed to unbind indices after UP draw");
            }
        }
    }

    // ---- 资源 ----

    /// `length` 为字节数，顶点数按 FVF 跨度向下取整
    pub fn create_vertex_buffer(
        &mut self,
        length: u32,
        usage: BufferUsage,
        fvf: u32,
    ) -> Result<VertexBufferClass, HResult> {
        let stride = fvf::vertex_size(fvf);
        if stride == 0 {
            debug!(fvf = %format_args!("{fvf:#x}"), "Vertex buffer without an FVF stride");
            return Err(D3DERR_INVALIDCALL);
        }
        let result = VertexBufferClass::new(&self.driver, fvf, length / stride, usage);
        self.check(result)
    }

    /// `length` 为字节数
    pub fn create_index_buffer(
        &mut self,
        length: u32,
        usage: BufferUsage,
        format: IndexFormat,
    ) -> Result<IndexBufferClass, HResult> {
        let result = IndexBufferClass::new(&self.driver, format, length / format.size(), usage);
        self.check(result)
    }

    /// 创建内存纹理和对应的驱动纹理，`levels` 为 0 时生成完整 mip 链
    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        levels: u32,
        format: TextureFormat,
        pool: Pool,
    ) -> Result<TextureHandle, HResult> {
        let texture = {
            let result = MemoryTexture::new(width, height, levels, format, pool);
            self.check(result)?
        };
        let result = {
            let mut driver = self.borrow()?;
            texture.create_driver_texture(&mut **driver)
        };
        let handle = self.check(result)?;
        self.textures.insert(handle, texture);
        Ok(handle)
    }

    pub fn texture(&self, texture: TextureHandle) -> Option<&MemoryTexture> {
        self.textures.get(texture)
    }

    pub fn lock_texture_rect(
        &mut self,
        texture: TextureHandle,
        level: u32,
        rect: Option<Rect>,
    ) -> Result<LockedRect<'_>, HResult> {
        let Some(memory) = self.textures.get_mut(texture) else {
            return Err(D3DERR_INVALIDCALL);
        };
        memory.lock_rect(level, rect).map_err(|err| {
            debug!(error = %err, "LockRect failed");
            hresult(&err)
        })
    }

    /// 解锁并把这一层上传到驱动纹理
    pub fn unlock_texture_rect(&mut self, texture: TextureHandle, level: u32) -> HResult {
        let Some(memory) = self.textures.get_mut(texture) else {
            return D3DERR_INVALIDCALL;
        };
        if let Err(err) = memory.unlock_rect(level) {
            debug!(error = %err, "UnlockRect failed");
            return hresult(&err);
        }
        let result = match (self.driver.try_borrow_mut(), self.textures.get(texture)) {
            (Ok(mut driver), Some(memory)) => memory.upload_level(&mut **driver, texture, level),
            _ => Err(DriverError::state("Graphics driver is busy")),
        };
        match self.check(result) {
            Ok(()) => D3D_OK,
            Err(hr) => hr,
        }
    }

    pub fn release_texture(&mut self, texture: TextureHandle) -> HResult {
        if self.textures.remove(texture).is_none() {
            return D3DERR_INVALIDCALL;
        }
        self.call(|d| d.destroy_texture(texture))
    }

    // ---- 查询与恢复 ----

    pub fn get_device_caps(&self) -> Result<DriverCaps, HResult> {
        Ok(self.borrow()?.capabilities())
    }

    /// 设备丢失后返回 `D3DERR_DEVICENOTRESET`，等待 `reset`
    pub fn test_cooperative_level(&self) -> HResult {
        if self.lost {
            D3DERR_DEVICENOTRESET
        } else {
            D3D_OK
        }
    }

    /// 按新尺寸重建交换链并清除丢失状态
    pub fn reset(&mut self, width: u32, height: u32) -> HResult {
        if self.in_scene {
            debug!("Reset inside a scene");
            return D3DERR_INVALIDCALL;
        }
        let hr = self.call(|d| d.resize_swap_chain(width, height));
        if succeeded(hr) {
            self.lost = false;
            debug!(width, height, "Legacy device reset");
        }
        hr
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::compat::fvf::{D3DFVF_XYZ, FVF_UNLIT_VERTEX};
    use crate::gfx::explicit::{DriverSettings, ExplicitDriver};
    use crate::gfx::headless::HeadlessDevice;
    use crate::gfx::types::CullMode;

    const D3DPT_TRIANGLELIST: u32 = 4;
    const D3DRS_CULLMODE: u32 = 22;

    fn device() -> LegacyDevice {
        let mut driver = ExplicitDriver::new(HeadlessDevice::new(), DriverSettings::default());
        driver.initialize(None, 320, 240, false).unwrap();
        let driver: Box<dyn GraphicsDriver> = Box::new(driver);
        LegacyDevice::new(Rc::new(RefCell::new(driver)))
    }

    fn triangle_buffer(device: &mut LegacyDevice) -> VertexBufferClass {
        let buffer = device
            .create_vertex_buffer(3 * 24, BufferUsage::Dynamic, FVF_UNLIT_VERTEX)
            .unwrap();
        buffer.write_lock().unwrap().fill(0);
        buffer
    }

    #[test]
    fn test_hresult_mapping() {
        assert_eq!(hresult(&DriverError::state("x")), D3DERR_INVALIDCALL);
        assert_eq!(hresult(&DriverError::NotInitialized), D3DERR_NOTAVAILABLE);
        assert_eq!(hresult(&DriverError::OutOfMemory), D3DERR_OUTOFVIDEOMEMORY);
        assert_eq!(hresult(&DriverError::SwapchainLost), D3DERR_DEVICELOST);
        assert_eq!(hresult(&DriverError::Timeout(1000)), E_FAIL);
        assert!(failed(D3DERR_INVALIDCALL));
        assert!(succeeded(D3D_OK));
    }

    #[test]
    fn test_numbering_tables() {
        assert_eq!(primitive_type(4), Some(PrimitiveType::TriangleList));
        assert_eq!(primitive_type(0), None);
        assert_eq!(primitive_type(7), None);
        assert_eq!(render_state(137), Some(RenderState::Lighting));
        assert_eq!(render_state(171), Some(RenderState::BlendOp));
        assert_eq!(render_state(9), None);
        assert_eq!(transform_type(256), Some(TransformType::World));
    }

    #[test]
    fn test_scene_draw() {
        let mut device = device();
        let buffer = triangle_buffer(&mut device);
        assert_eq!(device.set_vertex_shader(FVF_UNLIT_VERTEX), D3D_OK);
        assert_eq!(device.set_stream_source(0, Some(&buffer), 24), D3D_OK);
        assert_eq!(buffer.ref_count(), 2);

        assert_eq!(device.draw_primitive(D3DPT_TRIANGLELIST, 0, 1), D3DERR_INVALIDCALL);
        assert_eq!(device.begin_scene(), D3D_OK);
        assert_eq!(device.begin_scene(), D3DERR_INVALIDCALL);
        assert_eq!(device.clear(D3DCLEAR_TARGET | D3DCLEAR_ZBUFFER, 0xFF000000, 1.0, 0), D3D_OK);
        assert_eq!(device.draw_primitive(D3DPT_TRIANGLELIST, 0, 1), D3D_OK);
        assert_eq!(device.draw_primitive(9, 0, 1), D3DERR_INVALIDCALL);
        assert_eq!(device.end_scene(), D3D_OK);
        assert_eq!(device.present(), D3D_OK);

        assert_eq!(device.set_stream_source(0, None, 0), D3D_OK);
        assert_eq!(buffer.ref_count(), 1);
    }

    #[test]
    fn test_vertex_format_cached_per_fvf() {
        let mut device = device();
        assert_eq!(device.set_vertex_shader(D3DFVF_XYZ), D3D_OK);
        assert_eq!(device.set_vertex_shader(FVF_UNLIT_VERTEX), D3D_OK);
        assert_eq!(device.set_vertex_shader(D3DFVF_XYZ), D3D_OK);
        assert_eq!(device.vertex_formats.len(), 2);
        assert_eq!(device.fvf(), D3DFVF_XYZ);
        assert_eq!(device.set_vertex_shader(0), D3DERR_INVALIDCALL);
    }

    #[test]
    fn test_render_state_forwarded() {
        let mut device = device();
        assert_eq!(device.set_render_state(D3DRS_CULLMODE, 1), D3D_OK);
        assert_eq!(device.get_render_state(D3DRS_CULLMODE), Ok(CullMode::None.raw() as u32));
        assert_eq!(device.set_render_state(9, 2), D3D_OK);
        assert_eq!(device.get_render_state(9), Err(D3DERR_INVALIDCALL));
    }

    #[test]
    fn test_indexed_draw_requires_indices() {
        let mut device = device();
        let vertices = triangle_buffer(&mut device);
        let indices = device.create_index_buffer(6, BufferUsage::Default, IndexFormat::U16).unwrap();
        assert_eq!(indices.index_count(), 3);
        indices.write_lock().unwrap().copy_from_slice(bytemuck::cast_slice(&[0u16, 1, 2]));

        device.set_vertex_shader(FVF_UNLIT_VERTEX);
        device.set_stream_source(0, Some(&vertices), 0);
        assert_eq!(device.begin_scene(), D3D_OK);
        assert_eq!(device.draw_indexed_primitive(D3DPT_TRIANGLELIST, 0, 3, 0, 1), D3DERR_INVALIDCALL);
        assert_eq!(device.set_indices(Some(&indices), 0), D3D_OK);
        assert_eq!(device.draw_indexed_primitive(D3DPT_TRIANGLELIST, 0, 3, 0, 1), D3D_OK);
        assert_eq!(device.end_scene(), D3D_OK);
        assert_eq!(device.present(), D3D_OK);
    }

    #[test]
    fn test_draw_up_unbinds_stream_zero() {
        let mut device = device();
        let buffer = triangle_buffer(&mut device);
        device.set_vertex_shader(FVF_UNLIT_VERTEX);
        device.set_stream_source(0, Some(&buffer), 0);
        device.begin_scene();
        let vertices = [0u8; 3 * 24];
        assert_eq!(device.draw_primitive_up(D3DPT_TRIANGLELIST, 1, &vertices, 24), D3D_OK);
        assert_eq!(buffer.ref_count(), 1);
        device.end_scene();
        device.present();
    }

    #[test]
    fn test_draw_up_with_busy_driver() {
        let mut device = device();
        let buffer = triangle_buffer(&mut device);
        device.set_vertex_shader(FVF_UNLIT_VERTEX);
        device.set_stream_source(0, Some(&buffer), 0);
        device.begin_scene();

        let shared = Rc::clone(&device.driver);
        let held = shared.borrow();
        let vertices = [0u8; 3 * 24];
        assert_eq!(device.draw_primitive_up(D3DPT_TRIANGLELIST, 1, &vertices, 24), D3DERR_INVALIDCALL);
        drop(held);

        // 本地绑定照样释放，下一次 UP 绘制正常
        assert_eq!(buffer.ref_count(), 1);
        assert_eq!(device.draw_primitive_up(D3DPT_TRIANGLELIST, 1, &vertices, 24), D3D_OK);
        device.end_scene();
        device.present();
    }

    #[test]
    fn test_texture_lock_uploads_level() {
        let mut device = device();
        let texture = device
            .create_texture(16, 16, 0, TextureFormat::A8R8G8B8, Pool::Managed)
            .unwrap();
        assert_eq!(device.texture(texture).map(MemoryTexture::level_count), Some(5));

        device.lock_texture_rect(texture, 0, None).unwrap().data.fill(0x11);
        assert_eq!(device.lock_texture_rect(texture, 0, None).unwrap_err(), D3DERR_INVALIDCALL);
        assert_eq!(device.unlock_texture_rect(texture, 0), D3D_OK);
        assert_eq!(device.unlock_texture_rect(texture, 0), D3DERR_INVALIDCALL);

        {
            let mut driver = device.driver().borrow_mut();
            let lock = driver.lock_texture(texture, 0).unwrap();
            assert!(lock.data.iter().all(|&b| b == 0x11));
            driver.unlock_texture(texture, 0).unwrap();
        }

        assert_eq!(device.set_texture(0, Some(texture)), D3D_OK);
        assert_eq!(device.release_texture(texture), D3D_OK);
        assert_eq!(device.release_texture(texture), D3DERR_INVALIDCALL);
    }

    #[test]
    fn test_lost_until_reset() {
        let mut device = device();
        assert_eq!(device.test_cooperative_level(), D3D_OK);
        let result: Result<(), HResult> = device.check(Err(DriverError::DeviceLost("test".into())));
        assert_eq!(result, Err(D3DERR_DEVICELOST));
        assert_eq!(device.test_cooperative_level(), D3DERR_DEVICENOTRESET);

        assert_eq!(device.reset(640, 480), D3D_OK);
        assert_eq!(device.test_cooperative_level(), D3D_OK);
        assert_eq!(device.driver().borrow().display_size(), (640, 480));
    }

    #[test]
    fn test_caps_and_transform() {
        let mut device = device();
        let caps = device.get_device_caps().unwrap();
        assert_eq!(caps.max_streams as usize, MAX_STREAMS);

        let world = Matrix4::new_scaling(2.0);
        assert_eq!(device.set_transform(D3DTS_WORLD, &world), D3D_OK);
        assert_eq!(device.get_transform(D3DTS_WORLD), Ok(world));
        assert_eq!(device.set_transform(17, &world), D3DERR_INVALIDCALL);
    }
}
