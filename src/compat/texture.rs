//! 内存纹理和表面
//!
//! 旧式程序把纹理当作一块可以随时锁定改写的内存。`MemoryTexture` 为每一层 mip
//! 分配一个 `MemorySurface`，行距和大小与驱动的纹理锁定一致（见 `gfx::format`），
//! 所以一层数据可以原样上传到驱动纹理。
//!
//! 锁定规则：
//! - 同一表面不能重复锁定，未锁定时解锁同样是错误
//! - 子矩形锁定返回从 `top * pitch + left * bpp` 开始的窗口，行距仍是整行
//! - 块压缩格式总是锁定整层

use tracing::{debug, trace};

use crate::core::error::{DriverError, DriverResult};
use crate::gfx::driver::GraphicsDriver;
use crate::gfx::format::{self, FormatInfo};
use crate::gfx::handle::TextureHandle;
use crate::gfx::types::{Rect, TextureDescriptor, TextureFormat};

/// 资源所在的内存池
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pool {
    Default,
    #[default]
    Managed,
    SystemMem,
    Scratch,
}

/// 表面描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub format: TextureFormat,
    pub pool: Pool,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub size: usize,
}

/// 锁定得到的窗口
#[derive(Debug)]
pub struct LockedRect<'a> {
    pub data: &'a mut [u8],
    pub pitch: u32,
}

/// 一层 mip 的 CPU 内存
#[derive(Debug, Clone)]
pub struct MemorySurface {
    width: u32,
    height: u32,
    format: TextureFormat,
    pool: Pool,
    pitch: u32,
    data: Vec<u8>,
    locked: bool,
}

impl MemorySurface {
    pub fn new(width: u32, height: u32, format: TextureFormat, pool: Pool) -> DriverResult<Self> {
        if width == 0 || height == 0 {
            return Err(DriverError::argument(format!(
                "Surface extent {width}x{height} must be non-zero"
            )));
        }
        if format == TextureFormat::Unknown {
            return Err(DriverError::argument("Surface format is unknown"));
        }
        let pitch = format::row_pitch(format, width);
        let size = format::level_size(format, width, height);
        Ok(Self {
            width,
            height,
            format,
            pool,
            pitch,
            data: vec![0; size],
            locked: false,
        })
    }

    pub fn desc(&self) -> SurfaceDesc {
        SurfaceDesc {
            format: self.format,
            pool: self.pool,
            width: self.width,
            height: self.height,
            pitch: self.pitch,
            size: self.data.len(),
        }
    }

    /// 锁定整个表面（`None`）或一个子矩形
    pub fn lock_rect(&mut self, rect: Option<Rect>) -> DriverResult<LockedRect<'_>> {
        if self.locked {
            return Err(DriverError::state("Surface is already locked"));
        }
        let range = match rect {
            Some(rect) if !self.format.is_compressed() => self.rect_range(rect)?,
            _ => 0..self.data.len(),
        };
        self.locked = true;
        trace!(start = range.start, end = range.end, "Surface locked");
        Ok(LockedRect {
            data: &mut self.data[range],
            pitch: self.pitch,
        })
    }

    pub fn unlock_rect(&mut self) -> DriverResult<()> {
        if !self.locked {
            return Err(DriverError::state("Surface is not locked"));
        }
        self.locked = false;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    fn rect_range(&self, rect: Rect) -> DriverResult<std::ops::Range<usize>> {
        let inside = rect.left >= 0
            && rect.top >= 0
            && rect.right as u32 <= self.width
            && rect.bottom as u32 <= self.height;
        if rect.is_empty() || !inside {
            return Err(DriverError::argument(format!(
                "Lock rect {rect:?} outside {}x{} surface",
                self.width, self.height
            )));
        }
        let bpp = self.format.bytes_per_pixel() as usize;
        let pitch = self.pitch as usize;
        let start = rect.top as usize * pitch + rect.left as usize * bpp;
        let end = (rect.bottom as usize - 1) * pitch + rect.right as usize * bpp;
        Ok(start..end)
    }
}

/// 带完整 mip 链的内存纹理
#[derive(Debug, Clone)]
pub struct MemoryTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    levels: Vec<MemorySurface>,
}

impl MemoryTexture {
    /// `levels` 为 0 时生成到 1x1 的完整链
    pub fn new(
        width: u32,
        height: u32,
        levels: u32,
        format: TextureFormat,
        pool: Pool,
    ) -> DriverResult<Self> {
        if width == 0 || height == 0 {
            return Err(DriverError::argument(format!(
                "Texture extent {width}x{height} must be non-zero"
            )));
        }
        let count = format::resolve_mip_count(width, height, levels);
        let levels = (0..count)
            .map(|level| {
                let (w, h) = format::mip_extent(width, height, level);
                MemorySurface::new(w, h, format, pool)
            })
            .collect::<DriverResult<Vec<_>>>()?;
        debug!(width, height, levels = count, ?format, "Memory texture created");
        Ok(Self { width, height, format, levels })
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn level_desc(&self, level: u32) -> DriverResult<SurfaceDesc> {
        self.level(level).map(MemorySurface::desc)
    }

    pub fn surface_level(&mut self, level: u32) -> DriverResult<&mut MemorySurface> {
        let count = self.levels.len();
        self.levels
            .get_mut(level as usize)
            .ok_or_else(|| level_error(level, count))
    }

    pub fn lock_rect(&mut self, level: u32, rect: Option<Rect>) -> DriverResult<LockedRect<'_>> {
        self.surface_level(level)?.lock_rect(rect)
    }

    pub fn unlock_rect(&mut self, level: u32) -> DriverResult<()> {
        self.surface_level(level)?.unlock_rect()
    }

    /// 驱动纹理的描述，层数与内存纹理一致
    pub fn descriptor(&self) -> TextureDescriptor {
        TextureDescriptor::new_2d(self.width, self.height, self.format, self.level_count())
    }

    /// 在驱动中创建纹理并带上当前全部层的内容
    pub fn create_driver_texture(&self, driver: &mut dyn GraphicsDriver) -> DriverResult<TextureHandle> {
        let mut chain = Vec::with_capacity(self.levels.iter().map(|s| s.data.len()).sum());
        for surface in &self.levels {
            chain.extend_from_slice(&surface.data);
        }
        driver.create_texture(&self.descriptor(), Some(&chain))
    }

    /// 把一层内容写入驱动纹理的同一层
    pub fn upload_level(
        &self,
        driver: &mut dyn GraphicsDriver,
        texture: TextureHandle,
        level: u32,
    ) -> DriverResult<()> {
        let surface = self.level(level)?;
        {
            let lock = driver.lock_texture(texture, level)?;
            if lock.pitch != surface.pitch || lock.data.len() != surface.data.len() {
                let (pitch, size) = (lock.pitch, lock.data.len());
                drop(lock);
                driver.unlock_texture(texture, level)?;
                return Err(DriverError::state(format!(
                    "Driver texture level {level} layout ({pitch}, {size}) differs from memory surface ({}, {})",
                    surface.pitch,
                    surface.data.len()
                )));
            }
            lock.data.copy_from_slice(&surface.data);
        }
        driver.unlock_texture(texture, level)
    }

    fn level(&self, level: u32) -> DriverResult<&MemorySurface> {
        self.levels
            .get(level as usize)
            .ok_or_else(|| level_error(level, self.levels.len()))
    }
}

fn level_error(level: u32, count: usize) -> DriverError {
    DriverError::argument(format!("Mip level {level} out of range ({count} levels)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::explicit::{DriverSettings, ExplicitDriver};
    use crate::gfx::headless::HeadlessDevice;

    #[test]
    fn test_dxt1_surface_layout() {
        let surface = MemorySurface::new(130, 130, TextureFormat::Dxt1, Pool::Managed).unwrap();
        let desc = surface.desc();
        assert_eq!(desc.pitch, 264);
        assert_eq!(desc.size, 8712);
    }

    #[test]
    fn test_full_mip_chain() {
        let texture = MemoryTexture::new(256, 64, 0, TextureFormat::A8R8G8B8, Pool::Managed).unwrap();
        assert_eq!(texture.level_count(), 9);
        let last = texture.level_desc(8).unwrap();
        assert_eq!((last.width, last.height), (1, 1));
        assert_eq!(texture.level_desc(2).unwrap().pitch, 64 * 4);
        assert!(matches!(texture.level_desc(9), Err(DriverError::InvalidArgument(_))));
    }

    #[test]
    fn test_double_lock_rejected() {
        let mut texture = MemoryTexture::new(16, 16, 1, TextureFormat::R5G6B5, Pool::Managed).unwrap();
        texture.lock_rect(0, None).unwrap();
        assert!(matches!(texture.lock_rect(0, None), Err(DriverError::InvalidState(_))));
        texture.unlock_rect(0).unwrap();
        assert!(matches!(texture.unlock_rect(0), Err(DriverError::InvalidState(_))));
    }

    #[test]
    fn test_sub_rect_window() {
        let mut surface = MemorySurface::new(8, 8, TextureFormat::A8R8G8B8, Pool::SystemMem).unwrap();
        {
            let lock = surface.lock_rect(Some(Rect::new(2, 3, 4, 5))).unwrap();
            assert_eq!(lock.pitch, 32);
            assert_eq!(lock.data.len(), 32 + 2 * 4);
            lock.data[0] = 0xAB;
        }
        surface.unlock_rect().unwrap();
        assert_eq!(surface.data()[3 * 32 + 2 * 4], 0xAB);

        assert!(surface.lock_rect(Some(Rect::new(6, 6, 9, 7))).is_err());
        assert!(!surface.is_locked());
    }

    #[test]
    fn test_compressed_locks_whole_level() {
        let mut surface = MemorySurface::new(16, 16, TextureFormat::Dxt5, Pool::Managed).unwrap();
        let lock = surface.lock_rect(Some(Rect::new(4, 4, 8, 8))).unwrap();
        assert_eq!(lock.data.len(), 4 * 4 * 16);
    }

    #[test]
    fn test_upload_to_driver() {
        let mut driver = ExplicitDriver::new(HeadlessDevice::new(), DriverSettings::default());
        driver.initialize(None, 64, 64, false).unwrap();

        let mut texture = MemoryTexture::new(8, 8, 0, TextureFormat::A8R8G8B8, Pool::Managed).unwrap();
        let handle = texture.create_driver_texture(&mut driver).unwrap();
        assert_eq!(driver.texture_descriptor(handle).unwrap().mip_levels, 4);

        texture.lock_rect(1, None).unwrap().data.fill(0x7F);
        texture.unlock_rect(1).unwrap();
        texture.upload_level(&mut driver, handle, 1).unwrap();

        let lock = driver.lock_texture(handle, 1).unwrap();
        assert!(lock.data.iter().all(|&b| b == 0x7F));
    }
}
