//! 旧式顶点/索引缓冲区类
//!
//! `VertexBufferClass` 和 `IndexBufferClass` 包装一个驱动句柄，对外保持
//! `AddRef`/`Release`/`Lock`/`Unlock` 的调用习惯：
//!
//! - 引用计数由 `Rc` 实现，`add_ref` 克隆、`release` 消耗；最后一个引用释放时销毁驱动缓冲区
//! - 锁定窗口是驱动 CPU 影子副本的一段，借用期间独占驱动；`WriteLock` 离开作用域时自动解锁
//! - 重复锁定返回之前的窗口（驱动记录警告），未锁定时解锁返回 `InvalidState`
//!
//! 只能在渲染线程使用，计数不是原子的。

use std::cell::{Cell, RefMut};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use tracing::{debug, warn};

use super::fvf;
use crate::core::error::{DriverError, DriverResult};
use crate::gfx::driver::GraphicsDriver;
use crate::gfx::factory::SharedDriver;
use crate::gfx::handle::{Handle, IndexBufferHandle, VertexBufferHandle};
use crate::gfx::types::IndexFormat;

/// 缓冲区用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferUsage {
    #[default]
    Default,
    Dynamic,
    SoftwareProcessing,
}

impl BufferUsage {
    fn is_dynamic(self) -> bool {
        self == BufferUsage::Dynamic
    }
}

/// 一种缓冲区对应的驱动调用
pub trait BufferApi {
    type Handle: Handle;
    const NAME: &'static str;

    fn lock(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> DriverResult<()>;
    fn unlock(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> DriverResult<()>;
    fn window(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> Option<&mut [u8]>;
    fn destroy(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> DriverResult<()>;
}

pub enum VertexApi {}

impl BufferApi for VertexApi {
    type Handle = VertexBufferHandle;
    const NAME: &'static str = "Vertex buffer";

    fn lock(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> DriverResult<()> {
        driver.lock_vertex_buffer(handle, 0, 0).map(|_| ())
    }

    fn unlock(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> DriverResult<()> {
        driver.unlock_vertex_buffer(handle)
    }

    fn window(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> Option<&mut [u8]> {
        driver.locked_vertex_data(handle)
    }

    fn destroy(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> DriverResult<()> {
        driver.destroy_vertex_buffer(handle)
    }
}

pub enum IndexApi {}

impl BufferApi for IndexApi {
    type Handle = IndexBufferHandle;
    const NAME: &'static str = "Index buffer";

    fn lock(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> DriverResult<()> {
        driver.lock_index_buffer(handle, 0, 0).map(|_| ())
    }

    fn unlock(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> DriverResult<()> {
        driver.unlock_index_buffer(handle)
    }

    fn window(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> Option<&mut [u8]> {
        driver.locked_index_data(handle)
    }

    fn destroy(driver: &mut dyn GraphicsDriver, handle: Self::Handle) -> DriverResult<()> {
        driver.destroy_index_buffer(handle)
    }
}

/// 两种缓冲区共用的部分
pub struct BufferCore<A: BufferApi> {
    driver: SharedDriver,
    handle: A::Handle,
    size: usize,
    locked: Cell<bool>,
}

impl<A: BufferApi> BufferCore<A> {
    fn driver(&self) -> DriverResult<RefMut<'_, Box<dyn GraphicsDriver>>> {
        self.driver
            .try_borrow_mut()
            .map_err(|_| DriverError::state("Graphics driver is busy (a lock window is still borrowed)"))
    }

    fn lock(&self) -> DriverResult<RefMut<'_, [u8]>> {
        let mut driver = self.driver()?;
        if self.locked.get() {
            warn!(handle = self.handle.to_raw(), "{} is already locked, returning the previous window", A::NAME);
        } else {
            A::lock(&mut **driver, self.handle)?;
            self.locked.set(true);
        }
        let handle = self.handle;
        RefMut::filter_map(driver, |d| A::window(&mut **d, handle))
            .map_err(|_| DriverError::state(format!("{} lock window unavailable", A::NAME)))
    }

    fn unlock(&self) -> DriverResult<()> {
        if !self.locked.get() {
            return Err(DriverError::state(format!("{} is not locked", A::NAME)));
        }
        let mut driver = self.driver()?;
        A::unlock(&mut **driver, self.handle)?;
        self.locked.set(false);
        Ok(())
    }

    fn write_lock(&self) -> DriverResult<WriteLock<'_, A>> {
        let data = self.lock()?;
        Ok(WriteLock { core: self, data: Some(data) })
    }
}

impl<A: BufferApi> Drop for BufferCore<A> {
    fn drop(&mut self) {
        let Ok(mut driver) = self.driver.try_borrow_mut() else {
            warn!(handle = self.handle.to_raw(), "{} leaked: driver busy at release", A::NAME);
            return;
        };
        if self.locked.get() {
            if let Err(err) = A::unlock(&mut **driver, self.handle) {
                debug!(error = %err, "Unlock at release failed");
            }
        }
        match A::destroy(&mut **driver, self.handle) {
            Ok(()) => debug!(handle = self.handle.to_raw(), "{} released", A::NAME),
            Err(err) => debug!(error = %err, "{} destroy at release failed", A::NAME),
        }
    }
}

/// 作用域写锁，drop 时解锁并上传
pub struct WriteLock<'a, A: BufferApi> {
    core: &'a BufferCore<A>,
    data: Option<RefMut<'a, [u8]>>,
}

impl<A: BufferApi> Deref for WriteLock<'_, A> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl<A: BufferApi> DerefMut for WriteLock<'_, A> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl<A: BufferApi> Drop for WriteLock<'_, A> {
    fn drop(&mut self) {
        // 先归还驱动借用再解锁
        self.data.take();
        if let Err(err) = self.core.unlock() {
            warn!(error = %err, "{} unlock failed", A::NAME);
        }
    }
}

pub type VertexWriteLock<'a> = WriteLock<'a, VertexApi>;
pub type IndexWriteLock<'a> = WriteLock<'a, IndexApi>;

struct VertexInner {
    core: BufferCore<VertexApi>,
    fvf: u32,
    vertex_count: u32,
    vertex_size: u32,
}

/// 旧式顶点缓冲区
#[derive(Clone)]
pub struct VertexBufferClass {
    inner: Rc<VertexInner>,
}

impl VertexBufferClass {
    /// 按 FVF 计算跨度并在驱动中创建缓冲区
    pub fn new(
        driver: &SharedDriver,
        fvf: u32,
        vertex_count: u32,
        usage: BufferUsage,
    ) -> DriverResult<Self> {
        let vertex_size = fvf::vertex_size(fvf);
        let size = vertex_size as usize * vertex_count as usize;
        if size == 0 {
            return Err(DriverError::argument(format!(
                "Vertex buffer with FVF {fvf:#x} and {vertex_count} vertices is empty"
            )));
        }
        let handle = driver
            .try_borrow_mut()
            .map_err(|_| DriverError::state("Graphics driver is busy"))?
            .create_vertex_buffer(size, usage.is_dynamic(), None)?;
        debug!(handle = handle.to_raw(), size, vertex_count, fvf = %format_args!("{fvf:#x}"), "Vertex buffer created");
        Ok(Self {
            inner: Rc::new(VertexInner {
                core: BufferCore {
                    driver: Rc::clone(driver),
                    handle,
                    size,
                    locked: Cell::new(false),
                },
                fvf,
                vertex_count,
                vertex_size,
            }),
        })
    }

    /// 增加一个引用
    pub fn add_ref(&self) -> Self {
        self.clone()
    }

    /// 释放一个引用，返回剩余引用数；降到 0 时销毁驱动缓冲区
    pub fn release(self) -> usize {
        Rc::strong_count(&self.inner) - 1
    }

    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// 锁定整个缓冲区
    pub fn lock(&self) -> DriverResult<RefMut<'_, [u8]>> {
        self.inner.core.lock()
    }

    pub fn unlock(&self) -> DriverResult<()> {
        self.inner.core.unlock()
    }

    pub fn write_lock(&self) -> DriverResult<VertexWriteLock<'_>> {
        self.inner.core.write_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.core.locked.get()
    }

    pub fn handle(&self) -> VertexBufferHandle {
        self.inner.core.handle
    }

    pub fn size(&self) -> usize {
        self.inner.core.size
    }

    pub fn fvf(&self) -> u32 {
        self.inner.fvf
    }

    pub fn vertex_count(&self) -> u32 {
        self.inner.vertex_count
    }

    pub fn vertex_size(&self) -> u32 {
        self.inner.vertex_size
    }
}

struct IndexInner {
    core: BufferCore<IndexApi>,
    format: IndexFormat,
    index_count: u32,
}

/// 旧式索引缓冲区
#[derive(Clone)]
pub struct IndexBufferClass {
    inner: Rc<IndexInner>,
}

impl IndexBufferClass {
    pub fn new(
        driver: &SharedDriver,
        format: IndexFormat,
        index_count: u32,
        usage: BufferUsage,
    ) -> DriverResult<Self> {
        let size = format.size() as usize * index_count as usize;
        if size == 0 {
            return Err(DriverError::argument("Index buffer must hold at least one index"));
        }
        let handle = driver
            .try_borrow_mut()
            .map_err(|_| DriverError::state("Graphics driver is busy"))?
            .create_index_buffer(size, format, usage.is_dynamic(), None)?;
        debug!(handle = handle.to_raw(), size, index_count, ?format, "Index buffer created");
        Ok(Self {
            inner: Rc::new(IndexInner {
                core: BufferCore {
                    driver: Rc::clone(driver),
                    handle,
                    size,
                    locked: Cell::new(false),
                },
                format,
                index_count,
            }),
        })
    }

    pub fn add_ref(&self) -> Self {
        self.clone()
    }

    pub fn release(self) -> usize {
        Rc::strong_count(&self.inner) - 1
    }

    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub fn lock(&self) -> DriverResult<RefMut<'_, [u8]>> {
        self.inner.core.lock()
    }

    pub fn unlock(&self) -> DriverResult<()> {
        self.inner.core.unlock()
    }

    pub fn write_lock(&self) -> DriverResult<IndexWriteLock<'_>> {
        self.inner.core.write_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.core.locked.get()
    }

    pub fn handle(&self) -> IndexBufferHandle {
        self.inner.core.handle
    }

    pub fn size(&self) -> usize {
        self.inner.core.size
    }

    pub fn format(&self) -> IndexFormat {
        self.inner.format
    }

    pub fn index_count(&self) -> u32 {
        self.inner.index_count
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::compat::fvf::FVF_UNLIT_VERTEX;
    use crate::gfx::explicit::{DriverSettings, ExplicitDriver};
    use crate::gfx::headless::HeadlessDevice;

    fn shared_driver() -> SharedDriver {
        let mut driver = ExplicitDriver::new(HeadlessDevice::new(), DriverSettings::default());
        driver.initialize(None, 320, 240, false).unwrap();
        let driver: Box<dyn GraphicsDriver> = Box::new(driver);
        Rc::new(RefCell::new(driver))
    }

    #[test]
    fn test_vertex_buffer_from_fvf() {
        let driver = shared_driver();
        let buffer = VertexBufferClass::new(&driver, FVF_UNLIT_VERTEX, 10, BufferUsage::Dynamic).unwrap();
        assert_eq!(buffer.vertex_size(), 24);
        assert_eq!(buffer.size(), 240);
        assert_eq!(driver.borrow().vertex_buffer_size(buffer.handle()).unwrap(), 240);
        assert!(VertexBufferClass::new(&driver, 0, 10, BufferUsage::Default).is_err());
    }

    #[test]
    fn test_reference_counting_destroys_once() {
        let driver = shared_driver();
        let buffer = VertexBufferClass::new(&driver, FVF_UNLIT_VERTEX, 4, BufferUsage::Default).unwrap();
        let handle = buffer.handle();

        let extra = buffer.add_ref();
        assert_eq!(buffer.ref_count(), 2);
        assert_eq!(extra.release(), 1);
        assert!(driver.borrow().vertex_buffer_size(handle).is_ok());

        let refs: Vec<_> = (0..3).map(|_| buffer.add_ref()).collect();
        assert_eq!(buffer.ref_count(), 4);
        for r in refs {
            r.release();
        }
        assert_eq!(buffer.release(), 0);
        assert!(driver.borrow().vertex_buffer_size(handle).is_err());
    }

    #[test]
    fn test_double_lock_returns_same_window() {
        let driver = shared_driver();
        let buffer = IndexBufferClass::new(&driver, IndexFormat::U16, 6, BufferUsage::Default).unwrap();
        {
            let mut window = buffer.lock().unwrap();
            window[..2].copy_from_slice(&7u16.to_le_bytes());
        }
        let window = buffer.lock().unwrap();
        assert_eq!(window.len(), 12);
        assert_eq!(&window[..2], &7u16.to_le_bytes());

        // 窗口借用期间驱动被独占
        assert!(buffer.unlock().is_err());
        drop(window);
        buffer.unlock().unwrap();
        assert!(!buffer.is_locked());
        assert_eq!(
            buffer.unlock().unwrap_err(),
            DriverError::state("Index buffer is not locked")
        );
    }

    #[test]
    fn test_write_lock_unlocks_on_drop() {
        let driver = shared_driver();
        let buffer = VertexBufferClass::new(&driver, FVF_UNLIT_VERTEX, 2, BufferUsage::Dynamic).unwrap();
        {
            let mut lock = buffer.write_lock().unwrap();
            assert!(buffer.is_locked());
            lock.fill(0xAB);
        }
        assert!(!buffer.is_locked());
        assert!(driver.borrow_mut().locked_vertex_data(buffer.handle()).is_none());

        let window = buffer.lock().unwrap();
        assert!(window.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_release_while_locked() {
        let driver = shared_driver();
        let buffer = VertexBufferClass::new(&driver, FVF_UNLIT_VERTEX, 2, BufferUsage::Default).unwrap();
        let handle = buffer.handle();
        drop(buffer.lock().unwrap());
        assert!(buffer.is_locked());
        assert_eq!(buffer.release(), 0);
        assert!(driver.borrow().vertex_buffer_size(handle).is_err());
    }
}
