//! 旧式调用面的兼容层
//!
//! 让按 D3D8 习惯编写的代码跑在驱动接口上：
//!
//! - `fvf`：灵活顶点格式解码为跨度和顶点元素
//! - `buffer`：带引用计数和作用域写锁的顶点/索引缓冲区类
//! - `texture`：内存表面和 mip 链纹理，锁定规则与 D3D8 一致
//! - `device`：设备方法表桩，返回 HRESULT 风格的结果码

pub mod buffer;
pub mod device;
pub mod fvf;
pub mod texture;

pub use buffer::{
    BufferUsage, IndexBufferClass, IndexWriteLock, VertexBufferClass, VertexWriteLock, WriteLock,
};
pub use device::{hresult, HResult, LegacyDevice, D3DERR_INVALIDCALL, D3D_OK};
pub use texture::{LockedRect, MemorySurface, MemoryTexture, Pool, SurfaceDesc};
