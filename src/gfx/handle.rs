//! 资源句柄
//!
//! 驱动边界上只传递不透明的整数句柄，不传递指针。每种资源有独立的句柄命名空间，
//! 句柄由 `slotmap` 的键实现：低 32 位是槽位索引，高 32 位是代数（generation）。
//! 槽位被复用后代数会变化，所以已销毁的旧句柄不会指向新的资源，只会被拒绝。
//!
//! 原始整数形式中 `0` 是无效哨兵值（`Handle::invalid()`）。

use slotmap::{Key, KeyData, SlotMap};

use crate::core::error::{DriverError, DriverResult};

/// 所有句柄类型的公共接口
pub trait Handle: Key {
    /// 资源种类名称，用于错误消息
    const KIND: &'static str;

    /// 无效哨兵值
    fn invalid() -> Self {
        Self::null()
    }

    /// 是否不是哨兵值（不代表资源仍然存活）
    fn is_valid(&self) -> bool {
        !self.is_null()
    }

    /// 转换为不透明的 64 位整数，哨兵值为 0
    fn to_raw(&self) -> u64 {
        if self.is_null() {
            0
        } else {
            self.data().as_ffi()
        }
    }

    /// 从不透明整数还原句柄，0 还原为哨兵值
    fn from_raw(raw: u64) -> Self {
        if raw == 0 {
            Self::null()
        } else {
            KeyData::from_ffi(raw).into()
        }
    }

    /// 构造“无效句柄”错误
    fn invalid_error(&self) -> DriverError {
        DriverError::InvalidHandle {
            kind: Self::KIND,
            raw: self.to_raw(),
        }
    }
}

macro_rules! define_handles {
    ($($(#[$meta:meta])* $name:ident => $kind:literal;)*) => {
        $(
            slotmap::new_key_type! {
                $(#[$meta])*
                pub struct $name;
            }

            impl Handle for $name {
                const KIND: &'static str = $kind;
            }
        )*
    };
}

define_handles! {
    /// 顶点缓冲区
    VertexBufferHandle => "vertex buffer";
    /// 索引缓冲区
    IndexBufferHandle => "index buffer";
    /// 纹理
    TextureHandle => "texture";
    /// 渲染目标
    RenderTargetHandle => "render target";
    /// 深度模板缓冲区
    DepthStencilHandle => "depth stencil";
    /// 顶点格式
    VertexFormatHandle => "vertex format";
    /// 着色器程序（顶点 + 片元）
    ShaderHandle => "shader program";
    /// 绘制批次
    BatchHandle => "batch";
    /// 实例化上下文
    InstancingHandle => "instancing context";
    /// 多 Pass 描述
    RenderPassHandle => "render pass";
    /// 渲染状态块
    StateBlockHandle => "state block";
}

/// 按句柄寻址的资源表
///
/// `SlotMap` 的薄封装，查找失败时返回 `DriverError::InvalidHandle`。
pub struct HandleTable<K: Handle, V> {
    slots: SlotMap<K, V>,
}

impl<K: Handle, V> HandleTable<K, V> {
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, value: V) -> K {
        self.slots.insert(value)
    }

    pub fn get(&self, handle: K) -> DriverResult<&V> {
        self.slots.get(handle).ok_or_else(|| handle.invalid_error())
    }

    pub fn get_mut(&mut self, handle: K) -> DriverResult<&mut V> {
        self.slots.get_mut(handle).ok_or_else(|| handle.invalid_error())
    }

    pub fn remove(&mut self, handle: K) -> DriverResult<V> {
        self.slots.remove(handle).ok_or_else(|| handle.invalid_error())
    }

    pub fn contains(&self, handle: K) -> bool {
        self.slots.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> {
        self.slots.iter_mut()
    }

    /// 取出全部条目，句柄随之失效
    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        self.slots.drain()
    }
}

impl<K: Handle, V> Default for HandleTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_sentinel() {
        let handle = TextureHandle::invalid();
        assert!(!handle.is_valid());
        assert_eq!(handle.to_raw(), 0);
        assert_eq!(TextureHandle::from_raw(0), handle);
    }

    #[test]
    fn test_raw_round_trip() {
        let mut table: HandleTable<VertexBufferHandle, u32> = HandleTable::new();
        let handle = table.insert(7);
        let raw = handle.to_raw();
        assert_ne!(raw, 0);
        let restored = VertexBufferHandle::from_raw(raw);
        assert_eq!(restored, handle);
        assert_eq!(*table.get(restored).unwrap(), 7);
    }

    #[test]
    fn test_stale_handle_rejected_after_slot_reuse() {
        let mut table: HandleTable<IndexBufferHandle, &str> = HandleTable::new();
        let first = table.insert("first");
        table.remove(first).unwrap();

        // 同一槽位被复用，但代数不同
        let second = table.insert("second");
        assert_ne!(first, second);
        assert_eq!(first.to_raw() & 0xffff_ffff, second.to_raw() & 0xffff_ffff);

        assert_eq!(
            table.get(first).unwrap_err(),
            DriverError::InvalidHandle { kind: "index buffer", raw: first.to_raw() }
        );
        assert_eq!(*table.get(second).unwrap(), "second");
    }

    #[test]
    fn test_invalid_handle_lookup() {
        let table: HandleTable<BatchHandle, ()> = HandleTable::new();
        assert!(table.get(BatchHandle::invalid()).is_err());
        assert!(table.get(BatchHandle::from_raw(0xdead_0000_0001)).is_err());
    }
}
