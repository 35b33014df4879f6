//! 纹理格式计算
//!
//! 每像素字节数、块压缩格式（DXT）的行距和大小、mip 链尺寸。
//! 内存纹理和驱动的纹理锁定都依赖这里的结果，两者必须一致。

use super::types::TextureFormat;

/// 格式属性
pub trait FormatInfo {
    /// 每像素字节数，块压缩格式返回 0
    fn bytes_per_pixel(self) -> u32;

    /// 是否为 4x4 块压缩格式
    fn is_compressed(self) -> bool;

    /// 每个 4x4 块的字节数，非压缩格式返回 0
    fn block_bytes(self) -> u32;

    /// 是否为深度/模板格式
    fn is_depth(self) -> bool;

    /// 是否带模板位
    fn has_stencil(self) -> bool;
}

impl FormatInfo for TextureFormat {
    fn bytes_per_pixel(self) -> u32 {
        use TextureFormat::*;
        match self {
            A16B16G16R16 => 8,
            A8R8G8B8 | X8R8G8B8 | A8B8G8R8 | X8B8G8R8 | A2B10G10R10 | A2R10G10B10 | G16R16
            | X8L8V8U8 | Q8W8V8U8 | V16U16 | D32 | D24S8 | D24X8 | D24X4S4 | D32F | D24FS8
            | Index32 => 4,
            R8G8B8 => 3,
            R5G6B5 | X1R5G5B5 | A1R5G5B5 | A4R4G4B4 | X4R4G4B4 | A8R3G3B2 | A8L8 | V8U8
            | L6V5U5 | D16 | D16Lockable | D15S1 | Index16 => 2,
            A8 | L8 | P8 | R3G3B2 | A4L4 => 1,
            Dxt1 | Dxt2 | Dxt3 | Dxt4 | Dxt5 => 0,
            Unknown => 4,
        }
    }

    fn is_compressed(self) -> bool {
        self.block_bytes() != 0
    }

    fn block_bytes(self) -> u32 {
        match self {
            TextureFormat::Dxt1 => 8,
            TextureFormat::Dxt2 | TextureFormat::Dxt3 | TextureFormat::Dxt4 | TextureFormat::Dxt5 => 16,
            _ => 0,
        }
    }

    fn is_depth(self) -> bool {
        use TextureFormat::*;
        matches!(self, D16Lockable | D16 | D32 | D15S1 | D24S8 | D24X8 | D24X4S4 | D32F | D24FS8)
    }

    fn has_stencil(self) -> bool {
        use TextureFormat::*;
        matches!(self, D15S1 | D24S8 | D24X4S4 | D24FS8)
    }
}

/// 一行（压缩格式为一行块）的字节数
pub fn row_pitch(format: TextureFormat, width: u32) -> u32 {
    if format.is_compressed() {
        blocks(width) * format.block_bytes()
    } else {
        width.max(1) * format.bytes_per_pixel()
    }
}

/// 行数（压缩格式为块行数）
pub fn row_count(format: TextureFormat, height: u32) -> u32 {
    if format.is_compressed() {
        blocks(height)
    } else {
        height.max(1)
    }
}

/// 单个 mip 层的字节数
pub fn level_size(format: TextureFormat, width: u32, height: u32) -> usize {
    row_pitch(format, width) as usize * row_count(format, height) as usize
}

/// 完整 mip 链的层数（直到 1x1）
pub fn full_mip_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// 解析请求的 mip 层数，0 表示完整链，超出完整链时截断
pub fn resolve_mip_count(width: u32, height: u32, requested: u32) -> u32 {
    let full = full_mip_count(width, height);
    if requested == 0 {
        full
    } else {
        requested.min(full)
    }
}

/// 第 `level` 层的尺寸
pub fn mip_extent(width: u32, height: u32, level: u32) -> (u32, u32) {
    let shift = level.min(31);
    ((width >> shift).max(1), (height >> shift).max(1))
}

/// 4x4 块数量（向上取整）
fn blocks(extent: u32) -> u32 {
    extent.max(1).div_ceil(4)
}

/// 整条 mip 链的总字节数
pub fn chain_size(format: TextureFormat, width: u32, height: u32, levels: u32) -> usize {
    (0..levels)
        .map(|level| {
            let (w, h) = mip_extent(width, height, level);
            level_size(format, w, h)
        })
        .sum()
}
