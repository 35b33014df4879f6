//! D3D8 灵活顶点格式（FVF）解码
//!
//! FVF 位域描述 0 号流中各分量的顺序：位置 → 混合权重 → 法线 → 点大小 →
//! 漫反射 → 高光 → 纹理坐标。解码结果是顶点跨度和一组驱动顶点元素。
//!
//! 纹理坐标维数按 D3D8 的编码：每组 2 位，从第 16 位开始，
//! `0` 为二维，`1` 为三维，`2` 为四维，`3` 为一维。

use crate::gfx::types::{VertexElement, VertexElementType, VertexElementUsage};

pub const D3DFVF_POSITION_MASK: u32 = 0x00E;
pub const D3DFVF_XYZ: u32 = 0x002;
pub const D3DFVF_XYZRHW: u32 = 0x004;
pub const D3DFVF_XYZB1: u32 = 0x006;
pub const D3DFVF_XYZB2: u32 = 0x008;
pub const D3DFVF_XYZB3: u32 = 0x00A;
pub const D3DFVF_XYZB4: u32 = 0x00C;
pub const D3DFVF_XYZB5: u32 = 0x00E;
pub const D3DFVF_NORMAL: u32 = 0x010;
pub const D3DFVF_PSIZE: u32 = 0x020;
pub const D3DFVF_DIFFUSE: u32 = 0x040;
pub const D3DFVF_SPECULAR: u32 = 0x080;
pub const D3DFVF_TEXCOUNT_MASK: u32 = 0xF00;
pub const D3DFVF_TEXCOUNT_SHIFT: u32 = 8;
pub const D3DFVF_LASTBETA_UBYTE4: u32 = 0x1000;

pub const D3DFVF_TEX1: u32 = 0x100;
pub const D3DFVF_TEX2: u32 = 0x200;

pub const MAX_TEXCOORD_SETS: u32 = 8;

pub const fn texcoord_size1(set: u32) -> u32 {
    3 << (set * 2 + 16)
}

pub const fn texcoord_size2(_set: u32) -> u32 {
    0
}

pub const fn texcoord_size3(set: u32) -> u32 {
    1 << (set * 2 + 16)
}

pub const fn texcoord_size4(set: u32) -> u32 {
    2 << (set * 2 + 16)
}

/// 未变换、带漫反射和一组纹理坐标的常用格式
pub const FVF_UNLIT_VERTEX: u32 = D3DFVF_XYZ | D3DFVF_DIFFUSE | D3DFVF_TEX1;
/// 屏幕空间顶点
pub const FVF_TL_VERTEX: u32 = D3DFVF_XYZRHW | D3DFVF_DIFFUSE | D3DFVF_SPECULAR | D3DFVF_TEX1;

/// 第 `set` 组纹理坐标的分量数
pub fn texcoord_components(fvf: u32, set: u32) -> u32 {
    match (fvf >> (set * 2 + 16)) & 0x3 {
        0 => 2,
        1 => 3,
        2 => 4,
        _ => 1,
    }
}

/// 纹理坐标组数，超过 8 组时截断
pub fn texcoord_count(fvf: u32) -> u32 {
    ((fvf & D3DFVF_TEXCOUNT_MASK) >> D3DFVF_TEXCOUNT_SHIFT).min(MAX_TEXCOORD_SETS)
}

/// 混合权重个数（XYZB1..XYZB5），包括作为索引的最后一个
fn beta_count(fvf: u32) -> u32 {
    match fvf & D3DFVF_POSITION_MASK {
        D3DFVF_XYZB1 => 1,
        D3DFVF_XYZB2 => 2,
        D3DFVF_XYZB3 => 3,
        D3DFVF_XYZB4 => 4,
        D3DFVF_XYZB5 => 5,
        _ => 0,
    }
}

fn float_type(components: u32) -> VertexElementType {
    match components {
        1 => VertexElementType::Float1,
        2 => VertexElementType::Float2,
        3 => VertexElementType::Float3,
        _ => VertexElementType::Float4,
    }
}

/// FVF 对应的顶点元素，全部在 0 号流
pub fn vertex_elements(fvf: u32) -> Vec<VertexElement> {
    let mut elements = Vec::new();
    let mut offset = 0u16;
    let mut push = |ty: VertexElementType, usage: VertexElementUsage, index: u8| {
        elements.push(VertexElement::new(0, offset, ty, usage, index));
        offset += ty.size() as u16;
    };

    match fvf & D3DFVF_POSITION_MASK {
        0 => {}
        D3DFVF_XYZRHW => push(VertexElementType::Float4, VertexElementUsage::PositionTransformed, 0),
        _ => push(VertexElementType::Float3, VertexElementUsage::Position, 0),
    }

    let betas = beta_count(fvf);
    if betas > 0 {
        let indexed = fvf & D3DFVF_LASTBETA_UBYTE4 != 0;
        let weights = if indexed { betas - 1 } else { betas };
        if weights > 0 {
            push(float_type(weights.min(4)), VertexElementUsage::BlendWeight, 0);
            if weights > 4 {
                push(VertexElementType::Float1, VertexElementUsage::BlendWeight, 1);
            }
        }
        if indexed {
            push(VertexElementType::UByte4, VertexElementUsage::BlendIndices, 0);
        }
    }

    if fvf & D3DFVF_NORMAL != 0 {
        push(VertexElementType::Float3, VertexElementUsage::Normal, 0);
    }
    if fvf & D3DFVF_PSIZE != 0 {
        push(VertexElementType::Float1, VertexElementUsage::PointSize, 0);
    }
    if fvf & D3DFVF_DIFFUSE != 0 {
        push(VertexElementType::D3DColor, VertexElementUsage::Color, 0);
    }
    if fvf & D3DFVF_SPECULAR != 0 {
        push(VertexElementType::D3DColor, VertexElementUsage::Color, 1);
    }
    for set in 0..texcoord_count(fvf) {
        push(
            float_type(texcoord_components(fvf, set)),
            VertexElementUsage::TexCoord,
            set as u8,
        );
    }

    elements
}

/// 顶点跨度（字节）
pub fn vertex_size(fvf: u32) -> u32 {
    vertex_elements(fvf).iter().map(|e| e.ty.size()).sum()
}
