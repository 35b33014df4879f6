//! 驱动类型到 Vulkan 类型的转换
//!
//! 纹理/顶点格式、混合/深度/剔除状态、图元拓扑和错误分类。
//! 全部是纯函数，不依赖设备。

use std::fmt::Debug;
use std::time::Duration;

use vulkano::format::Format;
use vulkano::pipeline::graphics::color_blend::{
    AttachmentBlend, BlendFactor, BlendOp as VkBlendOp, ColorBlendAttachmentState, ColorComponents,
};
use vulkano::pipeline::graphics::depth_stencil::{
    CompareOp, DepthState, DepthStencilState, StencilOp as VkStencilOp, StencilOpState, StencilOps,
    StencilState,
};
use vulkano::pipeline::graphics::input_assembly::PrimitiveTopology;
use vulkano::pipeline::graphics::rasterization::{
    CullMode as VkCullMode, FrontFace, PolygonMode, RasterizationState,
};

use crate::core::error::DriverError;
use crate::gfx::state::{PipelineKey, Topology};
use crate::gfx::types::{
    BlendMode, BlendOp, BlendStateDescriptor, ComparisonFunc, CullMode, DepthStencilStateDescriptor,
    FillMode, StencilOp, TextureFormat, VertexElement, VertexElementType, VertexElementUsage,
};

/// 纹理格式到 Vulkan 格式，`None` 表示没有等价格式
pub fn texture_format(format: TextureFormat) -> Option<Format> {
    let format = match format {
        TextureFormat::A8R8G8B8 | TextureFormat::X8R8G8B8 => Format::B8G8R8A8_UNORM,
        TextureFormat::A8B8G8R8 | TextureFormat::X8B8G8R8 => Format::R8G8B8A8_UNORM,
        TextureFormat::R5G6B5 => Format::R5G6B5_UNORM_PACK16,
        TextureFormat::X1R5G5B5 | TextureFormat::A1R5G5B5 => Format::A1R5G5B5_UNORM_PACK16,
        TextureFormat::A2B10G10R10 => Format::A2B10G10R10_UNORM_PACK32,
        TextureFormat::A2R10G10B10 => Format::A2R10G10B10_UNORM_PACK32,
        TextureFormat::G16R16 => Format::R16G16_UNORM,
        TextureFormat::A16B16G16R16 => Format::R16G16B16A16_UNORM,
        TextureFormat::A8 | TextureFormat::L8 => Format::R8_UNORM,
        TextureFormat::A8L8 => Format::R8G8_UNORM,
        TextureFormat::V8U8 => Format::R8G8_SNORM,
        TextureFormat::Q8W8V8U8 => Format::R8G8B8A8_SNORM,
        TextureFormat::V16U16 => Format::R16G16_SNORM,
        TextureFormat::Dxt1 => Format::BC1_RGBA_UNORM_BLOCK,
        TextureFormat::Dxt2 | TextureFormat::Dxt3 => Format::BC2_UNORM_BLOCK,
        TextureFormat::Dxt4 | TextureFormat::Dxt5 => Format::BC3_UNORM_BLOCK,
        TextureFormat::D16 | TextureFormat::D16Lockable => Format::D16_UNORM,
        TextureFormat::D32 | TextureFormat::D32F => Format::D32_SFLOAT,
        TextureFormat::D24S8
        | TextureFormat::D24X8
        | TextureFormat::D24X4S4
        | TextureFormat::D15S1 => Format::D24_UNORM_S8_UINT,
        TextureFormat::D24FS8 => Format::D32_SFLOAT_S8_UINT,
        // 24 位、调色板、3-3-2 和混合亮度格式没有对应的 Vulkan 格式
        TextureFormat::Unknown
        | TextureFormat::R8G8B8
        | TextureFormat::A4R4G4B4
        | TextureFormat::X4R4G4B4
        | TextureFormat::R3G3B2
        | TextureFormat::A8R3G3B2
        | TextureFormat::P8
        | TextureFormat::A4L4
        | TextureFormat::L6V5U5
        | TextureFormat::X8L8V8U8
        | TextureFormat::Index16
        | TextureFormat::Index32 => return None,
    };
    Some(format)
}

pub fn vertex_format(ty: VertexElementType) -> Format {
    match ty {
        VertexElementType::Float1 => Format::R32_SFLOAT,
        VertexElementType::Float2 => Format::R32G32_SFLOAT,
        VertexElementType::Float3 => Format::R32G32B32_SFLOAT,
        VertexElementType::Float4 => Format::R32G32B32A32_SFLOAT,
        VertexElementType::D3DColor => Format::B8G8R8A8_UNORM,
        VertexElementType::UByte4 => Format::R8G8B8A8_UINT,
        VertexElementType::UByte4N => Format::R8G8B8A8_UNORM,
        VertexElementType::Short2 => Format::R16G16_SINT,
        VertexElementType::Short4 => Format::R16G16B16A16_SINT,
        VertexElementType::Short2N => Format::R16G16_SNORM,
        VertexElementType::Short4N => Format::R16G16B16A16_SNORM,
        VertexElementType::UShort2N => Format::R16G16_UNORM,
        VertexElementType::UShort4N => Format::R16G16B16A16_UNORM,
        VertexElementType::Float16x2 => Format::R16G16_SFLOAT,
        VertexElementType::Float16x4 => Format::R16G16B16A16_SFLOAT,
    }
}

/// 顶点元素在着色器中的 location
///
/// 位置 0、主颜色 1、第一组纹理坐标 2、法线 3，其余语义依次排在后面。
/// 没有约定位置的语义返回 `None`，不进入顶点输入状态。
pub fn attribute_location(element: &VertexElement) -> Option<u32> {
    let index = element.usage_index as u32;
    match element.usage {
        VertexElementUsage::Position | VertexElementUsage::PositionTransformed if index == 0 => Some(0),
        VertexElementUsage::Color if index == 0 => Some(1),
        VertexElementUsage::TexCoord if index == 0 => Some(2),
        VertexElementUsage::Normal if index == 0 => Some(3),
        VertexElementUsage::Color if index == 1 => Some(4),
        VertexElementUsage::TexCoord if index < 8 => Some(4 + index),
        VertexElementUsage::BlendWeight if index == 0 => Some(12),
        VertexElementUsage::BlendIndices if index == 0 => Some(13),
        VertexElementUsage::Tangent if index == 0 => Some(14),
        VertexElementUsage::Binormal if index == 0 => Some(15),
        _ => None,
    }
}

pub fn topology(topology: Topology) -> PrimitiveTopology {
    match topology {
        Topology::PointList => PrimitiveTopology::PointList,
        Topology::LineList => PrimitiveTopology::LineList,
        Topology::LineStrip => PrimitiveTopology::LineStrip,
        Topology::TriangleList => PrimitiveTopology::TriangleList,
        Topology::TriangleStrip => PrimitiveTopology::TriangleStrip,
        Topology::TriangleFan => PrimitiveTopology::TriangleFan,
    }
}

fn compare_op(func: ComparisonFunc) -> CompareOp {
    match func {
        ComparisonFunc::Never => CompareOp::Never,
        ComparisonFunc::Less => CompareOp::Less,
        ComparisonFunc::Equal => CompareOp::Equal,
        ComparisonFunc::LessEqual => CompareOp::LessOrEqual,
        ComparisonFunc::Greater => CompareOp::Greater,
        ComparisonFunc::NotEqual => CompareOp::NotEqual,
        ComparisonFunc::GreaterEqual => CompareOp::GreaterOrEqual,
        ComparisonFunc::Always => CompareOp::Always,
    }
}

fn stencil_op(op: StencilOp) -> VkStencilOp {
    match op {
        StencilOp::Keep => VkStencilOp::Keep,
        StencilOp::Zero => VkStencilOp::Zero,
        StencilOp::Replace => VkStencilOp::Replace,
        StencilOp::IncrSat => VkStencilOp::IncrementAndClamp,
        StencilOp::DecrSat => VkStencilOp::DecrementAndClamp,
        StencilOp::Invert => VkStencilOp::Invert,
        StencilOp::Incr => VkStencilOp::IncrementAndWrap,
        StencilOp::Decr => VkStencilOp::DecrementAndWrap,
    }
}

fn blend_factor(mode: BlendMode) -> BlendFactor {
    match mode {
        BlendMode::Zero => BlendFactor::Zero,
        BlendMode::One => BlendFactor::One,
        BlendMode::SrcColor => BlendFactor::SrcColor,
        BlendMode::InvSrcColor => BlendFactor::OneMinusSrcColor,
        BlendMode::SrcAlpha | BlendMode::BothSrcAlpha => BlendFactor::SrcAlpha,
        BlendMode::InvSrcAlpha | BlendMode::BothInvSrcAlpha => BlendFactor::OneMinusSrcAlpha,
        BlendMode::DstAlpha => BlendFactor::DstAlpha,
        BlendMode::InvDstAlpha => BlendFactor::OneMinusDstAlpha,
        BlendMode::DstColor => BlendFactor::DstColor,
        BlendMode::InvDstColor => BlendFactor::OneMinusDstColor,
        BlendMode::SrcAlphaSat => BlendFactor::SrcAlphaSaturate,
        BlendMode::BlendFactor => BlendFactor::ConstantColor,
        BlendMode::InvBlendFactor => BlendFactor::OneMinusConstantColor,
    }
}

fn blend_op(op: BlendOp) -> VkBlendOp {
    match op {
        BlendOp::Add => VkBlendOp::Add,
        BlendOp::Subtract => VkBlendOp::Subtract,
        BlendOp::RevSubtract => VkBlendOp::ReverseSubtract,
        BlendOp::Min => VkBlendOp::Min,
        BlendOp::Max => VkBlendOp::Max,
    }
}

/// (源因子, 目标因子)
///
/// `BothSrcAlpha` / `BothInvSrcAlpha` 作为源因子时同时决定目标因子。
fn blend_factors(desc: &BlendStateDescriptor) -> (BlendFactor, BlendFactor) {
    match desc.src_blend {
        BlendMode::BothSrcAlpha => (BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha),
        BlendMode::BothInvSrcAlpha => (BlendFactor::OneMinusSrcAlpha, BlendFactor::SrcAlpha),
        src => (blend_factor(src), blend_factor(desc.dst_blend)),
    }
}

/// D3D 颜色写掩码（bit0 红 … bit3 alpha）
pub fn color_components(mask: u8) -> ColorComponents {
    let mut components = ColorComponents::empty();
    for (bit, component) in [
        (0x1, ColorComponents::R),
        (0x2, ColorComponents::G),
        (0x4, ColorComponents::B),
        (0x8, ColorComponents::A),
    ] {
        if mask & bit != 0 {
            components |= component;
        }
    }
    components
}

pub fn color_blend_attachment(key: &PipelineKey) -> ColorBlendAttachmentState {
    let blend = key.blend.enabled.then(|| {
        let (src, dst) = blend_factors(&key.blend);
        let op = blend_op(key.blend.op);
        AttachmentBlend {
            src_color_blend_factor: src,
            dst_color_blend_factor: dst,
            color_blend_op: op,
            src_alpha_blend_factor: src,
            dst_alpha_blend_factor: dst,
            alpha_blend_op: op,
        }
    });
    ColorBlendAttachmentState {
        blend,
        color_write_mask: color_components(key.color_write_mask),
        ..Default::default()
    }
}

pub fn depth_stencil_state(desc: &DepthStencilStateDescriptor) -> DepthStencilState {
    let depth = desc.depth_enable.then(|| DepthState {
        write_enable: desc.depth_write_enable,
        compare_op: compare_op(desc.depth_func),
    });
    let stencil = desc.stencil_enable.then(|| {
        let face = StencilOpState {
            ops: StencilOps {
                fail_op: stencil_op(desc.stencil_fail),
                pass_op: stencil_op(desc.stencil_pass),
                depth_fail_op: stencil_op(desc.stencil_depth_fail),
                compare_op: compare_op(desc.stencil_func),
            },
            compare_mask: desc.stencil_read_mask as u32,
            write_mask: desc.stencil_write_mask as u32,
            reference: 0,
        };
        StencilState {
            front: face,
            back: face,
        }
    });
    DepthStencilState {
        depth,
        stencil,
        ..Default::default()
    }
}

/// 剔除与填充
///
/// D3D 以顺时针为正面：`CounterClockwise` 剔除逆时针面，即 Vulkan 的背面。
/// 设备不支持非实心填充时退回实心。
pub fn rasterization_state(cull: CullMode, fill: FillMode, non_solid_fill: bool) -> RasterizationState {
    let cull_mode = match cull {
        CullMode::None => VkCullMode::None,
        CullMode::Clockwise => VkCullMode::Front,
        CullMode::CounterClockwise => VkCullMode::Back,
    };
    let polygon_mode = match fill {
        FillMode::Solid => PolygonMode::Fill,
        FillMode::Wireframe if non_solid_fill => PolygonMode::Line,
        FillMode::Point if non_solid_fill => PolygonMode::Point,
        FillMode::Wireframe | FillMode::Point => PolygonMode::Fill,
    };
    RasterizationState {
        cull_mode,
        front_face: FrontFace::Clockwise,
        polygon_mode,
        ..Default::default()
    }
}

/// 把 vulkano 错误归入驱动错误分类
pub fn classify<E: Debug>(context: &str, err: E) -> DriverError {
    let text = format!("{err:?}");
    if text.contains("OutOfDate") {
        DriverError::SwapchainLost
    } else if text.contains("DeviceLost") || text.contains("SurfaceLost") {
        DriverError::DeviceLost(format!("{context}: {text}"))
    } else if text.contains("OutOfDeviceMemory") || text.contains("OutOfHostMemory") {
        DriverError::OutOfMemory
    } else {
        DriverError::Backend(format!("{context}: {text}"))
    }
}

/// 带超时的等待失败时区分超时和其他错误
pub fn classify_wait<E: Debug>(context: &str, err: E, timeout: Duration) -> DriverError {
    let text = format!("{err:?}");
    if text.contains("Timeout") || text.contains("NotReady") {
        DriverError::Timeout(timeout.as_millis() as u64)
    } else {
        classify(context, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_formats() {
        assert_eq!(texture_format(TextureFormat::A8R8G8B8), Some(Format::B8G8R8A8_UNORM));
        assert_eq!(texture_format(TextureFormat::Dxt1), Some(Format::BC1_RGBA_UNORM_BLOCK));
        assert_eq!(texture_format(TextureFormat::Dxt5), Some(Format::BC3_UNORM_BLOCK));
        assert_eq!(texture_format(TextureFormat::P8), None);
        assert_eq!(texture_format(TextureFormat::R8G8B8), None);
    }

    #[test]
    fn test_attribute_locations() {
        let mut element = VertexElement::default();
        assert_eq!(attribute_location(&element), Some(0));
        element.usage = VertexElementUsage::TexCoord;
        assert_eq!(attribute_location(&element), Some(2));
        element.usage_index = 3;
        assert_eq!(attribute_location(&element), Some(7));
        element.usage = VertexElementUsage::Fog;
        assert_eq!(attribute_location(&element), None);
    }

    #[test]
    fn test_color_write_mask() {
        assert_eq!(color_components(0xF), ColorComponents::all());
        assert_eq!(color_components(0x0), ColorComponents::empty());
        assert_eq!(color_components(0x9), ColorComponents::R | ColorComponents::A);
    }

    #[test]
    fn test_both_src_alpha_overrides_destination() {
        let desc = BlendStateDescriptor {
            enabled: true,
            src_blend: BlendMode::BothSrcAlpha,
            dst_blend: BlendMode::Zero,
            op: BlendOp::Add,
        };
        assert_eq!(
            blend_factors(&desc),
            (BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha)
        );
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify("acquire", "Error(OutOfDate)"), DriverError::SwapchainLost);
        assert!(matches!(classify("submit", "Error(DeviceLost)"), DriverError::DeviceLost(_)));
        assert_eq!(
            classify_wait("fence", "Timeout", Duration::from_millis(250)),
            DriverError::Timeout(250)
        );
        assert!(matches!(classify("x", "ValidationError"), DriverError::Backend(_)));
    }
}
