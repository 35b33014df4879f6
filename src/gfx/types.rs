//! 驱动接口的数据类型
//!
//! 渲染状态、混合/剔除/填充模式、纹理格式、图元类型、顶点元素以及各种状态描述符。
//! 这些类型与具体后端无关，后端在录制命令时再把它们翻译成自己的枚举。
//!
//! # 设计原则
//!
//! - **数值兼容**：渲染状态的值统一存为 `u64`，枚举值通过 `raw()` / `from_raw()` 往返，
//!   浮点状态（雾距离、点大小）按 D3D 的习惯存放 `f32` 的位模式
//! - **默认值对齐旧接口**：描述符的 `Default` 与固定管线时代的默认状态一致

use serde::{Deserialize, Serialize};

/// 4x4 变换矩阵
pub type Matrix4 = nalgebra::Matrix4<f32>;

/// 三维向量
pub type Vector3 = nalgebra::Vector3<f32>;

/// 定义带显式数值的枚举，并生成 `raw` / `from_raw`
macro_rules! raw_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr,)* }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)*
        }

        impl $name {
            /// 转换为渲染状态缓存中存放的数值
            pub fn raw(self) -> u64 {
                self as u64
            }

            /// 从数值还原，未知数值返回 `None`
            pub fn from_raw(value: u64) -> Option<Self> {
                match value {
                    $(v if v == $value => Some($name::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

/// 图形后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Vulkan（vulkano）
    Vulkan,
    /// OpenGL
    #[serde(alias = "gl")]
    OpenGl,
    /// DirectX 12
    #[serde(alias = "directx12", alias = "d3d12")]
    Dx12,
    /// Metal
    Metal,
    /// 软件/无头后端，不需要 GPU
    #[serde(alias = "headless")]
    Software,
}

impl BackendType {
    /// 所有已知后端，按回退优先级排列
    pub const ALL: [BackendType; 5] = [
        BackendType::Vulkan,
        BackendType::OpenGl,
        BackendType::Dx12,
        BackendType::Metal,
        BackendType::Software,
    ];

    /// 解析后端名称（大小写不敏感，接受常见别名）
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => Some(BackendType::Vulkan),
            "opengl" | "gl" => Some(BackendType::OpenGl),
            "directx12" | "dx12" | "d3d12" => Some(BackendType::Dx12),
            "metal" | "mtl" => Some(BackendType::Metal),
            "software" | "headless" | "null" => Some(BackendType::Software),
            _ => None,
        }
    }

    /// 规范化名称
    pub fn name(&self) -> &'static str {
        match self {
            BackendType::Vulkan => "vulkan",
            BackendType::OpenGl => "opengl",
            BackendType::Dx12 => "directx12",
            BackendType::Metal => "metal",
            BackendType::Software => "software",
        }
    }

    /// 显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendType::Vulkan => "Vulkan",
            BackendType::OpenGl => "OpenGL",
            BackendType::Dx12 => "DirectX 12",
            BackendType::Metal => "Metal",
            BackendType::Software => "Software",
        }
    }
}

/// 渲染状态
///
/// 每个状态在驱动状态缓存中占一个 `u64` 槽位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderState {
    Lighting,
    FogEnable,
    SpecularEnable,
    AlphaBlendEnable,
    SrcBlend,
    DstBlend,
    BlendOp,
    ZEnable,
    ZWriteEnable,
    ZFunc,
    CullMode,
    FillMode,
    Ambient,
    FogStart,
    FogEnd,
    FogDensity,
    FogColor,
    AlphaTestEnable,
    AlphaFunc,
    AlphaRef,
    StencilEnable,
    StencilFunc,
    StencilRef,
    StencilMask,
    StencilWriteMask,
    StencilFail,
    StencilZFail,
    StencilPass,
    TextureFactor,
    DitherEnable,
    NormalizeNormals,
    ClipPlaneEnable,
    ColorWriteEnable,
    PointSize,
    ScissorTestEnable,
}

impl RenderState {
    /// 渲染状态数量
    pub const COUNT: usize = 35;

    /// 全部渲染状态
    pub const ALL: [RenderState; RenderState::COUNT] = [
        RenderState::Lighting,
        RenderState::FogEnable,
        RenderState::SpecularEnable,
        RenderState::AlphaBlendEnable,
        RenderState::SrcBlend,
        RenderState::DstBlend,
        RenderState::BlendOp,
        RenderState::ZEnable,
        RenderState::ZWriteEnable,
        RenderState::ZFunc,
        RenderState::CullMode,
        RenderState::FillMode,
        RenderState::Ambient,
        RenderState::FogStart,
        RenderState::FogEnd,
        RenderState::FogDensity,
        RenderState::FogColor,
        RenderState::AlphaTestEnable,
        RenderState::AlphaFunc,
        RenderState::AlphaRef,
        RenderState::StencilEnable,
        RenderState::StencilFunc,
        RenderState::StencilRef,
        RenderState::StencilMask,
        RenderState::StencilWriteMask,
        RenderState::StencilFail,
        RenderState::StencilZFail,
        RenderState::StencilPass,
        RenderState::TextureFactor,
        RenderState::DitherEnable,
        RenderState::NormalizeNormals,
        RenderState::ClipPlaneEnable,
        RenderState::ColorWriteEnable,
        RenderState::PointSize,
        RenderState::ScissorTestEnable,
    ];

    /// 在状态缓存数组中的下标
    pub fn index(self) -> usize {
        self as usize
    }

    /// 固定管线的默认值
    pub fn default_value(self) -> u64 {
        match self {
            RenderState::Lighting => 1,
            RenderState::SrcBlend => BlendMode::One.raw(),
            RenderState::DstBlend => BlendMode::Zero.raw(),
            RenderState::BlendOp => BlendOp::Add.raw(),
            RenderState::ZEnable | RenderState::ZWriteEnable => 1,
            RenderState::ZFunc => ComparisonFunc::LessEqual.raw(),
            RenderState::CullMode => CullMode::CounterClockwise.raw(),
            RenderState::FillMode => FillMode::Solid.raw(),
            RenderState::FogEnd | RenderState::FogDensity | RenderState::PointSize => {
                float_state(1.0)
            }
            RenderState::AlphaFunc | RenderState::StencilFunc => ComparisonFunc::Always.raw(),
            RenderState::StencilMask | RenderState::StencilWriteMask => 0xFFFF_FFFF,
            RenderState::StencilFail | RenderState::StencilZFail | RenderState::StencilPass => {
                StencilOp::Keep.raw()
            }
            RenderState::TextureFactor => 0xFFFF_FFFF,
            RenderState::ColorWriteEnable => 0xF,
            _ => 0,
        }
    }

    /// 是否影响管线对象（其余状态通过推送常量或动态状态生效）
    pub fn affects_pipeline(self) -> bool {
        matches!(
            self,
            RenderState::AlphaBlendEnable
                | RenderState::SrcBlend
                | RenderState::DstBlend
                | RenderState::BlendOp
                | RenderState::ZEnable
                | RenderState::ZWriteEnable
                | RenderState::ZFunc
                | RenderState::CullMode
                | RenderState::FillMode
                | RenderState::StencilEnable
                | RenderState::StencilFunc
                | RenderState::StencilMask
                | RenderState::StencilWriteMask
                | RenderState::StencilFail
                | RenderState::StencilZFail
                | RenderState::StencilPass
                | RenderState::ColorWriteEnable
        )
    }
}

/// 把浮点渲染状态编码为状态值
pub fn float_state(value: f32) -> u64 {
    value.to_bits() as u64
}

/// 把状态值解码为浮点数
pub fn state_float(value: u64) -> f32 {
    f32::from_bits(value as u32)
}

raw_enum! {
    /// 混合因子
    pub enum BlendMode {
        Zero = 1,
        One = 2,
        SrcColor = 3,
        InvSrcColor = 4,
        SrcAlpha = 5,
        InvSrcAlpha = 6,
        DstAlpha = 7,
        InvDstAlpha = 8,
        DstColor = 9,
        InvDstColor = 10,
        SrcAlphaSat = 11,
        BothSrcAlpha = 12,
        BothInvSrcAlpha = 13,
        BlendFactor = 14,
        InvBlendFactor = 15,
    }
}

raw_enum! {
    /// 混合运算
    pub enum BlendOp {
        Add = 1,
        Subtract = 2,
        RevSubtract = 3,
        Min = 4,
        Max = 5,
    }
}

raw_enum! {
    /// 剔除模式
    pub enum CullMode {
        None = 1,
        Clockwise = 2,
        CounterClockwise = 3,
    }
}

raw_enum! {
    /// 填充模式
    pub enum FillMode {
        Point = 1,
        Wireframe = 2,
        Solid = 3,
    }
}

raw_enum! {
    /// 比较函数
    pub enum ComparisonFunc {
        Never = 1,
        Less = 2,
        Equal = 3,
        LessEqual = 4,
        Greater = 5,
        NotEqual = 6,
        GreaterEqual = 7,
        Always = 8,
    }
}

raw_enum! {
    /// 模板操作
    pub enum StencilOp {
        Keep = 1,
        Zero = 2,
        Replace = 3,
        IncrSat = 4,
        DecrSat = 5,
        Invert = 6,
        Incr = 7,
        Decr = 8,
    }
}

/// 图元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    TriangleFan,
    QuadList,
    QuadStrip,
}

impl PrimitiveType {
    /// 绘制 `primitive_count` 个图元需要的顶点（或索引）数，超出 `u32` 时为 `None`
    pub fn vertex_count(self, primitive_count: u32) -> Option<u32> {
        let n = primitive_count;
        if n == 0 {
            return Some(0);
        }
        match self {
            PrimitiveType::PointList => Some(n),
            PrimitiveType::LineList => n.checked_mul(2),
            PrimitiveType::LineStrip => n.checked_add(1),
            PrimitiveType::TriangleList => n.checked_mul(3),
            PrimitiveType::TriangleStrip | PrimitiveType::TriangleFan => n.checked_add(2),
            PrimitiveType::QuadList => n.checked_mul(4),
            PrimitiveType::QuadStrip => n.checked_mul(2)?.checked_add(2),
        }
    }

    /// `primitive_count` 个图元光栅化出的三角形数
    pub fn triangle_count(self, primitive_count: u32) -> u64 {
        let n = u64::from(primitive_count);
        match self {
            PrimitiveType::PointList | PrimitiveType::LineList | PrimitiveType::LineStrip => 0,
            PrimitiveType::TriangleList
            | PrimitiveType::TriangleStrip
            | PrimitiveType::TriangleFan => n,
            PrimitiveType::QuadList | PrimitiveType::QuadStrip => n * 2,
        }
    }

    /// 排序用的拓扑键
    pub fn sort_key(self) -> u8 {
        self as u8
    }
}

/// 顶点元素数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexElementType {
    Float1,
    Float2,
    Float3,
    Float4,
    D3DColor,
    UByte4,
    Short2,
    Short4,
    UByte4N,
    Short2N,
    Short4N,
    UShort2N,
    UShort4N,
    Float16x2,
    Float16x4,
}

impl VertexElementType {
    /// 元素字节数
    pub fn size(self) -> u32 {
        match self {
            VertexElementType::Float1 => 4,
            VertexElementType::Float2 => 8,
            VertexElementType::Float3 => 12,
            VertexElementType::Float4 => 16,
            VertexElementType::D3DColor
            | VertexElementType::UByte4
            | VertexElementType::UByte4N
            | VertexElementType::Short2
            | VertexElementType::Short2N
            | VertexElementType::UShort2N
            | VertexElementType::Float16x2 => 4,
            VertexElementType::Short4
            | VertexElementType::Short4N
            | VertexElementType::UShort4N
            | VertexElementType::Float16x4 => 8,
        }
    }
}

/// 顶点元素语义
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexElementUsage {
    Position,
    BlendWeight,
    BlendIndices,
    Normal,
    PointSize,
    TexCoord,
    Tangent,
    Binormal,
    PositionTransformed,
    Color,
    Fog,
}

/// 顶点元素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub stream: u16,
    pub offset: u16,
    pub ty: VertexElementType,
    pub usage: VertexElementUsage,
    pub usage_index: u8,
}

impl VertexElement {
    pub fn new(
        stream: u16,
        offset: u16,
        ty: VertexElementType,
        usage: VertexElementUsage,
        usage_index: u8,
    ) -> Self {
        Self { stream, offset, ty, usage, usage_index }
    }
}

impl Default for VertexElement {
    fn default() -> Self {
        Self::new(0, 0, VertexElementType::Float3, VertexElementUsage::Position, 0)
    }
}

/// 计算某个流的顶点跨度
pub fn stream_stride(elements: &[VertexElement], stream: u16) -> u32 {
    elements
        .iter()
        .filter(|e| e.stream == stream)
        .map(|e| e.offset as u32 + e.ty.size())
        .max()
        .unwrap_or(0)
}

/// 纹理格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Unknown,
    R8G8B8,
    A8R8G8B8,
    X8R8G8B8,
    R5G6B5,
    X1R5G5B5,
    A1R5G5B5,
    A4R4G4B4,
    R3G3B2,
    A8,
    A8R3G3B2,
    X4R4G4B4,
    A2B10G10R10,
    A8B8G8R8,
    X8B8G8R8,
    G16R16,
    A2R10G10B10,
    A16B16G16R16,
    P8,
    L8,
    A8L8,
    A4L4,
    V8U8,
    L6V5U5,
    X8L8V8U8,
    Q8W8V8U8,
    V16U16,
    Dxt1,
    Dxt2,
    Dxt3,
    Dxt4,
    Dxt5,
    D16Lockable,
    D16,
    D32,
    D15S1,
    D24S8,
    D24X8,
    D24X4S4,
    D32F,
    D24FS8,
    Index16,
    Index32,
}

/// 索引格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    /// 每个索引的字节数
    pub fn size(self) -> u32 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// 纹理描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: TextureFormat,
    /// 0 表示生成完整的 mip 链
    pub mip_levels: u32,
    pub cube_map: bool,
    pub render_target: bool,
    pub depth_stencil: bool,
    pub dynamic: bool,
}

impl TextureDescriptor {
    /// 二维纹理
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, mip_levels: u32) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels,
            ..Default::default()
        }
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            depth: 1,
            format: TextureFormat::A8R8G8B8,
            mip_levels: 1,
            cube_map: false,
            render_target: false,
            depth_stencil: false,
            dynamic: false,
        }
    }
}

/// 颜色（线性浮点 RGBA）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// 从 D3DCOLOR（0xAARRGGBB）解码
    pub fn from_argb(argb: u32) -> Self {
        let channel = |shift: u32| ((argb >> shift) & 0xFF) as f32 / 255.0;
        Self::new(channel(16), channel(8), channel(0), channel(24))
    }

    /// 编码为 D3DCOLOR（0xAARRGGBB）
    pub fn to_argb(&self) -> u32 {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u32;
        (channel(self.a) << 24) | (channel(self.r) << 16) | (channel(self.g) << 8) | channel(self.b)
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::BLACK
    }
}

/// 视口
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub min_z: f32,
    pub max_z: f32,
}

impl Viewport {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height, min_z: 0.0, max_z: 1.0 }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(0, 0, 800, 600)
    }
}

/// 矩形（右下角不包含）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }

    /// 面积为零或坐标倒置
    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }
}

/// 材质
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub ambient: Color,
    pub diffuse: Color,
    pub specular: Color,
    pub emissive: Color,
    pub shininess: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            ambient: Color::new(0.2, 0.2, 0.2, 1.0),
            diffuse: Color::WHITE,
            specular: Color::new(0.5, 0.5, 0.5, 1.0),
            emissive: Color::BLACK,
            shininess: 32.0,
        }
    }
}

/// 光源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightType {
    Directional,
    Point,
    Spot,
}

/// 光源
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub ty: LightType,
    pub ambient: Color,
    pub diffuse: Color,
    pub specular: Color,
    pub position: Vector3,
    pub direction: Vector3,
    pub range: f32,
    pub falloff: f32,
    pub attenuation: [f32; 3],
    pub theta: f32,
    pub phi: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            ty: LightType::Directional,
            ambient: Color::new(0.1, 0.1, 0.1, 1.0),
            diffuse: Color::WHITE,
            specular: Color::WHITE,
            position: Vector3::zeros(),
            direction: Vector3::new(0.0, -1.0, 0.0),
            range: 1000.0,
            falloff: 1.0,
            attenuation: [1.0, 0.0, 0.0],
            theta: 0.785,
            phi: 1.57,
        }
    }
}

/// 混合状态描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendStateDescriptor {
    pub enabled: bool,
    pub src_blend: BlendMode,
    pub dst_blend: BlendMode,
    pub op: BlendOp,
}

impl Default for BlendStateDescriptor {
    fn default() -> Self {
        Self {
            enabled: false,
            src_blend: BlendMode::One,
            dst_blend: BlendMode::Zero,
            op: BlendOp::Add,
        }
    }
}

/// 深度模板状态描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilStateDescriptor {
    pub depth_enable: bool,
    pub depth_write_enable: bool,
    pub depth_func: ComparisonFunc,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub stencil_func: ComparisonFunc,
    pub stencil_fail: StencilOp,
    pub stencil_depth_fail: StencilOp,
    pub stencil_pass: StencilOp,
}

impl Default for DepthStencilStateDescriptor {
    fn default() -> Self {
        Self {
            depth_enable: true,
            depth_write_enable: true,
            depth_func: ComparisonFunc::LessEqual,
            stencil_enable: false,
            stencil_read_mask: 0xFF,
            stencil_write_mask: 0xFF,
            stencil_func: ComparisonFunc::Always,
            stencil_fail: StencilOp::Keep,
            stencil_depth_fail: StencilOp::Keep,
            stencil_pass: StencilOp::Keep,
        }
    }
}

/// 光栅化状态描述
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerStateDescriptor {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub depth_bias: i32,
    pub slope_scaled_depth_bias: f32,
    pub scissor_enable: bool,
}

impl Default for RasterizerStateDescriptor {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::CounterClockwise,
            depth_bias: 0,
            slope_scaled_depth_bias: 0.0,
            scissor_enable: false,
        }
    }
}

raw_enum! {
    /// 采样器状态（数值与 D3D8 纹理阶段状态一致）
    pub enum SamplerState {
        AddressU = 13,
        AddressV = 14,
        BorderColor = 15,
        MagFilter = 16,
        MinFilter = 17,
        MipFilter = 18,
        MipLodBias = 19,
        MaxMipLevel = 20,
        MaxAnisotropy = 21,
        AddressW = 25,
    }
}

impl SamplerState {
    /// 全部采样器状态
    pub const ALL: [SamplerState; 10] = [
        SamplerState::AddressU,
        SamplerState::AddressV,
        SamplerState::BorderColor,
        SamplerState::MagFilter,
        SamplerState::MinFilter,
        SamplerState::MipFilter,
        SamplerState::MipLodBias,
        SamplerState::MaxMipLevel,
        SamplerState::MaxAnisotropy,
        SamplerState::AddressW,
    ];

    /// 默认值：WRAP 寻址、POINT 过滤、无 mip 过滤、各向异性 1
    pub fn default_value(self) -> u32 {
        match self {
            SamplerState::AddressU | SamplerState::AddressV | SamplerState::AddressW => 1,
            SamplerState::MagFilter | SamplerState::MinFilter => 1,
            SamplerState::MaxAnisotropy => 1,
            _ => 0,
        }
    }
}

/// 变换矩阵类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformType {
    World,
    View,
    Projection,
}
