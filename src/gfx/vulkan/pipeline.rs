//! 图形管线构建
//!
//! 一个 `PipelineKey` 对应一个 vulkano `GraphicsPipeline`。视口和裁剪矩形是动态状态，
//! 每次绘制设置，不进入管线。

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use vulkano::device::Device;
use vulkano::pipeline::graphics::color_blend::ColorBlendState;
use vulkano::pipeline::graphics::input_assembly::InputAssemblyState;
use vulkano::pipeline::graphics::multisample::MultisampleState;
use vulkano::pipeline::graphics::vertex_input::{
    VertexInputAttributeDescription, VertexInputBindingDescription, VertexInputRate,
    VertexInputState,
};
use vulkano::pipeline::graphics::viewport::ViewportState;
use vulkano::pipeline::graphics::GraphicsPipelineCreateInfo;
use vulkano::pipeline::layout::PipelineDescriptorSetLayoutCreateInfo;
use vulkano::pipeline::{
    DynamicState, GraphicsPipeline, PipelineLayout, PipelineShaderStageCreateInfo,
};
use vulkano::render_pass::Subpass;
use vulkano::shader::ShaderModule;

use super::convert::{self, classify};
use crate::core::error::{DriverError, DriverResult};
use crate::gfx::device::FixedFunctionConstants;
use crate::gfx::state::PipelineKey;
use crate::gfx::types::{stream_stride, VertexElement};

/// 编译好的管线
pub struct VulkanPipeline {
    pub(super) id: u64,
    pub(super) pipeline: Arc<GraphicsPipeline>,
    /// (流, 顶点格式声明的跨度)
    pub(super) strides: Vec<(u32, u32)>,
    /// 布局带固定管线推送常量
    pub(super) push_constants: bool,
    /// 描述符集 0 绑定 0 是组合图像采样器
    pub(super) sampled: bool,
}

impl VulkanPipeline {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct PipelineInputs<'a> {
    pub device: &'a Arc<Device>,
    pub subpass: Subpass,
    pub vertex: &'a Arc<ShaderModule>,
    pub fragment: &'a Arc<ShaderModule>,
    pub non_solid_fill: bool,
}

pub fn build(
    id: u64,
    inputs: PipelineInputs<'_>,
    key: &PipelineKey,
    elements: &[VertexElement],
) -> DriverResult<VulkanPipeline> {
    let vs_entry = inputs
        .vertex
        .entry_point("main")
        .ok_or_else(|| DriverError::argument("Vertex shader has no 'main' entry point"))?;
    let fs_entry = inputs
        .fragment
        .entry_point("main")
        .ok_or_else(|| DriverError::argument("Fragment shader has no 'main' entry point"))?;

    let stages = [
        PipelineShaderStageCreateInfo::new(vs_entry),
        PipelineShaderStageCreateInfo::new(fs_entry),
    ];

    let layout = PipelineLayout::new(
        inputs.device.clone(),
        PipelineDescriptorSetLayoutCreateInfo::from_stages(&stages)
            .into_pipeline_layout_create_info(inputs.device.clone())
            .map_err(|e| classify("Failed to create pipeline layout info", e))?,
    )
    .map_err(|e| classify("Failed to create pipeline layout", e))?;

    let constants_size = std::mem::size_of::<FixedFunctionConstants>() as u32;
    let push_constants = layout
        .push_constant_ranges()
        .iter()
        .any(|range| range.offset == 0 && range.size >= constants_size);
    let sampled = layout
        .set_layouts()
        .first()
        .map(|set| set.bindings().contains_key(&0))
        .unwrap_or(false);

    let (vertex_input_state, strides) = vertex_input_state(elements);

    let pipeline = GraphicsPipeline::new(
        inputs.device.clone(),
        None,
        GraphicsPipelineCreateInfo {
            stages: stages.into_iter().collect(),
            vertex_input_state: Some(vertex_input_state),
            input_assembly_state: Some(InputAssemblyState {
                topology: convert::topology(key.topology),
                ..Default::default()
            }),
            viewport_state: Some(ViewportState::default()),
            rasterization_state: Some(convert::rasterization_state(
                key.cull_mode,
                key.fill_mode,
                inputs.non_solid_fill,
            )),
            depth_stencil_state: Some(convert::depth_stencil_state(&key.depth_stencil)),
            multisample_state: Some(MultisampleState::default()),
            color_blend_state: Some(ColorBlendState::with_attachment_states(
                1,
                convert::color_blend_attachment(key),
            )),
            dynamic_state: [DynamicState::Viewport, DynamicState::Scissor]
                .into_iter()
                .collect(),
            subpass: Some(inputs.subpass.into()),
            ..GraphicsPipelineCreateInfo::layout(layout)
        },
    )
    .map_err(|e| classify("Failed to create graphics pipeline", e))?;

    debug!(
        id,
        topology = ?key.topology,
        push_constants,
        sampled,
        "Graphics pipeline created"
    );

    Ok(VulkanPipeline {
        id,
        pipeline,
        strides,
        push_constants,
        sampled,
    })
}

/// 流 0 逐顶点，其他流逐实例
///
/// 重复 location 的元素只保留第一个。
fn vertex_input_state(elements: &[VertexElement]) -> (VertexInputState, Vec<(u32, u32)>) {
    let mut streams: Vec<u16> = elements.iter().map(|e| e.stream).collect();
    streams.sort_unstable();
    streams.dedup();

    let mut state = VertexInputState::new();
    let mut strides = Vec::with_capacity(streams.len());
    for stream in streams {
        let stride = stream_stride(elements, stream);
        let input_rate = if stream == 0 {
            VertexInputRate::Vertex
        } else {
            VertexInputRate::Instance { divisor: 1 }
        };
        state = state.binding(stream as u32, VertexInputBindingDescription { stride, input_rate });
        strides.push((stream as u32, stride));
    }

    let mut used = HashSet::new();
    for element in elements {
        let Some(location) = convert::attribute_location(element) else {
            continue;
        };
        if !used.insert(location) {
            continue;
        }
        state = state.attribute(
            location,
            VertexInputAttributeDescription {
                binding: element.stream as u32,
                format: convert::vertex_format(element.ty),
                offset: element.offset as u32,
            },
        );
    }
    (state, strides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::types::{VertexElementType, VertexElementUsage};

    #[test]
    fn test_instance_stream_strides() {
        let elements = [
            VertexElement::default(),
            VertexElement::new(0, 12, VertexElementType::D3DColor, VertexElementUsage::Color, 0),
            VertexElement::new(1, 0, VertexElementType::Float4, VertexElementUsage::TexCoord, 1),
            VertexElement::new(1, 16, VertexElementType::Float4, VertexElementUsage::TexCoord, 2),
        ];
        let (_, strides) = vertex_input_state(&elements);
        assert_eq!(strides, vec![(0, 16), (1, 32)]);
    }

    #[test]
    fn test_duplicate_locations_skipped() {
        let elements = [
            VertexElement::default(),
            VertexElement::new(0, 12, VertexElementType::Float3, VertexElementUsage::Position, 0),
        ];
        let (state, _) = vertex_input_state(&elements);
        assert_eq!(state.attributes.len(), 1);
        assert_eq!(state.attributes[&0].offset, 0);
    }
}
