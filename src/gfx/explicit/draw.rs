//! 绘制路径
//!
//! 每次绘制：校验帧状态和范围，按当前状态生成管线键并懒惰地创建/绑定管线，
//! 把句柄解析为设备对象组装 `DrawCall`，交给设备录制到当前槽位的命令缓冲区。

use tracing::{debug, trace, warn};

use super::{ExplicitDriver, Retired};
use crate::core::error::{DriverError, DriverResult};
use crate::gfx::device::{
    BufferKind, DeviceBackend, DrawCall, DrawParams, FixedFunctionConstants, IndexBinding,
    VertexBinding, WriteOutcome,
};
use crate::gfx::handle::{Handle, HandleTable, RenderTargetHandle, TextureHandle};
use crate::gfx::state::{DriverStateCache, PipelineKey, MAX_TEXTURE_STAGES};
use crate::gfx::types::{stream_stride, Color, IndexFormat, PrimitiveType, Rect, RenderState};

use super::resources::{SurfaceEntry, TextureEntry};

/// 绘制范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct DrawRange {
    indexed: bool,
    start_vertex: u32,
    base_vertex: i32,
    start_index: u32,
    primitive_count: u32,
    instance_count: u32,
    first_instance: u32,
}

impl DrawRange {
    pub fn vertices(start_vertex: u32, primitive_count: u32) -> Self {
        Self {
            indexed: false,
            start_vertex,
            base_vertex: 0,
            start_index: 0,
            primitive_count,
            instance_count: 1,
            first_instance: 0,
        }
    }

    pub fn indices(base_vertex: i32, start_index: u32, primitive_count: u32) -> Self {
        Self {
            indexed: true,
            base_vertex,
            start_index,
            ..Self::vertices(0, primitive_count)
        }
    }

    pub fn instanced(self, instance_count: u32, first_instance: u32) -> Self {
        Self {
            instance_count,
            first_instance,
            ..self
        }
    }
}

/// 用户内存中的顶点
pub(super) struct UserVertices<'a> {
    pub data: &'a [u8],
    pub stride: u32,
    /// 索引绘制时引用的最小顶点索引
    pub min_index: u32,
    /// 索引绘制时引用的顶点数
    pub count: u32,
}

/// 固定管线推送常量
fn fixed_function_constants(state: &DriverStateCache) -> FixedFunctionConstants {
    let diffuse = if state.render_state(RenderState::Lighting) != 0 {
        state.material().diffuse
    } else {
        Color::WHITE
    };
    FixedFunctionConstants {
        world_view_projection: state.world_view_projection().into(),
        diffuse: diffuse.to_array(),
    }
}

/// 解析采样器阶段和 0 号渲染目标绑定的图像
fn bound_images<'a, I>(
    state: &DriverStateCache,
    textures: &'a HandleTable<TextureHandle, TextureEntry<I>>,
    render_targets: &'a HandleTable<RenderTargetHandle, SurfaceEntry<I>>,
) -> DriverResult<(Vec<(u32, &'a I)>, Option<&'a I>)> {
    let mut images = Vec::new();
    for stage in 0..MAX_TEXTURE_STAGES {
        let handle = state.texture(stage);
        if handle.is_valid() {
            images.push((stage as u32, &textures.get(handle)?.image));
        }
    }
    let target = state.render_target(0);
    let target = if target.is_valid() {
        Some(&render_targets.get(target)?.image)
    } else {
        None
    };
    Ok((images, target))
}

fn scissor(state: &DriverStateCache) -> Option<Rect> {
    let rect = state.scissor();
    (state.render_state(RenderState::ScissorTestEnable) != 0 && !rect.is_empty()).then_some(rect)
}

impl<D: DeviceBackend> ExplicitDriver<D> {
    /// 图元数换算成顶点（或索引）数，受设备的 `max_primitive_count` 限制
    fn element_count(&self, primitive: PrimitiveType, primitive_count: u32) -> DriverResult<u32> {
        if primitive_count == 0 {
            return Err(DriverError::argument("Primitive count must be non-zero"));
        }
        let limit = self.device.capabilities().max_primitive_count;
        if primitive_count > limit {
            return Err(DriverError::argument(format!(
                "Primitive count {primitive_count} exceeds device limit {limit}"
            )));
        }
        primitive.vertex_count(primitive_count).ok_or_else(|| {
            DriverError::argument(format!(
                "{primitive_count} {primitive:?} primitives overflow the vertex count"
            ))
        })
    }

    /// 生成管线键，缓存中没有时创建，与已绑定管线不同时标记为已绑定
    fn prepare_pipeline(&mut self, primitive: PrimitiveType) -> DriverResult<PipelineKey> {
        let key = self.state.pipeline_key(primitive);
        if !key.vertex_format.is_valid() {
            warn!(?primitive, "Draw skipped: no vertex format set");
            return Err(DriverError::state("No vertex format set"));
        }

        if !self.pipelines.contains_key(&key) {
            let elements = self.vertex_formats.get(key.vertex_format)?;
            let shader = if key.shader.is_valid() {
                Some(self.shaders.get(key.shader)?)
            } else {
                None
            };
            let pipeline = match self.device.create_pipeline(&key, elements, shader) {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    warn!(error = %err, "Draw skipped: pipeline creation failed");
                    return Err(err);
                }
            };
            debug!(topology = ?key.topology, cached = self.pipelines.len() + 1, "Pipeline created");
            self.pipelines.insert(key, pipeline);
        }

        if self.state.needs_pipeline(&key) {
            trace!(topology = ?key.topology, "Pipeline bound");
            self.state.mark_pipeline_bound(key);
        }
        Ok(key)
    }

    pub(super) fn draw_impl(&mut self, primitive: PrimitiveType, range: DrawRange) -> DriverResult<()> {
        self.ensure_initialized()?;
        let slot = self.recording_slot()?;
        if range.instance_count == 0 {
            return Err(DriverError::argument("Instance count must be non-zero"));
        }
        let element_count = self.element_count(primitive, range.primitive_count)?;
        let key = self.prepare_pipeline(primitive)?;

        let elements = self.vertex_formats.get(key.vertex_format)?;
        let stream0 = self.state.streams()[0];
        if !stream0.buffer.is_valid() {
            return Err(DriverError::state("No vertex buffer bound to stream 0"));
        }

        let mut vertex_buffers = Vec::new();
        for (stream, source) in self.state.streams().iter().enumerate() {
            if !source.buffer.is_valid() {
                continue;
            }
            let entry = self.vertex_buffers.get(source.buffer)?;
            let stride = if source.stride == 0 {
                stream_stride(elements, stream as u16)
            } else {
                source.stride
            };
            // 非索引绘制可以直接校验 0 号流的范围
            if stream == 0 && !range.indexed {
                let needed = source.offset as u64
                    + (range.start_vertex as u64 + element_count as u64) * stride as u64;
                if needed > entry.shadow.len() as u64 {
                    return Err(DriverError::argument(format!(
                        "Draw needs {needed} bytes of vertex data, buffer has {}",
                        entry.shadow.len()
                    )));
                }
            }
            vertex_buffers.push(VertexBinding {
                stream: stream as u32,
                buffer: &entry.buffer,
                offset: source.offset as u64,
                stride,
            });
        }

        let mut first_index = 0;
        let index_buffer = if range.indexed {
            let (handle, base_index) = self.state.index_buffer();
            if !handle.is_valid() {
                return Err(DriverError::state("No index buffer bound"));
            }
            let entry = self.index_buffers.get(handle)?;
            let format = entry.format.unwrap_or(IndexFormat::U16);
            let available = entry.shadow.len() as u64 / format.size() as u64;
            first_index = range.start_index.checked_add(base_index).ok_or_else(|| {
                DriverError::argument(format!(
                    "Start index {} plus base index {base_index} overflows",
                    range.start_index
                ))
            })?;
            if first_index as u64 + element_count as u64 > available {
                return Err(DriverError::argument(format!(
                    "Draw reads indices {first_index}..{} of {available}",
                    first_index as u64 + element_count as u64
                )));
            }
            Some(IndexBinding {
                buffer: &entry.buffer,
                offset: 0,
                format,
            })
        } else {
            None
        };

        let (textures, render_target) =
            bound_images(&self.state, &self.textures, &self.render_targets)?;
        let pipeline = self
            .pipelines
            .get(&key)
            .ok_or_else(|| DriverError::Backend("Pipeline cache miss after creation".into()))?;

        let call = DrawCall {
            pipeline,
            vertex_buffers,
            index_buffer,
            textures,
            render_target,
            constants: fixed_function_constants(&self.state),
            viewport: self.state.viewport(),
            scissor: scissor(&self.state),
            params: DrawParams {
                topology: key.topology,
                element_count,
                instance_count: range.instance_count,
                first_vertex: range.start_vertex,
                first_index,
                vertex_offset: range.base_vertex,
                first_instance: range.first_instance,
                indexed: range.indexed,
            },
        };
        self.device.draw(slot, &call)
    }

    /// 把用户数据复制到临时缓冲区，绘制后随当前帧延迟释放
    pub(super) fn draw_user_impl(
        &mut self,
        primitive: PrimitiveType,
        primitive_count: u32,
        vertices: UserVertices<'_>,
        indices: Option<(&[u8], IndexFormat)>,
    ) -> DriverResult<()> {
        self.ensure_initialized()?;
        let slot = self.recording_slot()?;
        if vertices.stride == 0 {
            return Err(DriverError::argument("Vertex stride must be non-zero"));
        }

        let element_count = self.element_count(primitive, primitive_count)?;
        let vertex_bytes = match indices {
            Some(_) => (vertices.min_index as usize + vertices.count as usize) * vertices.stride as usize,
            None => element_count as usize * vertices.stride as usize,
        };
        if vertex_bytes == 0 || vertices.data.len() < vertex_bytes {
            return Err(DriverError::argument(format!(
                "Vertex data has {} bytes, draw needs {vertex_bytes}",
                vertices.data.len()
            )));
        }
        if let Some((data, format)) = indices {
            let index_bytes = element_count as usize * format.size() as usize;
            if data.len() < index_bytes {
                return Err(DriverError::argument(format!(
                    "Index data has {} bytes, draw needs {index_bytes}",
                    data.len()
                )));
            }
        }

        let key = self.prepare_pipeline(primitive)?;

        let vertex_buffer = self.stage_user_data(BufferKind::Vertex, &vertices.data[..vertex_bytes])?;
        let index_buffer = match indices {
            Some((data, format)) => {
                let bytes = element_count as usize * format.size() as usize;
                match self.stage_user_data(BufferKind::Index, &data[..bytes]) {
                    Ok(buffer) => Some((buffer, format)),
                    Err(err) => {
                        self.retire(Retired::Buffer(vertex_buffer));
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        let result = {
            let (textures, render_target) =
                bound_images(&self.state, &self.textures, &self.render_targets)?;
            let pipeline = self
                .pipelines
                .get(&key)
                .ok_or_else(|| DriverError::Backend("Pipeline cache miss after creation".into()))?;
            let call = DrawCall {
                pipeline,
                vertex_buffers: vec![VertexBinding {
                    stream: 0,
                    buffer: &vertex_buffer,
                    offset: 0,
                    stride: vertices.stride,
                }],
                index_buffer: index_buffer.as_ref().map(|(buffer, format)| IndexBinding {
                    buffer,
                    offset: 0,
                    format: *format,
                }),
                textures,
                render_target,
                constants: fixed_function_constants(&self.state),
                viewport: self.state.viewport(),
                scissor: scissor(&self.state),
                params: DrawParams {
                    topology: key.topology,
                    element_count,
                    instance_count: 1,
                    first_vertex: 0,
                    first_index: 0,
                    vertex_offset: 0,
                    first_instance: 0,
                    indexed: index_buffer.is_some(),
                },
            };
            self.device.draw(slot, &call)
        };

        self.retire(Retired::Buffer(vertex_buffer));
        if let Some((buffer, _)) = index_buffer {
            self.retire(Retired::Buffer(buffer));
        }
        result
    }

    fn stage_user_data(&mut self, kind: BufferKind, data: &[u8]) -> DriverResult<D::Buffer> {
        let buffer = self.device.create_buffer(kind, data.len())?;
        match self.device.write_buffer(&buffer, 0, data)? {
            WriteOutcome::Written => Ok(buffer),
            WriteOutcome::Busy => Err(DriverError::Backend(
                "Transient buffer reported busy".into(),
            )),
        }
    }
}
