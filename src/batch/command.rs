//! 绘制命令
//!
//! 命令追加进批次后不可修改。统计量（顶点数、三角形数）在追加时算好，
//! 重放和排序都不会改变它们。

use crate::core::error::{DriverError, DriverResult};
use crate::gfx::driver::MAX_PRIMITIVE_COUNT;
use crate::gfx::handle::{
    Handle, InstancingHandle, ShaderHandle, StateBlockHandle, VertexBufferHandle,
};
use crate::gfx::types::{PrimitiveType, RenderState};

/// 命令种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawKind {
    /// 非索引
    Primitive,
    /// 索引
    Indexed,
    /// 非索引实例化
    Instanced,
    /// 索引实例化
    IndexedInstanced,
}

impl DrawKind {
    pub fn is_indexed(self) -> bool {
        matches!(self, DrawKind::Indexed | DrawKind::IndexedInstanced)
    }

    pub fn is_instanced(self) -> bool {
        matches!(self, DrawKind::Instanced | DrawKind::IndexedInstanced)
    }
}

/// 一条录制的绘制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawCommand {
    pub kind: DrawKind,
    pub primitive: PrimitiveType,
    pub primitive_count: u32,
    /// 单个实例读取的顶点（或索引）数
    pub vertex_count: u32,
    pub start_vertex: u32,
    pub start_index: u32,
    pub base_vertex: i32,
    pub instance_count: u32,
    pub first_instance: u32,
    pub instancing: InstancingHandle,
}

/// 图元数为 0、超过 `MAX_PRIMITIVE_COUNT` 或换算的顶点数溢出时拒绝
fn checked_vertex_count(primitive: PrimitiveType, primitive_count: u32) -> DriverResult<u32> {
    if primitive_count == 0 {
        return Err(DriverError::argument("Primitive count must be non-zero"));
    }
    if primitive_count > MAX_PRIMITIVE_COUNT {
        return Err(DriverError::argument(format!(
            "Primitive count {primitive_count} exceeds limit {MAX_PRIMITIVE_COUNT}"
        )));
    }
    primitive.vertex_count(primitive_count).ok_or_else(|| {
        DriverError::argument(format!(
            "{primitive_count} {primitive:?} primitives overflow the vertex count"
        ))
    })
}

impl DrawCommand {
    pub fn primitives(
        primitive: PrimitiveType,
        start_vertex: u32,
        primitive_count: u32,
    ) -> DriverResult<Self> {
        Ok(Self {
            kind: DrawKind::Primitive,
            primitive,
            primitive_count,
            vertex_count: checked_vertex_count(primitive, primitive_count)?,
            start_vertex,
            start_index: 0,
            base_vertex: 0,
            instance_count: 1,
            first_instance: 0,
            instancing: InstancingHandle::invalid(),
        })
    }

    pub fn indexed(
        primitive: PrimitiveType,
        start_index: u32,
        primitive_count: u32,
        base_vertex: i32,
    ) -> DriverResult<Self> {
        Ok(Self {
            kind: DrawKind::Indexed,
            start_index,
            base_vertex,
            start_vertex: 0,
            ..Self::primitives(primitive, 0, primitive_count)?
        })
    }

    /// 转为实例化命令
    pub fn with_instancing(self, instancing: InstancingHandle, instance_count: u32) -> Self {
        let kind = if self.kind.is_indexed() {
            DrawKind::IndexedInstanced
        } else {
            DrawKind::Instanced
        };
        Self {
            kind,
            instancing,
            instance_count,
            ..self
        }
    }

    /// 所有实例合计的顶点数
    pub fn total_vertices(&self) -> u64 {
        self.vertex_count as u64 * self.instance_count as u64
    }

    /// 所有实例合计的三角形数
    pub fn total_triangles(&self) -> u64 {
        self.primitive.triangle_count(self.primitive_count) * self.instance_count as u64
    }
}

/// 批次录制状态
///
/// `Idle -(begin)-> Recording -(end)-> Closed`，再次 begin 会清空命令重新录制。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchState {
    #[default]
    Idle,
    Recording,
    Closed,
}

/// 绘制批次
#[derive(Debug, Clone, Default)]
pub struct DrawBatch {
    pub(super) state: BatchState,
    pub(super) commands: Vec<DrawCommand>,
    pub(super) times_executed: u64,
}

impl DrawBatch {
    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn is_recording(&self) -> bool {
        self.state == BatchState::Recording
    }
}

/// `get_batch_info` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    pub state: BatchState,
    pub draw_count: usize,
    /// 非索引命令读取的顶点数
    pub total_vertices: u64,
    /// 索引命令读取的索引数
    pub total_indices: u64,
    pub total_triangles: u64,
    pub times_executed: u64,
}

/// 实例化上下文
///
/// 实例数据放在顶点缓冲区中，执行时绑定到 [`INSTANCE_STREAM`](super::INSTANCE_STREAM)。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstancingContext {
    pub instance_count: u32,
    pub buffer: VertexBufferHandle,
    pub stride: u32,
}

/// 多 Pass 描述中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassEntry {
    pub shader: ShaderHandle,
    pub state: StateBlockHandle,
}

impl Default for PassEntry {
    fn default() -> Self {
        Self {
            shader: ShaderHandle::invalid(),
            state: StateBlockHandle::invalid(),
        }
    }
}

/// 多 Pass 描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub(super) passes: Vec<PassEntry>,
}

impl RenderPassDesc {
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn passes(&self) -> &[PassEntry] {
        &self.passes
    }
}

/// 渲染状态块
pub type StateBlock = Vec<(RenderState, u64)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_counts() {
        let tri = DrawCommand::primitives(PrimitiveType::TriangleList, 0, 4).unwrap();
        assert_eq!(tri.vertex_count, 12);
        assert_eq!(tri.total_triangles(), 4);

        let strip = DrawCommand::indexed(PrimitiveType::TriangleStrip, 6, 2, -3).unwrap();
        assert_eq!(strip.kind, DrawKind::Indexed);
        assert_eq!(strip.vertex_count, 4);
        assert_eq!(strip.base_vertex, -3);

        let lines = DrawCommand::primitives(PrimitiveType::LineList, 0, 5).unwrap();
        assert_eq!(lines.total_triangles(), 0);
        assert_eq!(lines.total_vertices(), 10);
    }

    #[test]
    fn test_instancing_scales_totals() {
        let cmd = DrawCommand::indexed(PrimitiveType::TriangleList, 0, 2, 0)
            .unwrap()
            .with_instancing(InstancingHandle::invalid(), 10);
        assert_eq!(cmd.kind, DrawKind::IndexedInstanced);
        assert!(cmd.kind.is_indexed() && cmd.kind.is_instanced());
        assert_eq!(cmd.total_vertices(), 60);
        assert_eq!(cmd.total_triangles(), 20);
    }

    #[test]
    fn test_rejects_unrepresentable_counts() {
        assert!(matches!(
            DrawCommand::primitives(PrimitiveType::TriangleList, 0, 0),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(matches!(
            DrawCommand::primitives(PrimitiveType::TriangleList, 0, 0x6000_0000),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(DrawCommand::indexed(PrimitiveType::QuadList, 0, MAX_PRIMITIVE_COUNT + 1, 0).is_err());

        let largest = DrawCommand::primitives(PrimitiveType::QuadList, 0, MAX_PRIMITIVE_COUNT).unwrap();
        assert_eq!(largest.vertex_count, MAX_PRIMITIVE_COUNT * 4);
    }
}
