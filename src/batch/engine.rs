//! 批处理引擎
//!
//! `BatchEngine` 持有批次、实例化上下文、多 Pass 描述和渲染状态块四张句柄表。
//! 录制只在 `begin_batch`/`end_batch` 之间进行，重放时通过 `&mut dyn GraphicsDriver`
//! 按插入顺序逐条发出绘制调用。
//!
//! # 设计原则
//!
//! - **拒绝而不是溢出**：超出容量、录制窗口外追加都返回错误，批次保持原样
//! - **分析与变换分离**：`optimize_batch` 只报告可合并的比例，不修改命令；`sort_draw_calls` 才重排
//! - **统计只在成功执行后累加**：失败的执行不会污染计数

use tracing::{debug, info, trace, warn};

use super::command::{
    BatchInfo, BatchState, DrawBatch, DrawCommand, DrawKind, InstancingContext, PassEntry,
    RenderPassDesc, StateBlock,
};
use super::stats::{BatchStats, ExecutionReport};
use crate::core::config::GraphicsConfig;
use crate::core::error::{DriverError, DriverResult};
use crate::gfx::driver::GraphicsDriver;
use crate::gfx::handle::{
    BatchHandle, Handle, HandleTable, InstancingHandle, RenderPassHandle, ShaderHandle,
    StateBlockHandle, VertexBufferHandle,
};
use crate::gfx::types::{PrimitiveType, RenderState};

/// 单个批次默认最多容纳的命令数
pub const DEFAULT_BATCH_CAPACITY: usize = 4096;

/// 多 Pass 描述最多的 Pass 数
pub const MAX_PASSES: usize = 64;

/// 实例数据绑定的顶点流
pub const INSTANCE_STREAM: u32 = 1;

/// 批处理引擎
pub struct BatchEngine {
    capacity: usize,
    batches: HandleTable<BatchHandle, DrawBatch>,
    instancing: HandleTable<InstancingHandle, InstancingContext>,
    passes: HandleTable<RenderPassHandle, RenderPassDesc>,
    state_blocks: HandleTable<StateBlockHandle, StateBlock>,
    stats: BatchStats,
    last_error: String,
}

impl Default for BatchEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_CAPACITY)
    }
}

/// 可执行的批次：已关闭且非空
fn executable(
    batches: &HandleTable<BatchHandle, DrawBatch>,
    handle: BatchHandle,
) -> DriverResult<&DrawBatch> {
    let batch = batches.get(handle)?;
    if batch.is_recording() {
        return Err(DriverError::state("Batch still recording"));
    }
    if batch.commands.is_empty() {
        return Err(DriverError::state("Batch has no draw commands"));
    }
    Ok(batch)
}

/// 按顺序重放命令
///
/// 实例化命令把上下文的实例缓冲区绑定到 `INSTANCE_STREAM`，结束后解绑。
fn replay(
    driver: &mut dyn GraphicsDriver,
    commands: &[DrawCommand],
    instancing: &HandleTable<InstancingHandle, InstancingContext>,
) -> DriverResult<ExecutionReport> {
    let mut report = ExecutionReport { passes: 1, ..Default::default() };
    let mut bound = InstancingHandle::invalid();

    let result = commands.iter().try_for_each(|cmd| {
        if cmd.kind.is_instanced() && cmd.instancing != bound {
            let context = instancing.get(cmd.instancing)?;
            driver.set_stream_source(INSTANCE_STREAM, context.buffer, 0, context.stride)?;
            bound = cmd.instancing;
        }

        match cmd.kind {
            DrawKind::Primitive => {
                driver.draw_primitive(cmd.primitive, cmd.start_vertex, cmd.primitive_count)
            }
            DrawKind::Indexed => driver.draw_indexed_primitive(
                cmd.primitive,
                cmd.base_vertex,
                cmd.start_index,
                cmd.primitive_count,
            ),
            DrawKind::Instanced => driver.draw_primitive_instanced(
                cmd.primitive,
                cmd.start_vertex,
                cmd.primitive_count,
                cmd.instance_count,
                cmd.first_instance,
            ),
            DrawKind::IndexedInstanced => driver.draw_indexed_primitive_instanced(
                cmd.primitive,
                cmd.base_vertex,
                cmd.start_index,
                cmd.primitive_count,
                cmd.instance_count,
                cmd.first_instance,
            ),
        }?;

        report.draw_calls += 1;
        report.vertices += cmd.total_vertices();
        report.triangles += cmd.total_triangles();
        Ok(())
    });

    if bound.is_valid() {
        if let Err(err) =
            driver.set_stream_source(INSTANCE_STREAM, VertexBufferHandle::invalid(), 0, 0)
        {
            warn!(error = %err, "Failed to unbind instance stream");
        }
    }

    result.map(|_| report)
}

impl BatchEngine {
    /// `capacity` 为单个批次的命令上限
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            batches: HandleTable::new(),
            instancing: HandleTable::new(),
            passes: HandleTable::new(),
            state_blocks: HandleTable::new(),
            stats: BatchStats::default(),
            last_error: String::new(),
        }
    }

    pub fn from_config(config: &GraphicsConfig) -> Self {
        Self::new(config.max_commands_per_batch)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 最后一次失败的错误消息
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    fn fail(&mut self, err: DriverError) -> DriverError {
        debug!(error = %err, "Batch call failed");
        self.last_error = err.to_string();
        err
    }

    fn track<T>(&mut self, result: DriverResult<T>) -> DriverResult<T> {
        result.map_err(|err| self.fail(err))
    }

    // ---- 批次 ----

    pub fn create_batch(&mut self) -> BatchHandle {
        let handle = self.batches.insert(DrawBatch::default());
        self.stats.batches_created += 1;
        debug!(handle = handle.to_raw(), "Batch created");
        handle
    }

    pub fn destroy_batch(&mut self, batch: BatchHandle) -> DriverResult<()> {
        let result = self.batches.remove(batch);
        let removed = self.track(result)?;
        if removed.is_recording() {
            warn!(handle = batch.to_raw(), "Destroyed a batch that was still recording");
        }
        Ok(())
    }

    pub fn batch(&self, batch: BatchHandle) -> DriverResult<&DrawBatch> {
        self.batches.get(batch)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// 开始录制，清空之前的命令
    pub fn begin_batch(&mut self, batch: BatchHandle) -> DriverResult<()> {
        let result = self.batches.get_mut(batch).and_then(|b| {
            if b.is_recording() {
                return Err(DriverError::state("Batch already recording"));
            }
            b.commands.clear();
            b.state = BatchState::Recording;
            Ok(())
        });
        self.track(result)?;
        trace!(handle = batch.to_raw(), "Batch recording");
        Ok(())
    }

    pub fn end_batch(&mut self, batch: BatchHandle) -> DriverResult<()> {
        let result = self.batches.get_mut(batch).and_then(|b| {
            if !b.is_recording() {
                return Err(DriverError::state("Batch not recording"));
            }
            b.state = BatchState::Closed;
            Ok(b.commands.len())
        });
        let count = self.track(result)?;
        trace!(handle = batch.to_raw(), commands = count, "Batch closed");
        Ok(())
    }

    /// 录制状态和容量先于命令本身校验
    fn append(&mut self, batch: BatchHandle, command: DriverResult<DrawCommand>) -> DriverResult<()> {
        let capacity = self.capacity;
        let result = self.batches.get_mut(batch).and_then(|b| {
            if !b.is_recording() {
                return Err(DriverError::state("Batch not recording"));
            }
            if b.commands.len() >= capacity {
                return Err(DriverError::CapacityExceeded { what: "Batch", limit: capacity });
            }
            b.commands.push(command?);
            Ok(())
        });
        self.track(result)
    }

    pub fn draw_primitives(
        &mut self,
        batch: BatchHandle,
        primitive: PrimitiveType,
        start_vertex: u32,
        primitive_count: u32,
    ) -> DriverResult<()> {
        self.append(batch, DrawCommand::primitives(primitive, start_vertex, primitive_count))
    }

    pub fn draw_indexed_primitives(
        &mut self,
        batch: BatchHandle,
        primitive: PrimitiveType,
        start_index: u32,
        primitive_count: u32,
        base_vertex: i32,
    ) -> DriverResult<()> {
        let command = DrawCommand::indexed(primitive, start_index, primitive_count, base_vertex);
        self.append(batch, command)
    }

    // ---- 实例化 ----

    /// 注册实例化上下文，`stride` 为 0 时使用顶点格式中 1 号流的跨度
    pub fn setup_instancing(
        &mut self,
        instance_count: u32,
        buffer: VertexBufferHandle,
        stride: u32,
    ) -> DriverResult<InstancingHandle> {
        if instance_count == 0 {
            return Err(self.fail(DriverError::argument("Instance count must be non-zero")));
        }
        if !buffer.is_valid() {
            return Err(self.fail(DriverError::argument("Instance buffer handle is invalid")));
        }
        let handle = self.instancing.insert(InstancingContext { instance_count, buffer, stride });
        debug!(handle = handle.to_raw(), instance_count, stride, "Instancing context created");
        Ok(handle)
    }

    pub fn destroy_instancing(&mut self, instancing: InstancingHandle) -> DriverResult<()> {
        let result = self.instancing.remove(instancing);
        self.track(result).map(|_| ())
    }

    pub fn instancing_context(&self, instancing: InstancingHandle) -> DriverResult<&InstancingContext> {
        self.instancing.get(instancing)
    }

    fn append_instanced(
        &mut self,
        batch: BatchHandle,
        command: DriverResult<DrawCommand>,
        instancing: InstancingHandle,
    ) -> DriverResult<()> {
        let result = self.instancing.get(instancing).map(|c| c.instance_count);
        let instance_count = self.track(result)?;
        self.append(batch, command.map(|c| c.with_instancing(instancing, instance_count)))
    }

    /// 实例数取自实例化上下文
    pub fn draw_instanced_primitives(
        &mut self,
        batch: BatchHandle,
        primitive: PrimitiveType,
        start_vertex: u32,
        primitive_count: u32,
        instancing: InstancingHandle,
    ) -> DriverResult<()> {
        let command = DrawCommand::primitives(primitive, start_vertex, primitive_count);
        self.append_instanced(batch, command, instancing)
    }

    pub fn draw_indexed_instanced_primitives(
        &mut self,
        batch: BatchHandle,
        primitive: PrimitiveType,
        start_index: u32,
        primitive_count: u32,
        base_vertex: i32,
        instancing: InstancingHandle,
    ) -> DriverResult<()> {
        let command = DrawCommand::indexed(primitive, start_index, primitive_count, base_vertex);
        self.append_instanced(batch, command, instancing)
    }

    // ---- 执行 ----

    /// 按插入顺序重放，必须在驱动的录制帧内调用
    pub fn execute_batch(
        &mut self,
        driver: &mut dyn GraphicsDriver,
        batch: BatchHandle,
    ) -> DriverResult<ExecutionReport> {
        let _span = crate::span_trace!("execute_batch").entered();
        let result = executable(&self.batches, batch)
            .and_then(|b| replay(driver, &b.commands, &self.instancing).map(|r| (r, b.commands.len())));
        let (report, size) = self.track(result)?;
        self.finish_execution(batch, &report, size);
        trace!(
            handle = batch.to_raw(),
            draw_calls = report.draw_calls,
            triangles = report.triangles,
            "Batch executed"
        );
        Ok(report)
    }

    fn finish_execution(&mut self, batch: BatchHandle, report: &ExecutionReport, size: usize) {
        self.stats.record(report, size);
        if let Ok(b) = self.batches.get_mut(batch) {
            b.times_executed += 1;
        }
    }

    /// 分析可合并的比例：相邻同拓扑命令算一组，返回 组数 / 命令数
    ///
    /// 少于两条命令时返回 1.0。不修改批次。
    pub fn optimize_batch(&mut self, batch: BatchHandle) -> DriverResult<f32> {
        let result = self.batches.get(batch).map(|b| {
            let commands = &b.commands;
            if commands.len() < 2 {
                return (1.0, commands.len(), commands.len());
            }
            let groups = 1 + commands
                .windows(2)
                .filter(|pair| pair[0].primitive != pair[1].primitive)
                .count();
            (groups as f32 / commands.len() as f32, commands.len(), groups)
        });
        let (ratio, commands, groups) = self.track(result)?;
        self.stats.last_optimization_ratio = ratio;
        debug!(commands, groups, ratio, "Batch analyzed");
        Ok(ratio)
    }

    /// 按拓扑稳定排序，同拓扑命令保持原有先后
    pub fn sort_draw_calls(&mut self, batch: BatchHandle) -> DriverResult<()> {
        let result = self.batches.get_mut(batch).map(|b| {
            b.commands.sort_by_key(|cmd| cmd.primitive.sort_key());
            b.commands.len()
        });
        let count = self.track(result)?;
        debug!(handle = batch.to_raw(), commands = count, "Draw calls sorted");
        Ok(())
    }

    // ---- 渲染状态块 ----

    pub fn create_state_block(&mut self, states: &[(RenderState, u64)]) -> StateBlockHandle {
        let handle = self.state_blocks.insert(states.to_vec());
        debug!(handle = handle.to_raw(), states = states.len(), "State block created");
        handle
    }

    pub fn destroy_state_block(&mut self, block: StateBlockHandle) -> DriverResult<()> {
        let result = self.state_blocks.remove(block);
        self.track(result).map(|_| ())
    }

    pub fn state_block(&self, block: StateBlockHandle) -> DriverResult<&[(RenderState, u64)]> {
        self.state_blocks.get(block).map(|states| states.as_slice())
    }

    // ---- 多 Pass ----

    pub fn create_render_pass(&mut self, pass_count: u32) -> DriverResult<RenderPassHandle> {
        let count = pass_count as usize;
        if count == 0 || count > MAX_PASSES {
            return Err(self.fail(DriverError::argument(format!(
                "Pass count must be between 1 and {MAX_PASSES}, got {pass_count}"
            ))));
        }
        let handle = self.passes.insert(RenderPassDesc {
            passes: vec![PassEntry::default(); count],
        });
        debug!(handle = handle.to_raw(), pass_count, "Render pass created");
        Ok(handle)
    }

    pub fn destroy_render_pass(&mut self, pass: RenderPassHandle) -> DriverResult<()> {
        let result = self.passes.remove(pass);
        self.track(result).map(|_| ())
    }

    pub fn render_pass(&self, pass: RenderPassHandle) -> DriverResult<&RenderPassDesc> {
        self.passes.get(pass)
    }

    fn pass_entry(&mut self, pass: RenderPassHandle, index: u32) -> DriverResult<&mut PassEntry> {
        let desc = self.passes.get_mut(pass)?;
        let count = desc.passes.len();
        desc.passes
            .get_mut(index as usize)
            .ok_or_else(|| DriverError::argument(format!("Invalid pass index {index} (pass count {count})")))
    }

    /// 着色器句柄在执行时由驱动校验；空句柄或已销毁的句柄都沿用当前着色器
    pub fn set_pass_shader(
        &mut self,
        pass: RenderPassHandle,
        index: u32,
        shader: ShaderHandle,
    ) -> DriverResult<()> {
        let result = self.pass_entry(pass, index).map(|entry| entry.shader = shader);
        self.track(result)?;
        trace!(pass = pass.to_raw(), index, shader = shader.to_raw(), "Pass shader set");
        Ok(())
    }

    /// 空句柄表示该 Pass 不应用状态块，执行前被销毁的状态块同样跳过
    pub fn set_pass_state(
        &mut self,
        pass: RenderPassHandle,
        index: u32,
        state: StateBlockHandle,
    ) -> DriverResult<()> {
        if state.is_valid() && !self.state_blocks.contains(state) {
            return Err(self.fail(state.invalid_error()));
        }
        let result = self.pass_entry(pass, index).map(|entry| entry.state = state);
        self.track(result)?;
        trace!(pass = pass.to_raw(), index, state = state.to_raw(), "Pass state set");
        Ok(())
    }

    /// 每个 Pass 先应用状态块、再绑定着色器，然后重放整个批次
    pub fn execute_multi_pass(
        &mut self,
        driver: &mut dyn GraphicsDriver,
        batch: BatchHandle,
        pass: RenderPassHandle,
    ) -> DriverResult<ExecutionReport> {
        let result = self.run_passes(driver, batch, pass);
        let (report, size) = self.track(result)?;
        self.finish_execution(batch, &report, size);
        debug!(
            handle = batch.to_raw(),
            passes = report.passes,
            draw_calls = report.draw_calls,
            "Multi-pass execution complete"
        );
        Ok(report)
    }

    fn run_passes(
        &self,
        driver: &mut dyn GraphicsDriver,
        batch: BatchHandle,
        pass: RenderPassHandle,
    ) -> DriverResult<(ExecutionReport, usize)> {
        let commands = &executable(&self.batches, batch)?.commands;
        let desc = self.passes.get(pass)?;

        let mut total = ExecutionReport::default();
        for (index, entry) in desc.passes.iter().enumerate() {
            if entry.state.is_valid() {
                match self.state_blocks.get(entry.state) {
                    Ok(block) => {
                        for &(state, value) in block {
                            driver.set_render_state(state, value)?;
                        }
                    }
                    Err(err) => warn!(index, error = %err, "Pass state block skipped"),
                }
            }
            if entry.shader.is_valid() {
                match driver.set_shader_program(entry.shader) {
                    Ok(()) => {}
                    Err(err @ DriverError::InvalidHandle { .. }) => {
                        warn!(index, error = %err, "Pass shader unavailable, keeping current shader");
                    }
                    Err(err) => return Err(err),
                }
            }
            let report = replay(driver, commands, &self.instancing)?;
            trace!(index, draw_calls = report.draw_calls, "Pass executed");
            total.draw_calls += report.draw_calls;
            total.vertices += report.vertices;
            total.triangles += report.triangles;
            total.passes += 1;
        }
        Ok((total, commands.len()))
    }

    // ---- 查询与校验 ----

    pub fn batch_info(&mut self, batch: BatchHandle) -> DriverResult<BatchInfo> {
        let result = self.batches.get(batch).map(|b| {
            let mut info = BatchInfo {
                state: b.state,
                draw_count: b.commands.len(),
                total_vertices: 0,
                total_indices: 0,
                total_triangles: 0,
                times_executed: b.times_executed,
            };
            for cmd in &b.commands {
                if cmd.kind.is_indexed() {
                    info.total_indices += cmd.total_vertices();
                } else {
                    info.total_vertices += cmd.total_vertices();
                }
                info.total_triangles += cmd.total_triangles();
            }
            info
        });
        self.track(result)
    }

    /// 检查命令数不超过容量，实例化命令引用的上下文仍然存在
    pub fn validate_batch(&mut self, batch: BatchHandle) -> DriverResult<()> {
        let result = self.check_batch(batch);
        self.track(result)
    }

    /// 校验全部批次
    pub fn validate(&mut self) -> DriverResult<()> {
        let handles: Vec<BatchHandle> = self.batches.iter().map(|(handle, _)| handle).collect();
        let result = handles.into_iter().try_for_each(|handle| self.check_batch(handle));
        self.track(result)
    }

    fn check_batch(&self, batch: BatchHandle) -> DriverResult<()> {
        let b = self.batches.get(batch)?;
        if b.commands.len() > self.capacity {
            return Err(DriverError::CapacityExceeded { what: "Batch", limit: self.capacity });
        }
        for (index, cmd) in b.commands.iter().enumerate() {
            if cmd.primitive_count == 0 {
                return Err(DriverError::state(format!("Command {index} draws no primitives")));
            }
            if cmd.kind.is_instanced() && !self.instancing.contains(cmd.instancing) {
                return Err(DriverError::state(format!(
                    "Command {index} references a destroyed instancing context"
                )));
            }
        }
        Ok(())
    }

    // ---- 统计 ----

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
        debug!("Batch statistics reset");
    }

    /// 清空所有批次的命令并清零统计，句柄和录制状态保持不变
    pub fn clear_cache(&mut self) {
        for (_, batch) in self.batches.iter_mut() {
            batch.commands.clear();
        }
        self.stats.reset();
        info!(batches = self.batches.len(), "Batch cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::device::SPIRV_MAGIC;
    use crate::gfx::explicit::{DriverSettings, ExplicitDriver};
    use crate::gfx::handle::VertexFormatHandle;
    use crate::gfx::headless::HeadlessDevice;
    use crate::gfx::state::Topology;
    use crate::gfx::types::{IndexFormat, VertexElement};

    type TestDriver = ExplicitDriver<HeadlessDevice>;

    /// 64 个 float3 顶点、64 个 u16 索引，都已绑定
    fn driver() -> TestDriver {
        let mut driver = ExplicitDriver::new(HeadlessDevice::new(), DriverSettings::default());
        driver.initialize(None, 640, 480, false).unwrap();
        let format: VertexFormatHandle =
            driver.create_vertex_format(&[VertexElement::default()]).unwrap();
        driver.set_vertex_format(format).unwrap();
        let vertices = driver.create_vertex_buffer(64 * 12, false, None).unwrap();
        driver.set_stream_source(0, vertices, 0, 12).unwrap();
        let indices = driver
            .create_index_buffer(64 * 2, IndexFormat::U16, false, None)
            .unwrap();
        driver.set_index_buffer(indices, 0).unwrap();
        driver
    }

    fn in_frame<R>(driver: &mut TestDriver, body: impl FnOnce(&mut TestDriver) -> R) -> R {
        driver.begin_frame().unwrap();
        let result = body(driver);
        driver.end_frame().unwrap();
        driver.present().unwrap();
        result
    }

    fn spirv_stub() -> Vec<u8> {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        bytes
    }

    /// 录制一个闭合批次
    fn recorded(engine: &mut BatchEngine, primitives: &[PrimitiveType]) -> BatchHandle {
        let batch = engine.create_batch();
        engine.begin_batch(batch).unwrap();
        for &primitive in primitives {
            engine.draw_primitives(batch, primitive, 0, 1).unwrap();
        }
        engine.end_batch(batch).unwrap();
        batch
    }

    #[test]
    fn test_recording_window() {
        let mut engine = BatchEngine::default();
        let batch = engine.create_batch();

        let err = engine.draw_primitives(batch, PrimitiveType::TriangleList, 0, 1).unwrap_err();
        assert_eq!(err, DriverError::state("Batch not recording"));
        assert_eq!(engine.last_error(), "Batch not recording");

        engine.begin_batch(batch).unwrap();
        assert_eq!(
            engine.begin_batch(batch).unwrap_err(),
            DriverError::state("Batch already recording")
        );
        engine.draw_primitives(batch, PrimitiveType::TriangleList, 0, 1).unwrap();
        assert!(engine.draw_primitives(batch, PrimitiveType::TriangleList, 0, 0).is_err());
        engine.end_batch(batch).unwrap();
        assert!(engine.end_batch(batch).is_err());

        assert_eq!(engine.batch(batch).unwrap().commands().len(), 1);
        assert_eq!(engine.batch(batch).unwrap().state(), BatchState::Closed);
    }

    #[test]
    fn test_begin_restarts_recording() {
        let mut engine = BatchEngine::default();
        let batch = recorded(&mut engine, &[PrimitiveType::TriangleList; 3]);
        engine.begin_batch(batch).unwrap();
        assert!(engine.batch(batch).unwrap().commands().is_empty());
    }

    #[test]
    fn test_capacity_rejects_without_mutation() {
        let mut engine = BatchEngine::new(2);
        let batch = engine.create_batch();
        engine.begin_batch(batch).unwrap();
        engine.draw_primitives(batch, PrimitiveType::TriangleList, 0, 1).unwrap();
        engine.draw_indexed_primitives(batch, PrimitiveType::TriangleList, 0, 1, 0).unwrap();

        let err = engine.draw_primitives(batch, PrimitiveType::LineList, 0, 1).unwrap_err();
        assert_eq!(err, DriverError::CapacityExceeded { what: "Batch", limit: 2 });
        assert!(engine.last_error().starts_with("Batch overflow"));
        assert_eq!(engine.batch_info(batch).unwrap().draw_count, 2);
        assert!(engine.batch(batch).unwrap().is_recording());
    }

    #[test]
    fn test_execute_requires_closed_and_non_empty() {
        let mut driver = driver();
        let mut engine = BatchEngine::default();
        let batch = engine.create_batch();
        engine.begin_batch(batch).unwrap();

        in_frame(&mut driver, |d| {
            assert_eq!(
                engine.execute_batch(d, batch).unwrap_err(),
                DriverError::state("Batch still recording")
            );
            engine.end_batch(batch).unwrap();
            assert_eq!(
                engine.execute_batch(d, batch).unwrap_err(),
                DriverError::state("Batch has no draw commands")
            );
        });
        assert_eq!(engine.stats().batches_executed, 0);
    }

    #[test]
    fn test_sort_groups_topologies_and_execute() {
        let mut driver = driver();
        let mut engine = BatchEngine::default();
        let batch = recorded(
            &mut engine,
            &[PrimitiveType::TriangleList, PrimitiveType::LineList, PrimitiveType::TriangleList],
        );
        let before = engine.batch_info(batch).unwrap().total_triangles;

        engine.sort_draw_calls(batch).unwrap();
        let order: Vec<PrimitiveType> =
            engine.batch(batch).unwrap().commands().iter().map(|c| c.primitive).collect();
        assert_eq!(
            order,
            vec![PrimitiveType::LineList, PrimitiveType::TriangleList, PrimitiveType::TriangleList]
        );

        // 幂等
        let sorted = engine.batch(batch).unwrap().commands().to_vec();
        engine.sort_draw_calls(batch).unwrap();
        assert_eq!(engine.batch(batch).unwrap().commands(), sorted.as_slice());

        let report = in_frame(&mut driver, |d| engine.execute_batch(d, batch).unwrap());
        assert_eq!(report.draw_calls, 3);
        assert_eq!(report.triangles, before);
        assert_eq!(report.triangles, 2);

        let draws = driver.device().draws();
        assert_eq!(draws.len(), 3);
        assert_eq!(draws[0].params.topology, Topology::LineList);
        assert_eq!(draws[2].params.topology, Topology::TriangleList);

        let stats = engine.stats();
        assert_eq!(stats.total_draw_calls, 3);
        assert_eq!(stats.total_triangles_drawn, 2);
        assert_eq!(stats.total_vertices_drawn, 8);
        assert_eq!(stats.batches_executed, 1);
        assert_eq!(engine.batch_info(batch).unwrap().times_executed, 1);
    }

    #[test]
    fn test_optimize_is_pure_analysis() {
        let mut engine = BatchEngine::default();
        let batch = recorded(
            &mut engine,
            &[
                PrimitiveType::TriangleList,
                PrimitiveType::TriangleList,
                PrimitiveType::LineList,
                PrimitiveType::TriangleList,
            ],
        );
        let before = engine.batch(batch).unwrap().commands().to_vec();
        assert_eq!(engine.optimize_batch(batch).unwrap(), 0.75);
        assert_eq!(engine.batch(batch).unwrap().commands(), before.as_slice());
        assert_eq!(engine.stats().last_optimization_ratio, 0.75);

        let single = recorded(&mut engine, &[PrimitiveType::PointList]);
        assert_eq!(engine.optimize_batch(single).unwrap(), 1.0);
        let empty = engine.create_batch();
        assert_eq!(engine.optimize_batch(empty).unwrap(), 1.0);

        let mixed = recorded(&mut engine, &[PrimitiveType::LineList, PrimitiveType::TriangleList]);
        let ratio = engine.optimize_batch(mixed).unwrap();
        assert!(ratio > 0.0 && ratio <= 1.0);
    }

    #[test]
    fn test_instanced_draws_bind_instance_stream() {
        let mut driver = driver();
        let instance_data = driver.create_vertex_buffer(10 * 16, false, None).unwrap();
        let mut engine = BatchEngine::default();

        assert!(engine.setup_instancing(0, instance_data, 16).is_err());
        assert!(engine.setup_instancing(4, VertexBufferHandle::invalid(), 16).is_err());
        let instancing = engine.setup_instancing(10, instance_data, 16).unwrap();

        let batch = engine.create_batch();
        engine.begin_batch(batch).unwrap();
        let bogus = InstancingHandle::from_raw(0xdead_0000_0001);
        let err = engine
            .draw_instanced_primitives(batch, PrimitiveType::TriangleList, 0, 1, bogus)
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidHandle { kind: "instancing context", .. }));
        assert!(engine.batch(batch).unwrap().commands().is_empty());

        engine
            .draw_instanced_primitives(batch, PrimitiveType::TriangleList, 0, 1, instancing)
            .unwrap();
        engine
            .draw_indexed_instanced_primitives(batch, PrimitiveType::TriangleList, 0, 2, 0, instancing)
            .unwrap();
        engine.end_batch(batch).unwrap();

        let report = in_frame(&mut driver, |d| engine.execute_batch(d, batch).unwrap());
        assert_eq!(report.vertices, 3 * 10 + 6 * 10);
        assert_eq!(report.triangles, 10 + 20);

        let draws = driver.device().draws();
        assert_eq!(draws.len(), 2);
        assert!(draws.iter().all(|d| d.params.instance_count == 10));
        assert!(draws[1].params.indexed);
        assert!(draws[0].vertex_buffers.iter().any(|&(stream, _, _, stride)| {
            stream == INSTANCE_STREAM && stride == 16
        }));
    }

    #[test]
    fn test_destroyed_instancing_fails_validation() {
        let mut driver = driver();
        let instance_data = driver.create_vertex_buffer(64, false, None).unwrap();
        let mut engine = BatchEngine::default();
        let instancing = engine.setup_instancing(2, instance_data, 16).unwrap();
        let batch = engine.create_batch();
        engine.begin_batch(batch).unwrap();
        engine
            .draw_instanced_primitives(batch, PrimitiveType::PointList, 0, 3, instancing)
            .unwrap();
        engine.end_batch(batch).unwrap();
        engine.validate_batch(batch).unwrap();

        engine.destroy_instancing(instancing).unwrap();
        assert!(engine.validate_batch(batch).is_err());
        assert!(engine.validate().is_err());
        in_frame(&mut driver, |d| assert!(engine.execute_batch(d, batch).is_err()));
        assert!(engine.last_error().contains("instancing context"));
    }

    #[test]
    fn test_multi_pass_applies_state_then_shader() {
        let mut driver = driver();
        let shader = driver.create_shader_program(&spirv_stub(), &spirv_stub()).unwrap();
        let mut engine = BatchEngine::default();

        assert!(engine.create_render_pass(0).is_err());
        assert!(engine.create_render_pass(MAX_PASSES as u32 + 1).is_err());
        let pass = engine.create_render_pass(2).unwrap();
        assert_eq!(engine.render_pass(pass).unwrap().pass_count(), 2);

        let block = engine.create_state_block(&[(RenderState::AlphaRef, 0x80)]);
        engine.set_pass_shader(pass, 0, shader).unwrap();
        engine.set_pass_state(pass, 1, block).unwrap();
        assert!(engine.set_pass_shader(pass, 2, shader).is_err());
        assert!(engine.last_error().contains("Invalid pass index"));
        assert!(engine.set_pass_state(pass, 0, StateBlockHandle::from_raw(0xbeef_0000_0001)).is_err());

        let batch = recorded(&mut engine, &[PrimitiveType::TriangleList, PrimitiveType::TriangleStrip]);
        let report = in_frame(&mut driver, |d| engine.execute_multi_pass(d, batch, pass).unwrap());

        assert_eq!(report.passes, 2);
        assert_eq!(report.draw_calls, 4);
        assert_eq!(report.triangles, 4);
        assert_eq!(driver.render_state(RenderState::AlphaRef), 0x80);
        assert_eq!(driver.shader_program(), shader);

        let draws = driver.device().draws();
        assert_eq!(draws.len(), 4);
        assert!(draws.iter().all(|d| d.shader.is_some()));

        let stats = engine.stats();
        assert_eq!(stats.batches_executed, 1);
        assert_eq!(stats.total_draw_calls, 4);
        assert_eq!(stats.average_batch_size(), 4.0);
    }

    #[test]
    fn test_stale_pass_handles_fall_back() {
        let mut driver = driver();
        let shader = driver.create_shader_program(&spirv_stub(), &spirv_stub()).unwrap();
        let mut engine = BatchEngine::default();

        let pass = engine.create_render_pass(2).unwrap();
        let block = engine.create_state_block(&[(RenderState::AlphaRef, 0x80)]);
        engine.set_pass_shader(pass, 0, shader).unwrap();
        engine.set_pass_state(pass, 1, block).unwrap();
        engine.destroy_state_block(block).unwrap();
        driver.destroy_shader_program(shader).unwrap();

        let alpha_ref = driver.render_state(RenderState::AlphaRef);
        let batch = recorded(&mut engine, &[PrimitiveType::TriangleList]);
        let report = in_frame(&mut driver, |d| engine.execute_multi_pass(d, batch, pass).unwrap());

        assert_eq!(report.passes, 2);
        assert_eq!(report.draw_calls, 2);
        assert_eq!(driver.render_state(RenderState::AlphaRef), alpha_ref);
        assert!(!driver.shader_program().is_valid());
        assert!(driver.device().draws().iter().all(|d| d.shader.is_none()));
        assert_eq!(engine.stats().batches_executed, 1);
        assert_eq!(engine.stats().total_draw_calls, 2);
    }

    #[test]
    fn test_oversized_primitive_count_rejected() {
        let mut engine = BatchEngine::default();
        let batch = engine.create_batch();

        // 录制状态先于图元数校验
        assert_eq!(
            engine.draw_primitives(batch, PrimitiveType::TriangleList, 0, 0x6000_0000).unwrap_err(),
            DriverError::state("Batch not recording")
        );

        engine.begin_batch(batch).unwrap();
        assert!(matches!(
            engine.draw_primitives(batch, PrimitiveType::TriangleList, 0, 0x6000_0000),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(engine.last_error().contains("exceeds limit"));
        assert!(engine
            .draw_indexed_primitives(batch, PrimitiveType::QuadStrip, 0, u32::MAX, 0)
            .is_err());
        assert_eq!(engine.batch_info(batch).unwrap().draw_count, 0);

        engine.draw_primitives(batch, PrimitiveType::TriangleList, 0, 1).unwrap();
        assert_eq!(engine.batch_info(batch).unwrap().draw_count, 1);
    }

    #[test]
    fn test_failed_execution_leaves_stats_untouched() {
        let mut driver = driver();
        let mut engine = BatchEngine::default();
        let batch = recorded(&mut engine, &[PrimitiveType::TriangleList]);

        // 帧外执行，驱动拒绝绘制
        assert!(engine.execute_batch(&mut driver, batch).is_err());
        assert!(engine.last_error().contains("No frame is recording"));
        assert_eq!(engine.stats().total_draw_calls, 0);
        assert_eq!(engine.stats().batches_executed, 0);
    }

    #[test]
    fn test_reset_and_clear_keep_handles() {
        let mut driver = driver();
        let mut engine = BatchEngine::default();
        let batch = recorded(&mut engine, &[PrimitiveType::TriangleList; 2]);
        in_frame(&mut driver, |d| engine.execute_batch(d, batch).unwrap());
        assert_eq!(engine.stats().batches_created, 1);

        engine.reset_stats();
        assert_eq!(engine.stats(), BatchStats::default());

        in_frame(&mut driver, |d| engine.execute_batch(d, batch).unwrap());
        engine.clear_cache();
        assert_eq!(engine.stats().total_draw_calls, 0);
        let info = engine.batch_info(batch).unwrap();
        assert_eq!(info.draw_count, 0);
        assert_eq!(info.state, BatchState::Closed);
        engine.begin_batch(batch).unwrap();
    }

    #[test]
    fn test_batch_info_and_destroy() {
        let mut engine = BatchEngine::default();
        let batch = engine.create_batch();
        engine.begin_batch(batch).unwrap();
        engine.draw_primitives(batch, PrimitiveType::TriangleList, 0, 2).unwrap();
        engine.draw_indexed_primitives(batch, PrimitiveType::LineStrip, 0, 3, 0).unwrap();

        let info = engine.batch_info(batch).unwrap();
        assert_eq!(info.state, BatchState::Recording);
        assert_eq!(info.draw_count, 2);
        assert_eq!(info.total_vertices, 6);
        assert_eq!(info.total_indices, 4);
        assert_eq!(info.total_triangles, 2);

        engine.destroy_batch(batch).unwrap();
        assert_eq!(engine.batch_count(), 0);
        assert!(matches!(
            engine.begin_batch(batch),
            Err(DriverError::InvalidHandle { kind: "batch", .. })
        ));
        assert!(engine.destroy_batch(batch).is_err());
    }
}
