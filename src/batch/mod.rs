//! 绘制命令批处理
//!
//! 独立于驱动的一层：把绘制调用录制进命名批次，支持实例化和多 Pass 执行，
//! 提供合并分析（`optimize_batch`）、按拓扑排序（`sort_draw_calls`）和统计。
//!
//! ```text
//! create_batch → begin_batch → draw_* → end_batch → [sort_draw_calls] → execute_batch(driver)
//! ```
//!
//! 执行必须发生在驱动的录制帧内（`begin_frame` 和 `end_frame` 之间）。

mod command;
mod engine;
mod stats;

pub use command::{
    BatchInfo, BatchState, DrawBatch, DrawCommand, DrawKind, InstancingContext, PassEntry,
    RenderPassDesc, StateBlock,
};
pub use engine::{BatchEngine, DEFAULT_BATCH_CAPACITY, INSTANCE_STREAM, MAX_PASSES};
pub use stats::{BatchStats, ExecutionReport};
