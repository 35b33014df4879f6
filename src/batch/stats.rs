//! 批处理统计

/// 累计统计
///
/// 计数只在批次成功重放时累加；`reset` 清零但不影响任何句柄。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatchStats {
    pub total_draw_calls: u64,
    pub total_vertices_drawn: u64,
    pub total_triangles_drawn: u64,
    pub batches_created: u64,
    pub batches_executed: u64,
    /// 执行过的最大批次（命令数）
    pub max_batch_size: usize,
    /// 最近一次 `optimize_batch` 的比值
    pub last_optimization_ratio: f32,
}

impl BatchStats {
    /// 平均每次执行的绘制调用数
    pub fn average_batch_size(&self) -> f32 {
        if self.batches_executed == 0 {
            0.0
        } else {
            self.total_draw_calls as f32 / self.batches_executed as f32
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub(super) fn record(&mut self, report: &ExecutionReport, batch_size: usize) {
        self.total_draw_calls += report.draw_calls;
        self.total_vertices_drawn += report.vertices;
        self.total_triangles_drawn += report.triangles;
        self.batches_executed += 1;
        self.max_batch_size = self.max_batch_size.max(batch_size);
    }
}

/// 一次执行的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionReport {
    pub draw_calls: u64,
    pub vertices: u64,
    pub triangles: u64,
    /// 重放的 Pass 数，单 Pass 执行为 1
    pub passes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_batch_size() {
        let mut stats = BatchStats::default();
        assert_eq!(stats.average_batch_size(), 0.0);

        let report = ExecutionReport { draw_calls: 3, vertices: 9, triangles: 3, passes: 1 };
        stats.record(&report, 3);
        stats.record(&ExecutionReport { draw_calls: 1, ..report }, 1);
        assert_eq!(stats.average_batch_size(), 2.0);
        assert_eq!(stats.max_batch_size, 3);

        stats.reset();
        assert_eq!(stats, BatchStats::default());
    }
}
