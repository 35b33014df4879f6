//! 帧同步与延迟销毁
//!
//! 双缓冲帧环：同时最多 `FRAMES_IN_FLIGHT = 2` 帧在 GPU 上执行。第 i 帧使用槽位 `i % 2`，
//! 开始录制前必须等待第 i-2 帧（同一槽位上一次提交）的 Fence，CPU 才能复用该槽位的命令缓冲区。
//!
//! # 延迟销毁
//!
//! 资源销毁时 GPU 可能仍在读取它。`FrameRing::retire` 把后端对象挂到当前槽位的队列上，
//! 等该槽位下一次 Fence 完成时才真正释放。GPU 按提交顺序完成工作，
//! 所以当前槽位的 Fence 覆盖了之前所有帧对该资源的引用。

use tracing::trace;

/// 同时在飞的帧数
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Fence 值
///
/// 单调递增，0 表示“从未提交”。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(u64);

impl FenceValue {
    /// 创建新的Fence值
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// 获取内部值
    pub fn value(&self) -> u64 {
        self.0
    }

    /// 下一个Fence值
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// 帧状态机：`Idle -(begin)-> Recording -(end)-> Submitted -(present)-> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
}

/// 帧槽位
///
/// 对应一个命令缓冲区和一个 Fence。
#[derive(Debug)]
pub struct FrameSlot<R> {
    /// 槽位索引
    pub index: usize,
    /// 最近一次提交的 Fence 值
    fence_value: FenceValue,
    /// GPU 是否可能仍在使用该槽位
    in_flight: bool,
    /// 使用该槽位的最近一帧的帧号
    frame_number: u64,
    /// 等待该槽位 Fence 后释放的资源
    retired: Vec<R>,
}

impl<R> FrameSlot<R> {
    fn new(index: usize) -> Self {
        Self {
            index,
            fence_value: FenceValue::default(),
            in_flight: false,
            frame_number: 0,
            retired: Vec::new(),
        }
    }

    pub fn fence_value(&self) -> FenceValue {
        self.fence_value
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn pending_destructions(&self) -> usize {
        self.retired.len()
    }
}

/// 双缓冲帧环
///
/// 只做簿记：真正的 Fence 等待由设备完成，完成后调用 `complete` 回收槽位。
#[derive(Debug)]
pub struct FrameRing<R> {
    slots: Vec<FrameSlot<R>>,
    /// 已经开始的帧数
    frames_begun: u64,
    /// 当前（或最近一次）开始的帧所在槽位
    current: usize,
    state: FrameState,
    last_fence: FenceValue,
    completed_fence: FenceValue,
}

impl<R> FrameRing<R> {
    pub fn new() -> Self {
        Self {
            slots: (0..FRAMES_IN_FLIGHT).map(FrameSlot::new).collect(),
            frames_begun: 0,
            current: 0,
            state: FrameState::Idle,
            last_fence: FenceValue::default(),
            completed_fence: FenceValue::default(),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// 当前帧所在槽位
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// 已经开始的帧数
    pub fn frames_begun(&self) -> u64 {
        self.frames_begun
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot<R>> {
        self.slots.get(index)
    }

    /// 下一帧将使用的槽位
    pub fn next_index(&self) -> usize {
        (self.frames_begun % FRAMES_IN_FLIGHT as u64) as usize
    }

    /// 下一帧开始前需要等待的 Fence（该槽位仍在飞时）
    pub fn pending_fence_for_next(&self) -> Option<FenceValue> {
        let slot = &self.slots[self.next_index()];
        slot.in_flight.then_some(slot.fence_value)
    }

    /// 进入 Recording，返回使用的槽位
    ///
    /// 调用前槽位必须已经通过 `complete` 回收。
    pub fn begin(&mut self) -> usize {
        let index = self.next_index();
        self.frames_begun += 1;
        self.current = index;
        self.state = FrameState::Recording;
        self.slots[index].frame_number = self.frames_begun;
        index
    }

    /// 进入 Submitted，为当前槽位分配新的 Fence 值
    pub fn submit(&mut self) -> FenceValue {
        self.last_fence = self.last_fence.next();
        let slot = &mut self.slots[self.current];
        slot.fence_value = self.last_fence;
        slot.in_flight = true;
        self.state = FrameState::Submitted;
        trace!(slot = slot.index, fence = self.last_fence.value(), "Frame submitted");
        self.last_fence
    }

    /// 回到 Idle
    pub fn present(&mut self) {
        self.state = FrameState::Idle;
    }

    /// 放弃当前帧（录制失败时），回到 Idle，槽位不标记为在飞
    pub fn abandon(&mut self) {
        self.state = FrameState::Idle;
    }

    /// 槽位的 Fence 已经完成，返回可以释放的资源
    pub fn complete(&mut self, index: usize) -> Vec<R> {
        let Some(slot) = self.slots.get_mut(index) else {
            return Vec::new();
        };
        if slot.in_flight {
            slot.in_flight = false;
            self.completed_fence = self.completed_fence.max(slot.fence_value);
        }
        std::mem::take(&mut slot.retired)
    }

    /// 所有槽位都已完成（设备空闲），返回全部待释放资源
    pub fn complete_all(&mut self) -> Vec<R> {
        let mut released = Vec::new();
        for index in 0..self.slots.len() {
            released.extend(self.complete(index));
        }
        released
    }

    /// 已知完成的最大 Fence 值
    pub fn completed_fence(&self) -> FenceValue {
        self.completed_fence
    }

    pub fn last_fence(&self) -> FenceValue {
        self.last_fence
    }

    /// 是否有帧在录制或 GPU 上
    pub fn is_busy(&self) -> bool {
        self.state == FrameState::Recording || self.slots.iter().any(|s| s.in_flight)
    }

    /// 延迟销毁
    ///
    /// GPU 空闲且没有帧在录制时直接把资源交还调用方释放。
    pub fn retire(&mut self, resource: R) -> Option<R> {
        if !self.is_busy() {
            return Some(resource);
        }
        self.slots[self.current].retired.push(resource);
        None
    }

    /// 等待释放的资源总数
    pub fn pending_destructions(&self) -> usize {
        self.slots.iter().map(|s| s.retired.len()).sum()
    }
}

impl<R> Default for FrameRing<R> {
    fn default() -> Self {
        Self::new()
    }
}
