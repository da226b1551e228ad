use crate::commands::command::{CommandType, GfxCommand, Transition};
use crate::gfx_error::GfxError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// 一次队列提交
#[derive(Clone, Debug)]
pub struct Submission {
    pub queue_type: CommandType,
    pub list_name: String,
    pub commands: Vec<GfxCommand>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentRecord {
    pub frame_index: usize,
    pub allow_tearing: bool,
    pub fullscreen: bool,
}

/// 一次需要阻塞的 fence 等待
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FenceWait {
    pub fence_name: String,
    pub value: u64,
}

#[derive(Default)]
struct ProbeState {
    /// 下一次 direct 队列提交时返回的错误
    pending_faults: VecDeque<GfxError>,
    /// 下一次创建资源时返回的错误
    pending_create_failures: VecDeque<GfxError>,
    /// signal 的值不会立即完成，直到有人等待它
    hold_fences: bool,

    submissions: Vec<Submission>,
    presents: Vec<PresentRecord>,
    fence_waits: Vec<FenceWait>,

    devices_created: usize,
    live_devices: usize,
    live_objects: usize,
    fault_reports: usize,
}

/// headless 后端的观测与故障注入接口
///
/// 同一个 instance 创建的所有 device 共享同一个 probe，因此设备重建之后仍然可以观测。
#[derive(Clone, Default)]
pub struct HeadlessProbe {
    state: Arc<Mutex<ProbeState>>,
}

// 故障注入
impl HeadlessProbe {
    /// 下一次 direct 队列提交时设备被移除
    pub fn inject_device_removed(&self) {
        self.inject_fault(GfxError::DeviceRemoved("injected device removal".to_string()));
    }

    pub fn inject_fault(&self, error: GfxError) {
        self.lock().pending_faults.push_back(error);
    }

    /// 下一次创建 texture / buffer 时失败
    pub fn fail_next_resource(&self, error: GfxError) {
        self.lock().pending_create_failures.push_back(error);
    }

    /// 模拟异步的 GPU：被 signal 的值保持未完成，直到 CPU 等待该值
    pub fn hold_fences(&self, hold: bool) {
        self.lock().hold_fences = hold;
    }

    pub fn pending_fault_count(&self) -> usize {
        self.lock().pending_faults.len()
    }
}

// 观测
impl HeadlessProbe {
    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    /// 所有 direct 队列提交中的命令，按提交顺序展开
    pub fn direct_commands(&self) -> Vec<GfxCommand> {
        self.lock()
            .submissions
            .iter()
            .filter(|s| s.queue_type == CommandType::Direct)
            .flat_map(|s| s.commands.iter().cloned())
            .collect()
    }

    /// 所有已提交的 transition，按提交顺序展开
    pub fn transitions(&self) -> Vec<Transition> {
        self.lock()
            .submissions
            .iter()
            .flat_map(|s| s.commands.iter())
            .filter_map(|c| match c {
                GfxCommand::Transition(transitions) => Some(transitions.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn presents(&self) -> Vec<PresentRecord> {
        self.lock().presents.clone()
    }

    /// CPU 真正阻塞过的 fence 等待
    pub fn fence_waits(&self) -> Vec<FenceWait> {
        self.lock().fence_waits.clone()
    }

    /// 清空已记录的提交、present 与 fence 等待
    pub fn clear_records(&self) {
        let mut state = self.lock();
        state.submissions.clear();
        state.presents.clear();
        state.fence_waits.clear();
    }

    pub fn devices_created(&self) -> usize {
        self.lock().devices_created
    }

    pub fn live_devices(&self) -> usize {
        self.lock().live_devices
    }

    /// 所有 device 上尚未销毁的对象数量
    pub fn live_objects(&self) -> usize {
        self.lock().live_objects
    }

    pub fn fault_reports(&self) -> usize {
        self.lock().fault_reports
    }
}

// 后端内部使用
impl HeadlessProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn take_fault(&self) -> Option<GfxError> {
        self.lock().pending_faults.pop_front()
    }

    pub(crate) fn take_create_failure(&self) -> Option<GfxError> {
        self.lock().pending_create_failures.pop_front()
    }

    pub(crate) fn record_submission(&self, submission: Submission) {
        self.lock().submissions.push(submission);
    }

    pub(crate) fn fences_held(&self) -> bool {
        self.lock().hold_fences
    }

    pub(crate) fn record_fence_wait(&self, wait: FenceWait) {
        self.lock().fence_waits.push(wait);
    }

    pub(crate) fn record_present(&self, present: PresentRecord) {
        self.lock().presents.push(present);
    }

    pub(crate) fn on_device_created(&self) {
        let mut state = self.lock();
        state.devices_created += 1;
        state.live_devices += 1;
    }

    pub(crate) fn on_device_dropped(&self) {
        self.lock().live_devices -= 1;
    }

    pub(crate) fn on_object_created(&self) {
        self.lock().live_objects += 1;
    }

    pub(crate) fn on_object_destroyed(&self, count: usize) {
        self.lock().live_objects -= count;
    }

    pub(crate) fn on_fault_report(&self) {
        self.lock().fault_reports += 1;
    }
}
