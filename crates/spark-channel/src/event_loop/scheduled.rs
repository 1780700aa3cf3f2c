use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::future::{ChannelFuture, ChannelPromise};

use super::LoopInner;

pub(crate) type BoxedTask = Box<dyn FnOnce() + Send + 'static>;

const WAITING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// 定时任务的共享状态。
///
/// 状态只会单向迁移：`WAITING → RUNNING` 或 `WAITING → CANCELLED`。
/// 通过句柄取消的任务计入所属循环的清理计数，已取消项过半时整堆重建；
/// 残留在堆中的已取消项到期出队时直接丢弃。
pub(crate) struct ScheduledTask {
    state: AtomicU8,
    dequeued: AtomicBool,
    action: Mutex<Option<BoxedTask>>,
    completion: ChannelPromise,
}

impl ScheduledTask {
    pub(crate) fn new(action: BoxedTask, completion: ChannelPromise) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WAITING),
            dequeued: AtomicBool::new(false),
            action: Mutex::new(Some(action)),
            completion,
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// 任务已离开定时堆；只在持有队列锁时读写。
    pub(crate) fn is_dequeued(&self) -> bool {
        self.dequeued.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_dequeued(&self) {
        self.dequeued.store(true, Ordering::Relaxed);
    }

    /// 抢占执行权；已取消时返回 `None`。
    pub(crate) fn begin(&self) -> Option<BoxedTask> {
        self.state
            .compare_exchange(WAITING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.completion.set_uncancellable();
        self.action.lock().take()
    }

    pub(crate) fn completion(&self) -> &ChannelPromise {
        &self.completion
    }

    /// 只迁移状态；动作的释放与完成通知由 [`ScheduledTask::finish_cancel`] 在锁外进行。
    pub(crate) fn mark_cancelled(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_cancel(&self) {
        drop(self.action.lock().take());
        self.completion.cancel();
    }

    pub(crate) fn cancel(&self) -> bool {
        if !self.mark_cancelled() {
            return false;
        }
        self.finish_cancel();
        true
    }
}

/// 截止时间有序队列中的一项；`seq` 保证同一截止时间按提交顺序出队。
pub(crate) struct ScheduledEntry {
    pub(crate) deadline: Instant,
    pub(crate) seq: u64,
    pub(crate) task: Arc<ScheduledTask>,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    // `BinaryHeap` 是大顶堆，反转比较得到“最早截止、最小序号”优先。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// 定时任务句柄。
///
/// # 契约 (What)
/// - [`ScheduledHandle::cancel`] 在任务开始执行前有效，之后调用是安全的空操作并返回 `false`；
/// - 取消可以在任意线程上发生，被取消的任务不会一直占用定时堆直到截止时间；
/// - [`ScheduledHandle::completion`] 在任务执行完毕后成功，被取消时以 `Cancelled` 完成。
#[derive(Clone)]
pub struct ScheduledHandle {
    task: Arc<ScheduledTask>,
    event_loop: Weak<LoopInner>,
}

impl ScheduledHandle {
    pub(crate) fn new(task: Arc<ScheduledTask>, event_loop: Weak<LoopInner>) -> Self {
        Self { task, event_loop }
    }

    /// 取消尚未执行的任务。
    pub fn cancel(&self) -> bool {
        match self.event_loop.upgrade() {
            Some(inner) => inner.cancel_scheduled(&self.task),
            None => self.task.cancel(),
        }
    }

    /// 是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// 任务完成视图。
    pub fn completion(&self) -> ChannelFuture<()> {
        self.task.completion.future()
    }
}

impl std::fmt::Debug for ScheduledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("state", &self.task.state.load(Ordering::Acquire))
            .finish()
    }
}
