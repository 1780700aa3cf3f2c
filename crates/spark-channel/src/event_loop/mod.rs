//! 单线程事件循环。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 为一组通道提供顺序与线程亲和：同一通道的处理器回调、底层操作、出站缓冲变更都在同一线程上串行执行；
//! - 其他线程通过 [`EventLoop::execute`] 把调用编组进来，调用方立即拿到 Future。
//!
//! ## 逻辑 (How)
//! - 一个 `parking_lot::Mutex` 保护 FIFO 任务队列与按截止时间排序的定时堆，`Condvar` 负责唤醒；
//! - 每轮循环先把已到期的定时任务按（截止时间、提交序号）顺序搬入 FIFO 队列，再取队首执行；
//! - 任务在 `catch_unwind` 边界内执行，panic 交给可插拔回调，后续任务照常运行；
//! - 优雅关闭：停止接受外部提交，关闭已注册通道，排空队列；静默期内无新任务或超过超时后终止线程。
//!
//! ## 契约 (What)
//! - 同一循环上提交的任务按提交顺序执行；定时任务按截止时间执行，截止时间相同者按提交顺序；
//! - 关闭期间来自循环线程自身的提交仍被接受，保证关闭链路能够走完；
//! - 终止后所有提交返回 `Rejected`，未执行的定时任务以 `Cancelled` 完成。
//!
//! ## 风险 (Trade-offs)
//! - 每个循环独占一个操作系统线程；阻塞的任务会拖住该循环上的所有通道。

mod group;
mod scheduled;

pub use group::EventLoopGroup;
pub use scheduled::ScheduledHandle;

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::channel::{Channel, ChannelId, WeakChannel};
use crate::config::{EventLoopConfig, TaskPanicHandler};
use crate::error::{ChannelError, Result, panic_message};
use crate::future::{ChannelFuture, ChannelPromise, Promise};

use scheduled::{BoxedTask, ScheduledEntry, ScheduledTask};

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const TERMINATED: u8 = 2;

/// 任务 panic 的描述，交给 [`EventLoopConfig::with_panic_handler`] 注入的回调。
#[derive(Clone, Debug)]
pub struct TaskPanic {
    event_loop: String,
    message: String,
}

impl TaskPanic {
    /// 发生 panic 的事件循环名称。
    pub fn event_loop(&self) -> &str {
        &self.event_loop
    }

    /// panic 文本。
    pub fn message(&self) -> &str {
        &self.message
    }
}

enum Task {
    Plain(BoxedTask),
    Scheduled(Arc<ScheduledTask>),
}

struct ShutdownPlan {
    quiet_period: Duration,
    deadline: Instant,
    channels_closed: bool,
}

struct Queues {
    tasks: VecDeque<Task>,
    scheduled: BinaryHeap<ScheduledEntry>,
    /// 仍留在 `scheduled` 中的已取消任务数。
    cancelled_scheduled: usize,
    next_seq: u64,
    shutdown: Option<ShutdownPlan>,
    terminated: bool,
    last_activity: Instant,
}

enum Step {
    Run(Task),
    BeginShutdown(Vec<ScheduledEntry>),
    Terminate,
}

pub(crate) struct LoopInner {
    name: String,
    queues: Mutex<Queues>,
    wakeup: Condvar,
    state: AtomicU8,
    thread: OnceLock<ThreadId>,
    panic_handler: TaskPanicHandler,
    default_quiet_period: Duration,
    default_shutdown_timeout: Duration,
    max_reentrant_depth: usize,
    reentrant_depth: AtomicUsize,
    channels: Mutex<HashMap<ChannelId, WeakChannel>>,
    termination: ChannelPromise,
}

/// 事件循环句柄，可廉价克隆。
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

/// 可重入深度守卫，析构时归还一层深度。
pub struct ReentrancyGuard {
    event_loop: EventLoop,
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        self.event_loop
            .inner
            .reentrant_depth
            .fetch_sub(1, Ordering::Relaxed);
    }
}

impl EventLoop {
    /// 以给定配置启动事件循环线程。
    pub fn new(config: EventLoopConfig) -> Result<Self> {
        let panic_handler = config
            .panic_handler
            .clone()
            .unwrap_or_else(|| Arc::new(log_task_panic));
        let inner = Arc::new(LoopInner {
            name: config.name.clone(),
            queues: Mutex::new(Queues {
                tasks: VecDeque::new(),
                scheduled: BinaryHeap::new(),
                cancelled_scheduled: 0,
                next_seq: 0,
                shutdown: None,
                terminated: false,
                last_activity: Instant::now(),
            }),
            wakeup: Condvar::new(),
            state: AtomicU8::new(RUNNING),
            thread: OnceLock::new(),
            panic_handler,
            default_quiet_period: config.quiet_period,
            default_shutdown_timeout: config.shutdown_timeout,
            max_reentrant_depth: config.max_reentrant_depth,
            reentrant_depth: AtomicUsize::new(0),
            channels: Mutex::new(HashMap::new()),
            termination: ChannelPromise::new(),
        });
        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || run(worker))
            .map_err(|error| {
                ChannelError::illegal_state(format!(
                    "failed to spawn event loop thread `{}`: {error}",
                    config.name
                ))
            })?;
        // 任务只能在构造返回之后提交，线程标识在此之前已经就绪。
        let installed = inner.thread.set(handle.thread().id()).is_ok();
        debug_assert!(installed, "event loop thread id recorded twice");
        Ok(Self { inner })
    }

    /// 以线程名和默认参数启动事件循环。
    pub fn with_name(name: impl Into<String>) -> Result<Self> {
        Self::new(EventLoopConfig::new(name))
    }

    /// 名称。
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 当前线程是否为本循环线程。
    pub fn in_event_loop(&self) -> bool {
        self.inner.thread.get() == Some(&thread::current().id())
    }

    /// 两个句柄是否指向同一个循环。
    pub fn same(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 是否已进入关闭流程（包括已终止）。
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) >= SHUTTING_DOWN
    }

    /// 是否已终止。
    pub fn is_terminated(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == TERMINATED
    }

    /// 创建绑定到本循环线程的 Promise：在循环线程上阻塞等待它会立即失败。
    pub fn new_promise<T: Clone + Send + 'static>(&self) -> Promise<T> {
        Promise::with_affinity(self.inner.thread.get().copied())
    }

    /// 提交立即执行的任务。
    ///
    /// # 契约 (What)
    /// - 同一循环上的任务按提交顺序执行；
    /// - 关闭后来自其他线程的提交返回 `Rejected`，来自循环线程自身的提交在终止前仍被接受。
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let in_loop = self.in_event_loop();
        {
            let mut queues = self.inner.queues.lock();
            self.ensure_accepting(&queues, in_loop)?;
            queues.tasks.push_back(Task::Plain(Box::new(task)));
        }
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// 提交任务并返回其结果 Future；任务 panic 时以 `TaskPanicked` 失败。
    pub fn submit<T, F>(&self, task: F) -> ChannelFuture<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = self.new_promise::<T>();
        let completer = promise.clone();
        let submitted = self.execute(move || match catch_unwind(AssertUnwindSafe(task)) {
            Ok(value) => {
                completer.try_success(value);
            }
            Err(payload) => {
                completer.try_failure(ChannelError::TaskPanicked {
                    message: panic_message(payload.as_ref()),
                });
            }
        });
        if let Err(error) = submitted {
            promise.try_failure(error);
        }
        promise.future()
    }

    /// 延迟 `delay` 后执行任务。
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<ScheduledHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// 在绝对截止时间执行任务；截止时间相同者按提交顺序执行。
    pub fn schedule_at<F>(&self, deadline: Instant, task: F) -> Result<ScheduledHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let in_loop = self.in_event_loop();
        let scheduled = ScheduledTask::new(Box::new(task), self.new_promise());
        {
            let mut queues = self.inner.queues.lock();
            self.ensure_accepting(&queues, in_loop)?;
            let seq = queues.next_seq;
            queues.next_seq += 1;
            queues.scheduled.push(ScheduledEntry {
                deadline,
                seq,
                task: Arc::clone(&scheduled),
            });
        }
        self.inner.wakeup.notify_one();
        Ok(ScheduledHandle::new(scheduled, Arc::downgrade(&self.inner)))
    }

    fn ensure_accepting(&self, queues: &Queues, in_loop: bool) -> Result<()> {
        if queues.terminated || (queues.shutdown.is_some() && !in_loop) {
            return Err(ChannelError::Rejected {
                event_loop: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    /// 把通道注册到本循环。
    pub fn register(&self, channel: &Channel) -> ChannelFuture<()> {
        let promise = self.new_promise();
        channel
            .unsafe_ops()
            .register(self.clone(), promise.clone());
        promise.future()
    }

    pub(crate) fn track(&self, channel: &Channel) {
        self.inner
            .channels
            .lock()
            .insert(channel.id(), channel.downgrade());
    }

    pub(crate) fn untrack(&self, id: ChannelId) {
        self.inner.channels.lock().remove(&id);
    }

    /// 定时堆中尚未出队的任务数，包括还未清理掉的已取消任务。
    pub fn pending_scheduled_tasks(&self) -> usize {
        self.inner.queues.lock().scheduled.len()
    }

    /// 当前注册在本循环上的通道数。
    pub fn registered_channels(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// 进入一层可重入区域；已达到 `limit` 时返回 `None`，调用方应改为编组执行。
    ///
    /// 只能在循环线程上调用；深度计数由循环自身持有，不依赖线程局部变量。
    pub fn enter_reentrant(&self, limit: usize) -> Option<ReentrancyGuard> {
        let depth = self.inner.reentrant_depth.load(Ordering::Relaxed);
        if depth >= limit {
            return None;
        }
        self.inner
            .reentrant_depth
            .store(depth + 1, Ordering::Relaxed);
        Some(ReentrancyGuard {
            event_loop: self.clone(),
        })
    }

    /// 当前可重入深度。
    pub fn reentrant_depth(&self) -> usize {
        self.inner.reentrant_depth.load(Ordering::Relaxed)
    }

    /// 配置的可重入深度上限。
    pub fn max_reentrant_depth(&self) -> usize {
        self.inner.max_reentrant_depth
    }

    /// 以配置中的默认静默期与超时优雅关闭。
    pub fn shutdown(&self) -> ChannelFuture<()> {
        self.shutdown_gracefully(
            self.inner.default_quiet_period,
            self.inner.default_shutdown_timeout,
        )
    }

    /// 优雅关闭。
    ///
    /// # 契约 (What)
    /// - 立即拒绝来自其他线程的新提交；
    /// - 循环线程关闭所有已注册通道（未完成的写入因此失败），取消未执行的定时任务，排空队列；
    /// - 最近 `quiet_period` 内没有任务执行，或自调用起超过 `timeout` 时线程终止；
    /// - 返回终止 Future；重复调用返回同一个 Future。
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> ChannelFuture<()> {
        {
            let mut queues = self.inner.queues.lock();
            if queues.shutdown.is_none() && !queues.terminated {
                let now = Instant::now();
                queues.shutdown = Some(ShutdownPlan {
                    quiet_period,
                    deadline: now + timeout.max(quiet_period),
                    channels_closed: false,
                });
                queues.last_activity = now;
                self.inner.state.store(SHUTTING_DOWN, Ordering::Release);
                debug!(event_loop = %self.inner.name, ?quiet_period, ?timeout, "event loop shutting down");
            }
        }
        self.inner.wakeup.notify_all();
        self.termination_future()
    }

    /// 终止 Future。
    pub fn termination_future(&self) -> ChannelFuture<()> {
        self.inner.termination.future()
    }

    /// 阻塞等待终止；超时返回 `Ok(false)`。
    ///
    /// 在尚未终止的本循环线程上调用立即返回 `BlockingOperation`。
    pub fn await_termination(&self, timeout: Duration) -> Result<bool> {
        if self.in_event_loop() && !self.is_terminated() {
            return Err(ChannelError::BlockingOperation);
        }
        Ok(matches!(
            self.inner.termination.future().wait_timeout(timeout),
            Some(Ok(()))
        ))
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.load(Ordering::Acquire))
            .finish()
    }
}

fn log_task_panic(panic: &TaskPanic) {
    error!(event_loop = %panic.event_loop, message = %panic.message, "task raised an exception");
}

fn run(inner: Arc<LoopInner>) {
    debug!(event_loop = %inner.name, "event loop started");
    loop {
        match inner.next_step() {
            Step::Run(task) => inner.run_task(task),
            Step::BeginShutdown(cancelled) => {
                for entry in cancelled {
                    entry.task.cancel();
                }
                inner.close_registered_channels();
            }
            Step::Terminate => break,
        }
    }
    inner.terminate();
}

impl Queues {
    fn take_scheduled(&mut self) -> Vec<ScheduledEntry> {
        self.cancelled_scheduled = 0;
        let taken = std::mem::take(&mut self.scheduled).into_vec();
        for entry in &taken {
            entry.task.mark_dequeued();
        }
        taken
    }

    /// 已取消项超过堆的一半时重建定时堆，摊还代价与取消次数成正比。
    fn purge_cancelled(&mut self) {
        if self.cancelled_scheduled * 2 <= self.scheduled.len() {
            return;
        }
        let before = self.scheduled.len();
        self.scheduled.retain(|entry| !entry.task.is_cancelled());
        self.cancelled_scheduled = 0;
        trace!(
            purged = before - self.scheduled.len(),
            remaining = self.scheduled.len(),
            "purged cancelled scheduled tasks"
        );
    }
}

impl LoopInner {
    /// 取消定时任务：状态迁移与清理计数在队列锁内完成，释放动作与完成通知在锁外进行。
    pub(crate) fn cancel_scheduled(&self, task: &ScheduledTask) -> bool {
        {
            let mut queues = self.queues.lock();
            if !task.mark_cancelled() {
                return false;
            }
            if !task.is_dequeued() {
                queues.cancelled_scheduled += 1;
                queues.purge_cancelled();
            }
        }
        task.finish_cancel();
        true
    }

    fn next_step(&self) -> Step {
        let mut guard = self.queues.lock();
        loop {
            let now = Instant::now();
            let wake_at = {
                let queues = &mut *guard;
                while queues
                    .scheduled
                    .peek()
                    .is_some_and(|entry| entry.deadline <= now)
                {
                    if let Some(entry) = queues.scheduled.pop() {
                        entry.task.mark_dequeued();
                        if entry.task.is_cancelled() {
                            queues.cancelled_scheduled = queues.cancelled_scheduled.saturating_sub(1);
                            continue;
                        }
                        queues.tasks.push_back(Task::Scheduled(entry.task));
                    }
                }
                if let Some(task) = queues.tasks.pop_front() {
                    queues.last_activity = now;
                    return Step::Run(task);
                }
                match queues.shutdown.as_mut() {
                    Some(plan) => {
                        if !plan.channels_closed {
                            plan.channels_closed = true;
                            let cancelled = queues.take_scheduled();
                            return Step::BeginShutdown(cancelled);
                        }
                        let quiet_until = queues.last_activity + plan.quiet_period;
                        if now >= plan.deadline || now >= quiet_until {
                            queues.terminated = true;
                            return Step::Terminate;
                        }
                        let wake_at = plan.deadline.min(quiet_until);
                        Some(
                            queues
                                .scheduled
                                .peek()
                                .map_or(wake_at, |entry| wake_at.min(entry.deadline)),
                        )
                    }
                    None => queues.scheduled.peek().map(|entry| entry.deadline),
                }
            };
            match wake_at {
                Some(deadline) => {
                    self.wakeup.wait_until(&mut guard, deadline);
                }
                None => self.wakeup.wait(&mut guard),
            }
        }
    }

    fn run_task(&self, task: Task) {
        match task {
            Task::Plain(action) => {
                self.guarded(action);
            }
            Task::Scheduled(scheduled) => {
                if let Some(action) = scheduled.begin() {
                    match self.guarded(action) {
                        Ok(()) => scheduled.completion().try_success(()),
                        Err(message) => scheduled
                            .completion()
                            .try_failure(ChannelError::TaskPanicked { message }),
                    };
                }
            }
        }
    }

    fn guarded(&self, action: BoxedTask) -> std::result::Result<(), String> {
        match catch_unwind(AssertUnwindSafe(action)) {
            Ok(()) => Ok(()),
            Err(payload) => {
                let panic = TaskPanic {
                    event_loop: self.name.clone(),
                    message: panic_message(payload.as_ref()),
                };
                let handler = Arc::clone(&self.panic_handler);
                if catch_unwind(AssertUnwindSafe(|| handler(&panic))).is_err() {
                    error!(event_loop = %self.name, "task panic handler panicked");
                }
                Err(panic.message)
            }
        }
    }

    fn close_registered_channels(&self) {
        let channels: Vec<WeakChannel> = self.channels.lock().values().cloned().collect();
        for channel in channels.into_iter().filter_map(|weak| weak.upgrade()) {
            debug!(event_loop = %self.name, channel = %channel.id(), "closing channel on shutdown");
            let promise = channel.new_promise();
            channel.unsafe_ops().close(promise);
        }
    }

    fn terminate(&self) {
        let leftovers = {
            let mut queues = self.queues.lock();
            queues.terminated = true;
            let scheduled = queues.take_scheduled();
            let tasks = std::mem::take(&mut queues.tasks);
            (scheduled, tasks)
        };
        for entry in leftovers.0 {
            entry.task.cancel();
        }
        drop(leftovers.1);
        self.channels.lock().clear();
        self.state.store(TERMINATED, Ordering::Release);
        debug!(event_loop = %self.name, "event loop terminated");
        self.termination.try_success(());
    }
}
