//! 单次赋值的异步结果单元。
//!
//! # 教案式说明
//! - **意图 (Why)**：通道的每个出站操作都需要一个“稍后完成”的结果句柄：调用线程立即拿到句柄，
//!   事件循环线程在操作真正执行后写入结果。
//! - **逻辑 (How)**：
//!   - [`Promise`] 是写端，[`ChannelFuture`] 是只读视图，二者共享同一个 `Arc` 内部状态；
//!   - 结果只能写入一次，之后的 `try_*` 返回 `false`；
//!   - 监听器在完成线程上内联执行（已完成时注册则立即执行），`Waker` 用于 `async` 调用方，`Condvar` 用于阻塞等待。
//! - **契约 (What)**：
//!   - 取消等价于以 [`ChannelError::Cancelled`] 完成；`set_uncancellable` 之后取消无效；
//!   - 若 Promise 绑定了事件循环线程，在该线程上阻塞等待未完成的结果会立即返回 `BlockingOperation`。
//! - **风险 (Trade-offs)**：监听器内联执行意味着它们不应做阻塞操作；锁只保护状态切换，监听器在锁外执行。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ChannelError, Result};

type Listener<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct PromiseState<T> {
    outcome: Option<Result<T>>,
    uncancellable: bool,
    listeners: Vec<Listener<T>>,
    wakers: Vec<Waker>,
}

struct PromiseInner<T> {
    state: Mutex<PromiseState<T>>,
    done: Condvar,
    affinity: Option<ThreadId>,
}

/// 可写的结果单元。
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

/// 只读结果视图，实现 [`Future`]。
pub struct ChannelFuture<T> {
    inner: Arc<PromiseInner<T>>,
}

/// 通道操作使用的无返回值 Promise。
pub type ChannelPromise = Promise<()>;

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Clone for ChannelFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// 创建未绑定线程的 Promise。
    pub fn new() -> Self {
        Self::with_affinity(None)
    }

    /// 创建绑定到某个事件循环线程的 Promise。
    pub(crate) fn with_affinity(affinity: Option<ThreadId>) -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                state: Mutex::new(PromiseState {
                    outcome: None,
                    uncancellable: false,
                    listeners: Vec::new(),
                    wakers: Vec::new(),
                }),
                done: Condvar::new(),
                affinity,
            }),
        }
    }

    /// 以成功值创建已完成的 Promise。
    pub fn succeeded(value: T) -> Self {
        let promise = Self::new();
        promise.try_success(value);
        promise
    }

    /// 以失败原因创建已完成的 Promise。
    pub fn failed(cause: ChannelError) -> Self {
        let promise = Self::new();
        promise.try_failure(cause);
        promise
    }

    /// 返回只读视图。
    pub fn future(&self) -> ChannelFuture<T> {
        ChannelFuture {
            inner: Arc::clone(&self.inner),
        }
    }

    /// 尝试以成功完成；已完成时返回 `false`。
    pub fn try_success(&self, value: T) -> bool {
        self.complete(Ok(value), false)
    }

    /// 尝试以失败完成；已完成时返回 `false`。
    pub fn try_failure(&self, cause: ChannelError) -> bool {
        self.complete(Err(cause), false)
    }

    /// 尝试以给定结果完成。
    pub fn try_complete(&self, outcome: Result<T>) -> bool {
        self.complete(outcome, false)
    }

    /// 尝试取消；已完成或已标记不可取消时返回 `false`。
    pub fn cancel(&self) -> bool {
        self.complete(Err(ChannelError::Cancelled), true)
    }

    /// 标记为不可取消。
    ///
    /// 返回 `true` 表示已成功标记或已经以非取消结果完成；若已被取消则返回 `false`。
    pub fn set_uncancellable(&self) -> bool {
        let mut state = self.inner.state.lock();
        match &state.outcome {
            None => {
                state.uncancellable = true;
                true
            }
            Some(Err(ChannelError::Cancelled)) => false,
            Some(_) => true,
        }
    }

    fn complete(&self, outcome: Result<T>, cancelling: bool) -> bool {
        let (listeners, wakers, snapshot) = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() || (cancelling && state.uncancellable) {
                return false;
            }
            let snapshot = if state.listeners.is_empty() {
                None
            } else {
                Some(outcome.clone())
            };
            state.outcome = Some(outcome);
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
                snapshot,
            )
        };
        self.inner.done.notify_all();
        for waker in wakers {
            waker.wake();
        }
        if let Some(outcome) = snapshot {
            for listener in listeners {
                listener(&outcome);
            }
        }
        true
    }

    /// 把另一个结果视图的结果转发到本 Promise。
    pub fn cascade_from(&self, source: &ChannelFuture<T>) {
        let target = self.clone();
        source.add_listener(move |outcome| {
            target.try_complete(outcome.clone());
        });
    }
}

impl<T: Clone + Send + 'static> ChannelFuture<T> {
    /// 是否已完成（成功、失败或取消）。
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// 是否以成功完成。
    pub fn is_success(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Ok(_)))
    }

    /// 是否被取消。
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.inner.state.lock().outcome,
            Some(Err(ChannelError::Cancelled))
        )
    }

    /// 失败原因；未完成或成功时为 `None`。
    pub fn cause(&self) -> Option<ChannelError> {
        match &self.inner.state.lock().outcome {
            Some(Err(cause)) => Some(cause.clone()),
            _ => None,
        }
    }

    /// 非阻塞读取结果。
    pub fn outcome(&self) -> Option<Result<T>> {
        self.inner.state.lock().outcome.clone()
    }

    /// 注册完成监听器；已完成时在当前线程立即执行。
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let ready = {
            let mut state = self.inner.state.lock();
            match &state.outcome {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        if let Some(outcome) = ready {
            listener(&outcome);
        }
    }

    /// 阻塞等待结果。
    ///
    /// # 契约 (What)
    /// - 若当前线程就是负责完成该结果的事件循环线程且结果尚未就绪，立即返回 `BlockingOperation`。
    pub fn wait(&self) -> Result<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.check_deadlock()?;
            self.inner.done.wait(&mut state);
        }
    }

    /// 带超时的阻塞等待；超时返回 `None`。
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            if let Err(error) = self.check_deadlock() {
                return Some(Err(error));
            }
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return state.outcome.clone();
            }
        }
    }

    fn check_deadlock(&self) -> Result<()> {
        match self.inner.affinity {
            Some(owner) if owner == thread::current().id() => Err(ChannelError::BlockingOperation),
            _ => Ok(()),
        }
    }
}

impl<T: Clone + Send + 'static> Future for ChannelFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Promise")
            .field("done", &state.outcome.is_some())
            .field("uncancellable", &state.uncancellable)
            .finish()
    }
}

impl<T> fmt::Debug for ChannelFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ChannelFuture")
            .field("done", &state.outcome.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completes_exactly_once() {
        let promise = ChannelPromise::new();
        assert!(promise.try_success(()));
        assert!(!promise.try_failure(ChannelError::closed("late")));
        assert!(!promise.cancel());
        assert!(promise.future().is_success());
    }

    #[test]
    fn uncancellable_promise_ignores_cancel() {
        let promise = ChannelPromise::new();
        assert!(promise.set_uncancellable());
        assert!(!promise.cancel());
        assert!(!promise.future().is_done());
        assert!(promise.try_failure(ChannelError::NotYetConnected));
        assert_eq!(
            promise.future().cause().map(|c| c.code()),
            Some("spark.channel.not_yet_connected")
        );
    }

    #[test]
    fn cancelled_promise_refuses_uncancellable() {
        let promise = ChannelPromise::new();
        assert!(promise.cancel());
        assert!(!promise.set_uncancellable());
        assert!(promise.future().is_cancelled());
    }

    #[test]
    fn listeners_run_once_before_and_after_completion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let promise = Promise::<u32>::new();
        let future = promise.future();
        let c = Arc::clone(&counter);
        future.add_listener(move |outcome| {
            assert_eq!(outcome.as_ref().ok(), Some(&7));
            c.fetch_add(1, Ordering::SeqCst);
        });
        promise.try_success(7);
        let c = Arc::clone(&counter);
        future.add_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_blocks_until_other_thread_completes() {
        let promise = Promise::<&'static str>::new();
        let future = promise.future();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            promise.try_success("done");
        });
        assert_eq!(future.wait().ok(), Some("done"));
        handle.join().expect("completer thread");
    }

    #[test]
    fn wait_on_affine_thread_is_rejected() {
        let promise = ChannelPromise::with_affinity(Some(thread::current().id()));
        let error = promise.future().wait().expect_err("must not block");
        assert!(matches!(error, ChannelError::BlockingOperation));
        assert!(promise.future().wait_timeout(Duration::from_millis(1)).is_some());
    }

    #[test]
    fn wait_timeout_expires_without_result() {
        let promise = ChannelPromise::new();
        assert!(promise.future().wait_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn future_resolves_in_async_context() {
        let promise = Promise::<u8>::new();
        let future = promise.future();
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            promise.try_success(3);
        });
        let value = futures::executor::block_on(future).expect("success");
        assert_eq!(value, 3);
        completer.join().expect("completer thread");
    }

    #[test]
    fn cascade_forwards_outcome() {
        let source = ChannelPromise::new();
        let target = ChannelPromise::new();
        target.cascade_from(&source.future());
        source.try_failure(ChannelError::AlreadyConnected);
        assert!(matches!(
            target.future().cause(),
            Some(ChannelError::AlreadyConnected)
        ));
    }
}
