use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::address::SocketAddress;
use crate::error::ChannelError;
use crate::event_loop::EventLoop;
use crate::future::ChannelPromise;
use crate::message::PipelineMessage;

use super::{Channel, ConnectStatus, Transport};

/// 传输相关的底层操作。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 流水线的 head 把出站事件转交到这里；这里实现与具体介质无关的通用状态机，
///   再通过 [`Transport`] 钩子执行介质相关的最小动作。
///
/// ## 逻辑 (How)
/// - `register`：跨线程调用时把 `register0` 编组到目标循环；注册失败则强制关闭且不触发用户事件；
/// - `connect`：重复连接立即失败（已连接 / 连接挂起）；挂起的连接在循环上调度超时任务，到期后失败 Promise 并关闭；
/// - `close`：幂等；取走出站缓冲使后续写入立即失败，失败挂起的连接，关闭底层资源，
///   失败已冲刷与未冲刷的写入，最后在循环上触发 inactive 与注销；
/// - `flush`：把未冲刷区段推进为已冲刷，再交给 `do_write`；写失败会失败全部已冲刷条目并关闭通道。
///
/// ## 契约 (What)
/// - 除 `register` 外，全部方法只能在通道所属事件循环线程上调用；
/// - 每个 Promise 在此处恰好完成一次。
pub struct ChannelUnsafe<'a> {
    channel: &'a Channel,
}

impl<'a> ChannelUnsafe<'a> {
    pub(crate) fn new(channel: &'a Channel) -> Self {
        Self { channel }
    }

    fn transport(&self) -> &dyn Transport {
        self.channel.transport()
    }

    /// 注册到事件循环；可从任意线程调用。
    pub fn register(&self, event_loop: EventLoop, promise: ChannelPromise) {
        let inner = self.channel.inner();
        if inner.registered.load(Ordering::Acquire) {
            promise.try_failure(ChannelError::AlreadyRegistered);
            return;
        }
        if !self.transport().is_compatible(&event_loop) {
            promise.try_failure(ChannelError::IncompatibleEventLoop {
                context: format!("transport cannot run on event loop `{}`", event_loop.name()),
            });
            return;
        }
        let bound = inner.event_loop.get_or_init(|| event_loop.clone());
        if !bound.same(&event_loop) {
            promise.try_failure(ChannelError::IncompatibleEventLoop {
                context: format!("channel is bound to event loop `{}`", bound.name()),
            });
            return;
        }
        if event_loop.in_event_loop() {
            self.register0(promise);
            return;
        }
        let channel = self.channel.clone();
        let task_promise = promise.clone();
        if let Err(error) = event_loop.execute(move || channel.unsafe_ops().register0(task_promise)) {
            warn!(
                channel = %self.channel.id(),
                %error,
                "force-closing a channel whose registration task was not accepted by an event loop"
            );
            self.close_forcibly();
            inner.close_promise.try_success(());
            promise.try_failure(error);
        }
    }

    fn register0(&self, promise: ChannelPromise) {
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let inner = self.channel.inner();
        let first_registration = inner.never_registered.load(Ordering::Acquire);
        if let Err(error) = self.transport().do_register(self.channel) {
            self.close_forcibly();
            inner.close_promise.try_success(());
            promise.try_failure(error);
            return;
        }
        inner.never_registered.store(false, Ordering::Release);
        inner.registered.store(true, Ordering::Release);
        if let Some(event_loop) = self.channel.event_loop() {
            event_loop.track(self.channel);
        }
        let pipeline = self.channel.pipeline();
        pipeline.invoke_handler_added_if_needed();
        promise.try_success(());
        pipeline.fire_channel_registered();
        if self.channel.is_active() {
            if first_registration {
                pipeline.fire_channel_active();
            } else if self.channel.config().auto_read() {
                self.begin_read();
            }
        }
    }

    /// 绑定本端地址；由未激活变为激活时稍后触发 `channel_active`。
    pub fn bind(&self, local: SocketAddress, promise: ChannelPromise) {
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let was_active = self.channel.is_active();
        if let Err(error) = self.transport().do_bind(self.channel, &local) {
            promise.try_failure(error);
            self.close_if_closed();
            return;
        }
        if !was_active && self.channel.is_active() {
            self.invoke_later(|channel| channel.pipeline().fire_channel_active());
        }
        promise.try_success(());
    }

    /// 发起连接。
    pub fn connect(
        &self,
        remote: SocketAddress,
        local: Option<SocketAddress>,
        promise: ChannelPromise,
    ) {
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let inner = self.channel.inner();
        if inner.connect.lock().promise.is_some() {
            promise.try_failure(ChannelError::ConnectionPending);
            return;
        }
        if self.channel.is_active() {
            promise.try_failure(ChannelError::AlreadyConnected);
            self.channel
                .pipeline()
                .fire_exception_caught(ChannelError::AlreadyConnected);
            return;
        }
        match self
            .transport()
            .do_connect(self.channel, &remote, local.as_ref())
        {
            Ok(ConnectStatus::Connected) => self.fulfill_connect(&promise, false),
            Ok(ConnectStatus::Pending) => {
                let timeout_handle = self.schedule_connect_timeout(&remote);
                let mut pending = inner.connect.lock();
                pending.promise = Some(promise);
                pending.remote = Some(remote);
                pending.timeout = timeout_handle;
            }
            Err(error) => {
                debug!(channel = %self.channel.id(), %remote, %error, "connect failed");
                promise.try_failure(error);
                self.close(self.channel.new_promise());
            }
        }
    }

    fn schedule_connect_timeout(
        &self,
        remote: &SocketAddress,
    ) -> Option<crate::event_loop::ScheduledHandle> {
        let timeout = self.channel.config().connect_timeout();
        if timeout.is_zero() {
            return None;
        }
        let event_loop = self.channel.event_loop()?;
        let channel = self.channel.clone();
        let remote = remote.clone();
        event_loop
            .schedule(timeout, move || {
                let expired = {
                    let mut pending = channel.inner().connect.lock();
                    pending.timeout = None;
                    pending.remote = None;
                    pending.promise.take()
                };
                if let Some(promise) = expired
                    && promise.try_failure(ChannelError::ConnectTimeout { remote, timeout })
                {
                    channel.unsafe_ops().close(channel.new_promise());
                }
            })
            .ok()
    }

    fn fulfill_connect(&self, promise: &ChannelPromise, was_active: bool) {
        let active = self.channel.is_active();
        let promised = promise.try_success(());
        if !was_active && active {
            self.channel.pipeline().fire_channel_active();
        }
        if !promised {
            self.close(self.channel.new_promise());
        }
    }

    /// 完成挂起的连接：成功时触发 `channel_active`，失败时关闭通道。
    ///
    /// 由传输实现在连接真正建立后于本循环上调用；没有挂起连接（已超时或已关闭）时为空操作。
    pub fn finish_connect(&self) {
        let (promise, timeout) = {
            let mut pending = self.channel.inner().connect.lock();
            pending.remote = None;
            (pending.promise.take(), pending.timeout.take())
        };
        if let Some(timeout) = timeout {
            timeout.cancel();
        }
        let Some(promise) = promise else {
            return;
        };
        match self.transport().do_finish_connect(self.channel) {
            Ok(()) if self.channel.is_active() => {
                if promise.try_success(()) {
                    self.channel.pipeline().fire_channel_active();
                } else {
                    self.close(self.channel.new_promise());
                }
            }
            Ok(()) => {
                promise.try_failure(ChannelError::closed("connection was not established"));
                self.close_if_closed();
            }
            Err(error) => {
                promise.try_failure(error);
                self.close(self.channel.new_promise());
            }
        }
    }

    /// 断开连接；由激活变为未激活时稍后触发 `channel_inactive`。
    pub fn disconnect(&self, promise: ChannelPromise) {
        if !promise.set_uncancellable() {
            return;
        }
        let was_active = self.channel.is_active();
        if let Err(error) = self.transport().do_disconnect(self.channel) {
            promise.try_failure(error);
            self.close_if_closed();
            return;
        }
        if was_active && !self.channel.is_active() {
            self.invoke_later(|channel| channel.pipeline().fire_channel_inactive());
        }
        promise.try_success(());
        self.close_if_closed();
    }

    /// 关闭通道；幂等，重复调用在首次关闭完成时成功。
    pub fn close(&self, promise: ChannelPromise) {
        self.close_with(promise, ChannelError::closed("channel closed"));
    }

    fn close_with(&self, promise: ChannelPromise, cause: ChannelError) {
        if !promise.set_uncancellable() {
            return;
        }
        let inner = self.channel.inner();
        if inner.close_initiated.swap(true, Ordering::AcqRel) {
            let close_future = self.channel.close_future();
            close_future.add_listener(move |_| {
                promise.try_success(());
            });
            return;
        }
        let was_active = self.channel.is_active();
        let buffer = inner.outbound.lock().take();
        let (pending, timeout) = {
            let mut connect = inner.connect.lock();
            connect.remote = None;
            (connect.promise.take(), connect.timeout.take())
        };
        if let Some(timeout) = timeout {
            timeout.cancel();
        }
        if let Some(pending) = pending {
            pending.try_failure(ChannelError::closed(
                "channel closed before the connection was established",
            ));
        }
        let closed = self.transport().do_close(self.channel);
        inner.close_promise.try_success(());
        match closed {
            Ok(()) => promise.try_success(()),
            Err(error) => {
                warn!(channel = %self.channel.id(), %error, "failed to close a channel");
                promise.try_failure(error)
            }
        };
        if let Some(buffer) = buffer {
            buffer.fail_flushed(cause.clone(), false);
            if let Err(error) = buffer.close(cause) {
                warn!(channel = %self.channel.id(), %error, "failed to close the outbound buffer");
            }
        }
        if inner.in_flush0.load(Ordering::Acquire) {
            self.invoke_later(move |channel| {
                channel
                    .unsafe_ops()
                    .fire_inactive_and_deregister(was_active)
            });
        } else {
            self.fire_inactive_and_deregister(was_active);
        }
    }

    fn fire_inactive_and_deregister(&self, was_active: bool) {
        let fire_inactive = was_active && !self.channel.is_active();
        self.deregister_with(self.channel.new_promise(), fire_inactive);
    }

    /// 关闭底层资源，不触发任何用户可见事件；用于注册本身失败的场景。
    pub fn close_forcibly(&self) {
        if let Err(error) = self.transport().do_close(self.channel) {
            warn!(channel = %self.channel.id(), %error, "failed to close a channel forcibly");
        }
    }

    /// 从事件循环注销。
    pub fn deregister(&self, promise: ChannelPromise) {
        self.deregister_with(promise, false);
    }

    fn deregister_with(&self, promise: ChannelPromise, fire_inactive: bool) {
        if !promise.set_uncancellable() {
            return;
        }
        if !self.channel.is_registered() {
            promise.try_success(());
            return;
        }
        // 注销总是延后一轮执行，保证当前调用栈上的事件先走完。
        self.invoke_later(move |channel| {
            if let Err(error) = channel.transport().do_deregister(channel) {
                warn!(channel = %channel.id(), %error, "unexpected failure while deregistering a channel");
            }
            if fire_inactive {
                channel.pipeline().fire_channel_inactive();
            }
            if channel.inner().registered.swap(false, Ordering::AcqRel) {
                if let Some(event_loop) = channel.event_loop() {
                    event_loop.untrack(channel.id());
                }
                channel.pipeline().fire_channel_unregistered();
            }
            promise.try_success(());
        });
    }

    /// 请求读取；未激活时为空操作，读取失败会触发异常事件并关闭通道。
    pub fn begin_read(&self) {
        if !self.channel.is_active() {
            return;
        }
        if let Err(error) = self.transport().do_begin_read(self.channel) {
            self.invoke_later(move |channel| channel.pipeline().fire_exception_caught(error));
            self.close(self.channel.new_promise());
        }
    }

    /// 把消息加入出站缓冲；缓冲已被关闭时立即失败。
    pub fn write(&self, message: PipelineMessage, promise: ChannelPromise) {
        let Some(buffer) = self.channel.outbound_buffer() else {
            promise.try_failure(ChannelError::closed("write to a closed channel"));
            return;
        };
        let message = match self.transport().filter_outbound_message(message) {
            Ok(message) => message,
            Err(error) => {
                promise.try_failure(error);
                return;
            }
        };
        let size = self.channel.config().estimator().size(&message);
        buffer.add_message(message, size, promise);
    }

    /// 冲刷：推进未冲刷区段并交给传输写出。
    pub fn flush(&self) {
        let Some(buffer) = self.channel.outbound_buffer() else {
            return;
        };
        buffer.add_flush();
        self.flush0();
    }

    fn flush0(&self) {
        let inner = self.channel.inner();
        if inner.in_flush0.load(Ordering::Acquire) {
            return;
        }
        let Some(buffer) = self.channel.outbound_buffer() else {
            return;
        };
        if buffer.is_empty() {
            return;
        }
        inner.in_flush0.store(true, Ordering::Release);
        if !self.channel.is_active() {
            if self.channel.is_open() {
                buffer.fail_flushed(ChannelError::NotYetConnected, true);
            } else {
                buffer.fail_flushed(ChannelError::closed("flush on a closed channel"), false);
            }
            inner.in_flush0.store(false, Ordering::Release);
            return;
        }
        if let Err(error) = self.transport().do_write(self.channel, &buffer) {
            buffer.fail_flushed(error.clone(), true);
            self.close_with(self.channel.new_promise(), error);
        }
        inner.in_flush0.store(false, Ordering::Release);
    }

    fn ensure_open(&self, promise: &ChannelPromise) -> bool {
        if self.channel.is_open() {
            return true;
        }
        promise.try_failure(ChannelError::closed("channel is not open"));
        false
    }

    fn close_if_closed(&self) {
        if !self.channel.is_open() {
            self.close(self.channel.new_promise());
        }
    }

    fn invoke_later<F>(&self, task: F)
    where
        F: FnOnce(&Channel) + Send + 'static,
    {
        let Some(event_loop) = self.channel.event_loop() else {
            task(self.channel);
            return;
        };
        let channel = self.channel.clone();
        if let Err(error) = event_loop.execute(move || task(&channel)) {
            warn!(channel = %self.channel.id(), %error, "can't invoke task later as the event loop rejected it");
        }
    }
}
