use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::address::SocketAddress;
use crate::channel::Channel;
use crate::error::{ChannelError, Result, panic_message};
use crate::event_loop::EventLoop;
use crate::future::{ChannelFuture, ChannelPromise};
use crate::message::{PipelineMessage, UserEvent};

use super::handler::{ChannelHandler, EventMask};
use super::{ChannelPipeline, PipelineInner};

const INIT: u8 = 0;
const ADD_PENDING: u8 = 1;
const ADD_COMPLETE: u8 = 2;
const REMOVE_COMPLETE: u8 = 3;

struct ContextNode {
    name: String,
    handler: Arc<dyn ChannelHandler>,
    mask: EventMask,
    pipeline: Weak<PipelineInner>,
    executor: Option<EventLoop>,
    next: Mutex<Option<ChannelHandlerContext>>,
    prev: Mutex<Weak<ContextNode>>,
    state: AtomicU8,
}

/// 处理器在流水线中的位置与事件入口。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 处理器本身无状态地复用，位置信息（前驱、后继、执行器）由上下文承载；
/// - 处理器通过上下文把事件交给“下一个参与者”，而不是直接持有其他处理器。
///
/// ## 逻辑 (How)
/// - 上下文组成侵入式双向链表：`next` 为强引用，`prev` 为弱引用，链表两端是固定的 head/tail 哨兵；
/// - `fire_*` 从当前位置向 tail 方向寻找掩码包含该事件的上下文，出站方法向 head 方向寻找；
/// - 目标上下文的执行器不是当前线程时，调用被编组到该执行器；否则内联执行；
/// - 回调在 `catch_unwind` 边界内执行，panic 被转换为 [`ChannelError::HandlerPanicked`]。
///
/// ## 契约 (What)
/// - 句柄可廉价克隆，相等性按同一底层节点判断；
/// - 被移除的上下文保留自己的 `next`，已在途的事件仍能继续向后传播；
/// - 处理器尚未完成 `handler_added`（或已被移除）时，事件直接越过它。
#[derive(Clone)]
pub struct ChannelHandlerContext {
    node: Arc<ContextNode>,
}

impl ChannelHandlerContext {
    pub(crate) fn new(
        name: String,
        handler: Arc<dyn ChannelHandler>,
        pipeline: Weak<PipelineInner>,
        executor: Option<EventLoop>,
    ) -> Self {
        let mask = handler.event_mask();
        Self {
            node: Arc::new(ContextNode {
                name,
                handler,
                mask,
                pipeline,
                executor,
                next: Mutex::new(None),
                prev: Mutex::new(Weak::new()),
                state: AtomicU8::new(INIT),
            }),
        }
    }

    /// 处理器名称，在所属流水线内唯一。
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// 处理器实例。
    pub fn handler(&self) -> &Arc<dyn ChannelHandler> {
        &self.node.handler
    }

    /// 所属通道；通道已释放时为 `None`。
    pub fn channel(&self) -> Option<Channel> {
        self.node.pipeline.upgrade()?.channel.upgrade()
    }

    /// 所属流水线。
    pub fn pipeline(&self) -> Option<ChannelPipeline> {
        self.node.pipeline.upgrade().map(ChannelPipeline::from_inner)
    }

    /// 执行回调的事件循环：显式绑定的执行器，否则为通道的事件循环；通道未注册时为 `None`。
    pub fn executor(&self) -> Option<EventLoop> {
        self.node
            .executor
            .clone()
            .or_else(|| self.channel().and_then(|channel| channel.event_loop()))
    }

    /// 是否已从流水线移除。
    pub fn is_removed(&self) -> bool {
        self.node.state.load(Ordering::Acquire) == REMOVE_COMPLETE
    }

    /// 创建与通道事件循环绑定的 Promise。
    pub fn new_promise(&self) -> ChannelPromise {
        match self.channel() {
            Some(channel) => channel.new_promise(),
            None => ChannelPromise::new(),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub(crate) fn next(&self) -> Option<ChannelHandlerContext> {
        self.node.next.lock().clone()
    }

    pub(crate) fn prev(&self) -> Option<ChannelHandlerContext> {
        self.node
            .prev
            .lock()
            .upgrade()
            .map(|node| ChannelHandlerContext { node })
    }

    pub(crate) fn set_next(&self, next: Option<ChannelHandlerContext>) {
        *self.node.next.lock() = next;
    }

    pub(crate) fn set_prev(&self, prev: &ChannelHandlerContext) {
        *self.node.prev.lock() = Arc::downgrade(&prev.node);
    }

    pub(crate) fn mark_add_pending(&self) {
        self.node.state.store(ADD_PENDING, Ordering::Release);
    }

    pub(crate) fn mark_add_complete(&self) {
        self.node.state.store(ADD_COMPLETE, Ordering::Release);
    }

    pub(crate) fn mark_removed(&self) {
        self.node.state.store(REMOVE_COMPLETE, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.node.state.load(Ordering::Acquire) == ADD_COMPLETE
    }

    pub(crate) fn call_handler_added(&self) -> Result<()> {
        self.mark_add_complete();
        self.guard(|handler, ctx| handler.handler_added(ctx))
    }

    pub(crate) fn call_handler_removed(&self) -> Result<()> {
        let was_added = self.node.state.swap(REMOVE_COMPLETE, Ordering::AcqRel) == ADD_COMPLETE;
        if was_added {
            self.guard(|handler, ctx| handler.handler_removed(ctx))
        } else {
            Ok(())
        }
    }

    fn find_inbound(&self, event: EventMask) -> Option<ChannelHandlerContext> {
        let mut cursor = self.next();
        while let Some(ctx) = cursor {
            if ctx.node.mask.contains(event) {
                return Some(ctx);
            }
            cursor = ctx.next();
        }
        None
    }

    fn find_outbound(&self, event: EventMask) -> Option<ChannelHandlerContext> {
        let mut cursor = self.prev();
        while let Some(ctx) = cursor {
            if ctx.node.mask.contains(event) {
                return Some(ctx);
            }
            cursor = ctx.prev();
        }
        None
    }

    fn guard<F>(&self, call: F) -> Result<()>
    where
        F: FnOnce(&dyn ChannelHandler, &ChannelHandlerContext) -> Result<()>,
    {
        let handler = self.node.handler.as_ref();
        catch_unwind(AssertUnwindSafe(|| call(handler, self))).unwrap_or_else(|payload| {
            Err(ChannelError::HandlerPanicked {
                handler: self.node.name.clone(),
                message: panic_message(payload.as_ref()),
            })
        })
    }

    /// 在本上下文的执行器上运行 `action`：已在该线程时内联，否则编组。
    pub(crate) fn dispatch<F>(&self, operation: &'static str, promise: Option<&ChannelPromise>, action: F)
    where
        F: FnOnce(&ChannelHandlerContext) + Send + 'static,
    {
        match self.executor() {
            Some(executor) if !executor.in_event_loop() => {
                let ctx = self.clone();
                if let Err(error) = executor.execute(move || action(&ctx)) {
                    warn!(
                        handler = %self.node.name,
                        operation,
                        %error,
                        "dropped a pipeline event rejected by its executor"
                    );
                    if let Some(promise) = promise {
                        promise.try_failure(error);
                    }
                }
            }
            _ => action(self),
        }
    }

    fn invoke_inbound<T, C, S>(&self, payload: T, call: C, skip: S)
    where
        C: FnOnce(&dyn ChannelHandler, &ChannelHandlerContext, T) -> Result<()>,
        S: FnOnce(&ChannelHandlerContext, T),
    {
        if !self.is_ready() {
            skip(self, payload);
            return;
        }
        if let Err(cause) = self.guard(|handler, ctx| call(handler, ctx, payload)) {
            self.fire_exception_caught(cause);
        }
    }

    fn invoke_outbound<T, C, S>(&self, payload: T, promise: ChannelPromise, call: C, skip: S)
    where
        C: FnOnce(&dyn ChannelHandler, &ChannelHandlerContext, T, ChannelPromise) -> Result<()>,
        S: FnOnce(&ChannelHandlerContext, T, ChannelPromise),
    {
        if !self.is_ready() {
            skip(self, payload, promise);
            return;
        }
        let failed = promise.clone();
        if let Err(error) = self.guard(|handler, ctx| call(handler, ctx, payload, promise)) {
            failed.try_failure(error);
        }
    }

    // ---- inbound -------------------------------------------------------

    pub(crate) fn invoke_channel_registered(&self) {
        self.dispatch("channel_registered", None, |ctx| {
            ctx.invoke_inbound(
                (),
                |handler, ctx, ()| handler.channel_registered(ctx),
                |ctx, ()| ctx.fire_channel_registered(),
            )
        });
    }

    /// 向后传播 `channel_registered`。
    pub fn fire_channel_registered(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_REGISTERED) {
            next.invoke_channel_registered();
        }
    }

    pub(crate) fn invoke_channel_unregistered(&self) {
        self.dispatch("channel_unregistered", None, |ctx| {
            ctx.invoke_inbound(
                (),
                |handler, ctx, ()| handler.channel_unregistered(ctx),
                |ctx, ()| ctx.fire_channel_unregistered(),
            )
        });
    }

    /// 向后传播 `channel_unregistered`。
    pub fn fire_channel_unregistered(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_UNREGISTERED) {
            next.invoke_channel_unregistered();
        }
    }

    pub(crate) fn invoke_channel_active(&self) {
        self.dispatch("channel_active", None, |ctx| {
            ctx.invoke_inbound(
                (),
                |handler, ctx, ()| handler.channel_active(ctx),
                |ctx, ()| ctx.fire_channel_active(),
            )
        });
    }

    /// 向后传播 `channel_active`。
    pub fn fire_channel_active(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_ACTIVE) {
            next.invoke_channel_active();
        }
    }

    pub(crate) fn invoke_channel_inactive(&self) {
        self.dispatch("channel_inactive", None, |ctx| {
            ctx.invoke_inbound(
                (),
                |handler, ctx, ()| handler.channel_inactive(ctx),
                |ctx, ()| ctx.fire_channel_inactive(),
            )
        });
    }

    /// 向后传播 `channel_inactive`。
    pub fn fire_channel_inactive(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_INACTIVE) {
            next.invoke_channel_inactive();
        }
    }

    pub(crate) fn invoke_channel_read(&self, message: PipelineMessage) {
        self.dispatch("channel_read", None, move |ctx| {
            ctx.invoke_inbound(
                message,
                |handler, ctx, message| handler.channel_read(ctx, message),
                |ctx, message| ctx.fire_channel_read(message),
            )
        });
    }

    /// 向后传播读到的消息；没有后继时消息被丢弃。
    pub fn fire_channel_read(&self, message: PipelineMessage) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_READ) {
            next.invoke_channel_read(message);
        }
    }

    pub(crate) fn invoke_channel_read_complete(&self) {
        self.dispatch("channel_read_complete", None, |ctx| {
            ctx.invoke_inbound(
                (),
                |handler, ctx, ()| handler.channel_read_complete(ctx),
                |ctx, ()| ctx.fire_channel_read_complete(),
            )
        });
    }

    /// 向后传播 `channel_read_complete`。
    pub fn fire_channel_read_complete(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_READ_COMPLETE) {
            next.invoke_channel_read_complete();
        }
    }

    pub(crate) fn invoke_user_event_triggered(&self, event: UserEvent) {
        self.dispatch("user_event_triggered", None, move |ctx| {
            ctx.invoke_inbound(
                event,
                |handler, ctx, event| handler.user_event_triggered(ctx, event),
                |ctx, event| ctx.fire_user_event_triggered(event),
            )
        });
    }

    /// 向后传播用户事件。
    pub fn fire_user_event_triggered(&self, event: UserEvent) {
        if let Some(next) = self.find_inbound(EventMask::USER_EVENT_TRIGGERED) {
            next.invoke_user_event_triggered(event);
        }
    }

    pub(crate) fn invoke_channel_writability_changed(&self) {
        self.dispatch("channel_writability_changed", None, |ctx| {
            ctx.invoke_inbound(
                (),
                |handler, ctx, ()| handler.channel_writability_changed(ctx),
                |ctx, ()| ctx.fire_channel_writability_changed(),
            )
        });
    }

    /// 向后传播可写性变化。
    pub fn fire_channel_writability_changed(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_WRITABILITY_CHANGED) {
            next.invoke_channel_writability_changed();
        }
    }

    pub(crate) fn invoke_exception_caught(&self, cause: ChannelError) {
        self.dispatch("exception_caught", None, move |ctx| {
            if !ctx.is_ready() {
                ctx.fire_exception_caught(cause);
                return;
            }
            if let Err(error) = ctx.guard(|handler, ctx| handler.exception_caught(ctx, cause)) {
                warn!(
                    handler = %ctx.node.name,
                    %error,
                    "an error was raised by a handler's exception_caught callback"
                );
            }
        });
    }

    /// 向后传播异常。
    pub fn fire_exception_caught(&self, cause: ChannelError) {
        if let Some(next) = self.find_inbound(EventMask::EXCEPTION_CAUGHT) {
            next.invoke_exception_caught(cause);
        }
    }

    // ---- outbound ------------------------------------------------------

    fn accepts(&self, promise: &ChannelPromise, operation: &'static str) -> bool {
        let future = promise.future();
        if !future.is_done() {
            return true;
        }
        if !future.is_cancelled() {
            debug!(handler = %self.node.name, operation, "ignored an outbound call with an already completed promise");
        }
        false
    }

    fn unreachable_head(promise: &ChannelPromise) {
        promise.try_failure(ChannelError::closed("pipeline has been torn down"));
    }

    /// 绑定本端地址。
    pub fn bind(&self, local: SocketAddress) -> ChannelFuture<()> {
        let promise = self.new_promise();
        self.bind_with(local, promise.clone());
        promise.future()
    }

    /// 以调用方提供的 Promise 绑定本端地址。
    pub fn bind_with(&self, local: SocketAddress, promise: ChannelPromise) {
        if !self.accepts(&promise, "bind") {
            return;
        }
        let Some(prev) = self.find_outbound(EventMask::BIND) else {
            return Self::unreachable_head(&promise);
        };
        let failed = promise.clone();
        prev.dispatch("bind", Some(&failed), move |ctx| {
            ctx.invoke_outbound(
                local,
                promise,
                |handler, ctx, local, promise| handler.bind(ctx, local, promise),
                |ctx, local, promise| ctx.bind_with(local, promise),
            )
        });
    }

    /// 连接对端。
    pub fn connect(&self, remote: SocketAddress, local: Option<SocketAddress>) -> ChannelFuture<()> {
        let promise = self.new_promise();
        self.connect_with(remote, local, promise.clone());
        promise.future()
    }

    /// 以调用方提供的 Promise 连接对端。
    pub fn connect_with(
        &self,
        remote: SocketAddress,
        local: Option<SocketAddress>,
        promise: ChannelPromise,
    ) {
        if !self.accepts(&promise, "connect") {
            return;
        }
        let Some(prev) = self.find_outbound(EventMask::CONNECT) else {
            return Self::unreachable_head(&promise);
        };
        let failed = promise.clone();
        prev.dispatch("connect", Some(&failed), move |ctx| {
            ctx.invoke_outbound(
                (remote, local),
                promise,
                |handler, ctx, (remote, local), promise| handler.connect(ctx, remote, local, promise),
                |ctx, (remote, local), promise| ctx.connect_with(remote, local, promise),
            )
        });
    }

    /// 断开连接；传输没有独立的断开语义时等价于 `close`。
    pub fn disconnect(&self) -> ChannelFuture<()> {
        let promise = self.new_promise();
        self.disconnect_with(promise.clone());
        promise.future()
    }

    /// 以调用方提供的 Promise 断开连接。
    pub fn disconnect_with(&self, promise: ChannelPromise) {
        let has_disconnect = self
            .channel()
            .is_some_and(|channel| channel.transport().has_disconnect());
        if !has_disconnect {
            self.close_with(promise);
            return;
        }
        if !self.accepts(&promise, "disconnect") {
            return;
        }
        let Some(prev) = self.find_outbound(EventMask::DISCONNECT) else {
            return Self::unreachable_head(&promise);
        };
        let failed = promise.clone();
        prev.dispatch("disconnect", Some(&failed), move |ctx| {
            ctx.invoke_outbound(
                (),
                promise,
                |handler, ctx, (), promise| handler.disconnect(ctx, promise),
                |ctx, (), promise| ctx.disconnect_with(promise),
            )
        });
    }

    /// 关闭通道。
    pub fn close(&self) -> ChannelFuture<()> {
        let promise = self.new_promise();
        self.close_with(promise.clone());
        promise.future()
    }

    /// 以调用方提供的 Promise 关闭通道。
    pub fn close_with(&self, promise: ChannelPromise) {
        if !self.accepts(&promise, "close") {
            return;
        }
        let Some(prev) = self.find_outbound(EventMask::CLOSE) else {
            return Self::unreachable_head(&promise);
        };
        let failed = promise.clone();
        prev.dispatch("close", Some(&failed), move |ctx| {
            ctx.invoke_outbound(
                (),
                promise,
                |handler, ctx, (), promise| handler.close(ctx, promise),
                |ctx, (), promise| ctx.close_with(promise),
            )
        });
    }

    /// 从事件循环注销。
    pub fn deregister(&self) -> ChannelFuture<()> {
        let promise = self.new_promise();
        self.deregister_with(promise.clone());
        promise.future()
    }

    /// 以调用方提供的 Promise 注销。
    pub fn deregister_with(&self, promise: ChannelPromise) {
        if !self.accepts(&promise, "deregister") {
            return;
        }
        let Some(prev) = self.find_outbound(EventMask::DEREGISTER) else {
            return Self::unreachable_head(&promise);
        };
        let failed = promise.clone();
        prev.dispatch("deregister", Some(&failed), move |ctx| {
            ctx.invoke_outbound(
                (),
                promise,
                |handler, ctx, (), promise| handler.deregister(ctx, promise),
                |ctx, (), promise| ctx.deregister_with(promise),
            )
        });
    }

    /// 请求一次读取。
    pub fn read(&self) {
        let Some(prev) = self.find_outbound(EventMask::READ) else {
            return;
        };
        prev.dispatch("read", None, |ctx| {
            if !ctx.is_ready() {
                ctx.read();
                return;
            }
            if let Err(cause) = ctx.guard(|handler, ctx| handler.read(ctx)) {
                ctx.fire_exception_caught(cause);
            }
        });
    }

    /// 写入消息（不冲刷）。
    pub fn write(&self, message: PipelineMessage) -> ChannelFuture<()> {
        let promise = self.new_promise();
        self.write_with(message, promise.clone());
        promise.future()
    }

    /// 以调用方提供的 Promise 写入消息；Promise 已完成时消息被丢弃。
    pub fn write_with(&self, message: PipelineMessage, promise: ChannelPromise) {
        if !self.accepts(&promise, "write") {
            return;
        }
        let Some(prev) = self.find_outbound(EventMask::WRITE) else {
            return Self::unreachable_head(&promise);
        };
        let failed = promise.clone();
        prev.dispatch("write", Some(&failed), move |ctx| {
            ctx.invoke_outbound(
                message,
                promise,
                |handler, ctx, message, promise| handler.write(ctx, message, promise),
                |ctx, message, promise| ctx.write_with(message, promise),
            )
        });
    }

    /// 冲刷。
    pub fn flush(&self) {
        let Some(prev) = self.find_outbound(EventMask::FLUSH) else {
            return;
        };
        prev.dispatch("flush", None, |ctx| {
            if !ctx.is_ready() {
                ctx.flush();
                return;
            }
            if let Err(cause) = ctx.guard(|handler, ctx| handler.flush(ctx)) {
                ctx.fire_exception_caught(cause);
            }
        });
    }

    /// 写入并冲刷。
    pub fn write_and_flush(&self, message: PipelineMessage) -> ChannelFuture<()> {
        let promise = self.new_promise();
        self.write_and_flush_with(message, promise.clone());
        promise.future()
    }

    /// 以调用方提供的 Promise 写入并冲刷。
    pub fn write_and_flush_with(&self, message: PipelineMessage, promise: ChannelPromise) {
        self.write_with(message, promise);
        self.flush();
    }
}

impl PartialEq for ChannelHandlerContext {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ChannelHandlerContext {}

impl fmt::Debug for ChannelHandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandlerContext")
            .field("name", &self.node.name)
            .field("mask", &self.node.mask)
            .field("state", &self.node.state.load(Ordering::Relaxed))
            .finish()
    }
}
