//! 处理器流水线。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 每个通道独占一条流水线：入站事件从 head 流向 tail，出站事件从 tail 流向 head，
//!   协议栈由一串可插拔的处理器组成，运行时可增删替换；
//! - head 哨兵把出站操作落到 [`ChannelUnsafe`](crate::channel::ChannelUnsafe)，tail 哨兵兜底记录无人处理的消息与异常。
//!
//! ## 逻辑 (How)
//! - 结构变更（增删替换）在 `structure` 锁内完成链表指针修改，锁外再调用 `handler_added` / `handler_removed`；
//! - 通道注册之前加入的处理器处于“待添加”状态，注册完成时统一回调 `handler_added`，在此之前事件越过它们；
//! - 已关闭通道注销时流水线被拆除，所有用户处理器收到 `handler_removed`。
//!
//! ## 契约 (What)
//! - 名称在流水线内唯一，重复名称返回 [`ChannelError::DuplicateHandler`]，找不到返回 [`ChannelError::NoSuchHandler`]；
//! - `fire_*` 方法从 head 开始传播，出站方法从 tail 开始传播，均可在任意线程调用。

mod acceptor;
mod context;
mod handler;
mod initializer;
mod sentinel;

pub use acceptor::{CHILD_HANDLER_NAME, ChildAcceptor};
pub use context::ChannelHandlerContext;
pub use handler::{ChannelHandler, EventMask};
pub use initializer::ChannelInitializer;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::address::SocketAddress;
use crate::channel::{Channel, WeakChannel};
use crate::error::{ChannelError, Result};
use crate::event_loop::EventLoop;
use crate::future::ChannelFuture;
use crate::message::{PipelineMessage, UserEvent};

use sentinel::{HeadHandler, TailHandler};

const HEAD_NAME: &str = "spark-pipeline-head";
const TAIL_NAME: &str = "spark-pipeline-tail";

#[derive(Default)]
struct Structure {
    names: HashSet<String>,
    registered: bool,
    pending: Vec<ChannelHandlerContext>,
    destroyed: bool,
}

pub(crate) struct PipelineInner {
    channel: WeakChannel,
    head: ChannelHandlerContext,
    tail: ChannelHandlerContext,
    structure: Mutex<Structure>,
}

enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// 通道的处理器流水线句柄。
#[derive(Clone)]
pub struct ChannelPipeline {
    inner: Arc<PipelineInner>,
}

impl ChannelPipeline {
    pub(crate) fn new(channel: WeakChannel) -> Self {
        let inner = Arc::new_cyclic(|weak| {
            let head = ChannelHandlerContext::new(
                HEAD_NAME.to_owned(),
                Arc::new(HeadHandler),
                weak.clone(),
                None,
            );
            let tail = ChannelHandlerContext::new(
                TAIL_NAME.to_owned(),
                Arc::new(TailHandler),
                weak.clone(),
                None,
            );
            head.set_next(Some(tail.clone()));
            tail.set_prev(&head);
            head.mark_add_complete();
            tail.mark_add_complete();
            PipelineInner {
                channel,
                head,
                tail,
                structure: Mutex::new(Structure::default()),
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<PipelineInner>) -> Self {
        Self { inner }
    }

    /// 所属通道。
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade()
    }

    /// 在 head 之后插入处理器。
    pub fn add_first(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<&Self> {
        self.insert(name.into(), handler, None, Position::First)
    }

    /// 在 tail 之前插入处理器。
    pub fn add_last(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<&Self> {
        self.insert(name.into(), handler, None, Position::Last)
    }

    /// 在 tail 之前插入处理器，回调在指定事件循环上执行。
    pub fn add_last_with_executor(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
        executor: EventLoop,
    ) -> Result<&Self> {
        self.insert(name.into(), handler, Some(executor), Position::Last)
    }

    /// 在名为 `base` 的处理器之前插入。
    pub fn add_before(
        &self,
        base: &str,
        name: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<&Self> {
        self.insert(name.into(), handler, None, Position::Before(base))
    }

    /// 在名为 `base` 的处理器之后插入。
    pub fn add_after(
        &self,
        base: &str,
        name: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<&Self> {
        self.insert(name.into(), handler, None, Position::After(base))
    }

    fn insert(
        &self,
        name: String,
        handler: Arc<dyn ChannelHandler>,
        executor: Option<EventLoop>,
        position: Position<'_>,
    ) -> Result<&Self> {
        let ctx = {
            let mut structure = self.inner.structure.lock();
            if structure.names.contains(&name) {
                return Err(ChannelError::DuplicateHandler { name });
            }
            let (prev, next) = match position {
                Position::First => (self.inner.head.clone(), self.next_of(&self.inner.head)?),
                Position::Last => (self.prev_of(&self.inner.tail)?, self.inner.tail.clone()),
                Position::Before(base) => {
                    let base = self.find(base)?;
                    (self.prev_of(&base)?, base)
                }
                Position::After(base) => {
                    let base = self.find(base)?;
                    let next = self.next_of(&base)?;
                    (base, next)
                }
            };
            let ctx = ChannelHandlerContext::new(
                name.clone(),
                handler,
                Arc::downgrade(&self.inner),
                executor,
            );
            ctx.set_prev(&prev);
            ctx.set_next(Some(next.clone()));
            prev.set_next(Some(ctx.clone()));
            next.set_prev(&ctx);
            structure.names.insert(name);
            if !structure.registered {
                ctx.mark_add_pending();
                structure.pending.push(ctx);
                return Ok(self);
            }
            ctx
        };
        self.call_handler_added(&ctx);
        Ok(self)
    }

    /// 移除处理器并返回其实例。
    pub fn remove(&self, name: &str) -> Result<Arc<dyn ChannelHandler>> {
        let (ctx, registered) = {
            let mut structure = self.inner.structure.lock();
            let ctx = self.find(name)?;
            self.unlink(&ctx)?;
            structure.names.remove(name);
            structure.pending.retain(|pending| !pending.ptr_eq(&ctx));
            (ctx, structure.registered)
        };
        if registered {
            self.call_handler_removed(&ctx);
        } else {
            ctx.mark_removed();
        }
        Ok(Arc::clone(ctx.handler()))
    }

    /// 移除指定上下文；上下文已不在本流水线时返回 `NoSuchHandler`。
    pub fn remove_context(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        let current = self.context(ctx.name());
        match current {
            Some(current) if current.ptr_eq(ctx) => self.remove(ctx.name()).map(|_| ()),
            _ => Err(ChannelError::NoSuchHandler {
                name: ctx.name().to_owned(),
            }),
        }
    }

    /// 以新处理器替换名为 `old_name` 的处理器，返回被替换的实例。
    ///
    /// 旧上下文的 `next` 指向新上下文，使在途事件流入替换者。
    pub fn replace(
        &self,
        old_name: &str,
        new_name: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Arc<dyn ChannelHandler>> {
        let new_name = new_name.into();
        let (old, new, registered) = {
            let mut structure = self.inner.structure.lock();
            let old = self.find(old_name)?;
            if new_name != old_name && structure.names.contains(&new_name) {
                return Err(ChannelError::DuplicateHandler { name: new_name });
            }
            let prev = self.prev_of(&old)?;
            let next = self.next_of(&old)?;
            let new = ChannelHandlerContext::new(
                new_name.clone(),
                handler,
                Arc::downgrade(&self.inner),
                None,
            );
            new.set_prev(&prev);
            new.set_next(Some(next.clone()));
            prev.set_next(Some(new.clone()));
            next.set_prev(&new);
            old.set_prev(&new);
            old.set_next(Some(new.clone()));
            structure.names.remove(old_name);
            structure.names.insert(new_name);
            structure.pending.retain(|pending| !pending.ptr_eq(&old));
            if !structure.registered {
                new.mark_add_pending();
                structure.pending.push(new.clone());
            }
            (old, new, structure.registered)
        };
        if registered {
            self.call_handler_added(&new);
            self.call_handler_removed(&old);
        } else {
            old.mark_removed();
        }
        Ok(Arc::clone(old.handler()))
    }

    /// 按名称取处理器。
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.context(name).map(|ctx| Arc::clone(ctx.handler()))
    }

    /// 按名称取上下文。
    pub fn context(&self, name: &str) -> Option<ChannelHandlerContext> {
        let _structure = self.inner.structure.lock();
        self.find(name).ok()
    }

    /// 第一个用户处理器的上下文。
    pub fn first(&self) -> Option<ChannelHandlerContext> {
        self.inner
            .head
            .next()
            .filter(|ctx| !ctx.ptr_eq(&self.inner.tail))
    }

    /// 最后一个用户处理器的上下文。
    pub fn last(&self) -> Option<ChannelHandlerContext> {
        self.inner
            .tail
            .prev()
            .filter(|ctx| !ctx.ptr_eq(&self.inner.head))
    }

    /// 自 head 至 tail 的用户处理器名称。
    pub fn names(&self) -> Vec<String> {
        let _structure = self.inner.structure.lock();
        self.user_contexts()
            .iter()
            .map(|ctx| ctx.name().to_owned())
            .collect()
    }

    fn user_contexts(&self) -> Vec<ChannelHandlerContext> {
        let mut contexts = Vec::new();
        let mut cursor = self.inner.head.next();
        while let Some(ctx) = cursor {
            if ctx.ptr_eq(&self.inner.tail) {
                break;
            }
            cursor = ctx.next();
            contexts.push(ctx);
        }
        contexts
    }

    fn find(&self, name: &str) -> Result<ChannelHandlerContext> {
        self.user_contexts()
            .into_iter()
            .find(|ctx| ctx.name() == name)
            .ok_or_else(|| ChannelError::NoSuchHandler {
                name: name.to_owned(),
            })
    }

    fn next_of(&self, ctx: &ChannelHandlerContext) -> Result<ChannelHandlerContext> {
        ctx.next()
            .ok_or_else(|| ChannelError::illegal_state(format!("`{}` has no successor", ctx.name())))
    }

    fn prev_of(&self, ctx: &ChannelHandlerContext) -> Result<ChannelHandlerContext> {
        ctx.prev()
            .ok_or_else(|| ChannelError::illegal_state(format!("`{}` has no predecessor", ctx.name())))
    }

    fn unlink(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        let prev = self.prev_of(ctx)?;
        let next = self.next_of(ctx)?;
        prev.set_next(Some(next.clone()));
        next.set_prev(&prev);
        Ok(())
    }

    fn call_handler_added(&self, ctx: &ChannelHandlerContext) {
        let pipeline = self.clone();
        ctx.dispatch("handler_added", None, move |ctx| {
            let Err(cause) = ctx.call_handler_added() else {
                return;
            };
            warn!(handler = %ctx.name(), %cause, "handler_added failed; removing the handler");
            let removed = {
                let mut structure = pipeline.inner.structure.lock();
                let linked = pipeline.find(ctx.name()).is_ok_and(|found| found.ptr_eq(ctx));
                if linked && pipeline.unlink(ctx).is_ok() {
                    structure.names.remove(ctx.name());
                    true
                } else {
                    false
                }
            };
            if removed && let Err(error) = ctx.call_handler_removed() {
                warn!(handler = %ctx.name(), %error, "handler_removed failed after a failed handler_added");
            }
            pipeline.fire_exception_caught(cause);
        });
    }

    fn call_handler_removed(&self, ctx: &ChannelHandlerContext) {
        let pipeline = self.clone();
        ctx.dispatch("handler_removed", None, move |ctx| {
            if let Err(cause) = ctx.call_handler_removed() {
                pipeline.fire_exception_caught(cause);
            }
        });
    }

    /// 注册完成时回调所有待添加处理器的 `handler_added`；只生效一次。
    pub(crate) fn invoke_handler_added_if_needed(&self) {
        let pending = {
            let mut structure = self.inner.structure.lock();
            if structure.registered {
                return;
            }
            structure.registered = true;
            std::mem::take(&mut structure.pending)
        };
        for ctx in pending {
            self.call_handler_added(&ctx);
        }
    }

    /// 拆除流水线：自 tail 向 head 依次移除全部用户处理器。
    pub(crate) fn destroy(&self) {
        let removed = {
            let mut structure = self.inner.structure.lock();
            if structure.destroyed {
                return;
            }
            structure.destroyed = true;
            let contexts = self.user_contexts();
            self.inner.head.set_next(Some(self.inner.tail.clone()));
            self.inner.tail.set_prev(&self.inner.head);
            structure.names.clear();
            structure.pending.clear();
            contexts
        };
        for ctx in removed.into_iter().rev() {
            self.call_handler_removed(&ctx);
        }
    }

    // ---- inbound, from head --------------------------------------------

    pub fn fire_channel_registered(&self) {
        self.inner.head.invoke_channel_registered();
    }

    pub fn fire_channel_unregistered(&self) {
        self.inner.head.invoke_channel_unregistered();
    }

    pub fn fire_channel_active(&self) {
        self.inner.head.invoke_channel_active();
    }

    pub fn fire_channel_inactive(&self) {
        self.inner.head.invoke_channel_inactive();
    }

    pub fn fire_channel_read(&self, message: PipelineMessage) {
        self.inner.head.invoke_channel_read(message);
    }

    pub fn fire_channel_read_complete(&self) {
        self.inner.head.invoke_channel_read_complete();
    }

    pub fn fire_user_event_triggered(&self, event: UserEvent) {
        self.inner.head.invoke_user_event_triggered(event);
    }

    pub fn fire_channel_writability_changed(&self) {
        self.inner.head.invoke_channel_writability_changed();
    }

    pub fn fire_exception_caught(&self, cause: ChannelError) {
        self.inner.head.invoke_exception_caught(cause);
    }

    // ---- outbound, from tail -------------------------------------------

    pub fn bind(&self, local: SocketAddress) -> ChannelFuture<()> {
        self.inner.tail.bind(local)
    }

    pub fn connect(&self, remote: SocketAddress, local: Option<SocketAddress>) -> ChannelFuture<()> {
        self.inner.tail.connect(remote, local)
    }

    pub fn disconnect(&self) -> ChannelFuture<()> {
        self.inner.tail.disconnect()
    }

    pub fn close(&self) -> ChannelFuture<()> {
        self.inner.tail.close()
    }

    pub fn deregister(&self) -> ChannelFuture<()> {
        self.inner.tail.deregister()
    }

    pub fn read(&self) {
        self.inner.tail.read();
    }

    pub fn write(&self, message: PipelineMessage) -> ChannelFuture<()> {
        self.inner.tail.write(message)
    }

    pub fn write_and_flush(&self, message: PipelineMessage) -> ChannelFuture<()> {
        self.inner.tail.write_and_flush(message)
    }

    pub fn flush(&self) {
        self.inner.tail.flush();
    }
}

impl fmt::Debug for ChannelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPipeline")
            .field("handlers", &self.names())
            .finish()
    }
}
