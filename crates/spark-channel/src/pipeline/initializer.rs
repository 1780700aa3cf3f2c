use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::warn;

use crate::channel::{Channel, ChannelId};
use crate::error::{ChannelError, Result};

use super::context::ChannelHandlerContext;
use super::handler::ChannelHandler;

/// 一次性的流水线装配处理器。
///
/// # 教案式说明
/// - **意图 (Why)**：子通道由服务端在运行时创建，应用无法提前拿到它们的流水线；
///   初始化器作为占位处理器被加入，在通道注册后回调装配函数，随后把自己移除。
/// - **逻辑 (How)**：
///   - 通道已注册时在 `handler_added` 中装配，否则在 `channel_registered` 中装配，
///     后一种情况从 head 重新触发 `channel_registered`，让新装配的处理器也能收到；
///   - 同一实例可被多个通道共享，按通道标识去重，保证每个通道只装配一次。
/// - **契约 (What)**：装配函数返回错误时记录日志并关闭通道；无论成败，初始化器都会离开流水线。
pub struct ChannelInitializer<F> {
    init: F,
    initialized: Mutex<HashSet<ChannelId>>,
}

impl<F> ChannelInitializer<F>
where
    F: Fn(&Channel) -> Result<()> + Send + Sync + 'static,
{
    /// 以装配函数创建初始化器。
    pub fn new(init: F) -> Self {
        Self {
            init,
            initialized: Mutex::new(HashSet::new()),
        }
    }

    fn init_channel(&self, ctx: &ChannelHandlerContext) -> bool {
        let Some(channel) = ctx.channel() else {
            return false;
        };
        if !self.initialized.lock().insert(channel.id()) {
            return false;
        }
        if let Err(cause) = (self.init)(&channel) {
            warn!(channel = %channel.id(), %cause, "failed to initialize a channel; closing it");
            ctx.close();
        }
        if !ctx.is_removed()
            && let Some(pipeline) = ctx.pipeline()
            && let Err(error) = pipeline.remove_context(ctx)
        {
            warn!(channel = %channel.id(), %error, "initializer could not remove itself");
        }
        true
    }
}

impl<F> ChannelHandler for ChannelInitializer<F>
where
    F: Fn(&Channel) -> Result<()> + Send + Sync + 'static,
{
    fn handler_added(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        if ctx.channel().is_some_and(|channel| channel.is_registered()) {
            self.init_channel(ctx);
        }
        Ok(())
    }

    fn handler_removed(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        if let Some(channel) = ctx.channel() {
            self.initialized.lock().remove(&channel.id());
        }
        Ok(())
    }

    fn channel_registered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        if self.init_channel(ctx) {
            if let Some(pipeline) = ctx.pipeline() {
                pipeline.fire_channel_registered();
            }
        } else {
            ctx.fire_channel_registered();
        }
        Ok(())
    }

    fn exception_caught(&self, ctx: &ChannelHandlerContext, cause: ChannelError) -> Result<()> {
        warn!(handler = %ctx.name(), %cause, "failed to initialize a channel; closing it");
        ctx.close();
        Ok(())
    }
}
