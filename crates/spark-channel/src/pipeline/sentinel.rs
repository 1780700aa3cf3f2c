//! 流水线两端的哨兵处理器。

use tracing::{debug, warn};

use crate::address::SocketAddress;
use crate::error::{ChannelError, Result};
use crate::future::ChannelPromise;
use crate::message::{PipelineMessage, UserEvent};

use super::context::ChannelHandlerContext;
use super::handler::{ChannelHandler, EventMask};

fn channel_gone(promise: &ChannelPromise) {
    promise.try_failure(ChannelError::closed("channel has been dropped"));
}

fn read_if_auto_read(ctx: &ChannelHandlerContext) {
    if let Some(channel) = ctx.channel()
        && channel.config().auto_read()
    {
        channel.read();
    }
}

/// head：入站事件的起点，出站事件的终点。
///
/// 出站操作在这里落到 `ChannelUnsafe`；激活与读完成后按自动读配置请求下一次读取；
/// 已关闭通道注销后拆除整条流水线。
pub(crate) struct HeadHandler;

impl ChannelHandler for HeadHandler {
    fn channel_unregistered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_unregistered();
        if let Some(channel) = ctx.channel()
            && !channel.is_open()
        {
            channel.pipeline().destroy();
        }
        Ok(())
    }

    fn channel_active(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_active();
        read_if_auto_read(ctx);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_read_complete();
        read_if_auto_read(ctx);
        Ok(())
    }

    fn bind(
        &self,
        ctx: &ChannelHandlerContext,
        local: SocketAddress,
        promise: ChannelPromise,
    ) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.unsafe_ops().bind(local, promise),
            None => channel_gone(&promise),
        }
        Ok(())
    }

    fn connect(
        &self,
        ctx: &ChannelHandlerContext,
        remote: SocketAddress,
        local: Option<SocketAddress>,
        promise: ChannelPromise,
    ) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.unsafe_ops().connect(remote, local, promise),
            None => channel_gone(&promise),
        }
        Ok(())
    }

    fn disconnect(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.unsafe_ops().disconnect(promise),
            None => channel_gone(&promise),
        }
        Ok(())
    }

    fn close(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.unsafe_ops().close(promise),
            None => channel_gone(&promise),
        }
        Ok(())
    }

    fn deregister(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.unsafe_ops().deregister(promise),
            None => channel_gone(&promise),
        }
        Ok(())
    }

    fn read(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        if let Some(channel) = ctx.channel() {
            channel.unsafe_ops().begin_read();
        }
        Ok(())
    }

    fn write(
        &self,
        ctx: &ChannelHandlerContext,
        message: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.unsafe_ops().write(message, promise),
            None => channel_gone(&promise),
        }
        Ok(())
    }

    fn flush(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        if let Some(channel) = ctx.channel() {
            channel.unsafe_ops().flush();
        }
        Ok(())
    }
}

/// tail：入站事件的终点，记录没有被任何处理器消费的消息与异常。
pub(crate) struct TailHandler;

impl ChannelHandler for TailHandler {
    fn event_mask(&self) -> EventMask {
        EventMask::INBOUND
    }

    fn channel_registered(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_unregistered(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_active(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_read(&self, ctx: &ChannelHandlerContext, message: PipelineMessage) -> Result<()> {
        let channel = ctx.channel().map(|channel| channel.id().to_string());
        debug!(
            channel = channel.as_deref().unwrap_or("-"),
            ?message,
            "discarded inbound message that reached the tail of the pipeline"
        );
        Ok(())
    }

    fn channel_read_complete(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn user_event_triggered(&self, _ctx: &ChannelHandlerContext, _event: UserEvent) -> Result<()> {
        debug!("discarded user event that reached the tail of the pipeline");
        Ok(())
    }

    fn channel_writability_changed(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn exception_caught(&self, ctx: &ChannelHandlerContext, cause: ChannelError) -> Result<()> {
        let channel = ctx.channel().map(|channel| channel.id().to_string());
        warn!(
            channel = channel.as_deref().unwrap_or("-"),
            code = cause.code(),
            %cause,
            "an exception reached the tail of the pipeline without being handled"
        );
        Ok(())
    }
}
