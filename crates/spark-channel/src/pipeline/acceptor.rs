use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::channel::Channel;
use crate::config::ChannelOptions;
use crate::error::{ChannelError, Result};
use crate::event_loop::EventLoopGroup;
use crate::message::PipelineMessage;

use super::context::ChannelHandlerContext;
use super::handler::{ChannelHandler, EventMask};

/// 子通道处理器在子流水线中的名称。
pub const CHILD_HANDLER_NAME: &str = "spark-child-handler";

const ACCEPT_PAUSE: Duration = Duration::from_secs(1);

/// 服务端通道的接收处理器。
///
/// # 教案式说明
/// - **意图 (Why)**：服务端通道读到的“消息”是新接受的子通道，需要统一完成装配并交给子循环组；
/// - **逻辑 (How)**：对每个子通道依次加入子处理器（通常是 [`ChannelInitializer`](super::ChannelInitializer)）、
///   应用子通道选项、注册到子循环组的下一个循环；注册失败时强制关闭子通道；
/// - **风险 (Trade-offs)**：接收路径发生异常时暂停自动读一秒，避免在持续失败的情况下空转。
pub struct ChildAcceptor {
    child_group: EventLoopGroup,
    child_handler: Arc<dyn ChannelHandler>,
    child_options: ChannelOptions,
}

impl ChildAcceptor {
    pub fn new(
        child_group: EventLoopGroup,
        child_handler: Arc<dyn ChannelHandler>,
        child_options: ChannelOptions,
    ) -> Self {
        Self {
            child_group,
            child_handler,
            child_options,
        }
    }

    fn accept(&self, child: Channel) {
        if let Err(error) = child
            .pipeline()
            .add_last(CHILD_HANDLER_NAME, Arc::clone(&self.child_handler))
        {
            warn!(channel = %child.id(), %error, "failed to install the child handler");
            child.unsafe_ops().close_forcibly();
            return;
        }
        match child.config().apply_options(&self.child_options) {
            Ok(config) => child.set_config(config),
            Err(error) => {
                warn!(channel = %child.id(), %error, "ignored invalid child channel options");
            }
        }
        let registering = child.clone();
        self.child_group
            .register(&child)
            .add_listener(move |outcome| {
                if let Err(error) = outcome {
                    warn!(channel = %registering.id(), %error, "failed to register an accepted channel");
                    registering.unsafe_ops().close_forcibly();
                }
            });
    }
}

impl ChannelHandler for ChildAcceptor {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::EXCEPTION_CAUGHT
    }

    fn channel_read(&self, ctx: &ChannelHandlerContext, message: PipelineMessage) -> Result<()> {
        match message.into_channel() {
            Ok(child) => self.accept(child),
            Err(other) => ctx.fire_channel_read(other),
        }
        Ok(())
    }

    fn exception_caught(&self, ctx: &ChannelHandlerContext, cause: ChannelError) -> Result<()> {
        if let Some(channel) = ctx.channel()
            && channel.config().auto_read()
        {
            channel.set_auto_read(false);
            if let Some(event_loop) = channel.event_loop() {
                let resumed = channel.clone();
                if let Err(error) =
                    event_loop.schedule(ACCEPT_PAUSE, move || resumed.set_auto_read(true))
                {
                    warn!(channel = %channel.id(), %error, "could not schedule auto-read resumption");
                }
            }
        }
        ctx.fire_exception_caught(cause);
        Ok(())
    }
}
