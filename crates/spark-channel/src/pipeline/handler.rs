use std::fmt;
use std::ops::BitOr;

use crate::address::SocketAddress;
use crate::error::{ChannelError, Result};
use crate::future::ChannelPromise;
use crate::message::{PipelineMessage, UserEvent};

use super::context::ChannelHandlerContext;

/// 处理器参与的事件集合。
///
/// 流水线在传播事件时跳过掩码中未声明该事件的上下文，避免逐层调用只做转发的默认实现。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask(u32);

impl EventMask {
    pub const CHANNEL_REGISTERED: Self = Self(1 << 0);
    pub const CHANNEL_UNREGISTERED: Self = Self(1 << 1);
    pub const CHANNEL_ACTIVE: Self = Self(1 << 2);
    pub const CHANNEL_INACTIVE: Self = Self(1 << 3);
    pub const CHANNEL_READ: Self = Self(1 << 4);
    pub const CHANNEL_READ_COMPLETE: Self = Self(1 << 5);
    pub const USER_EVENT_TRIGGERED: Self = Self(1 << 6);
    pub const CHANNEL_WRITABILITY_CHANGED: Self = Self(1 << 7);
    pub const EXCEPTION_CAUGHT: Self = Self(1 << 8);
    pub const BIND: Self = Self(1 << 9);
    pub const CONNECT: Self = Self(1 << 10);
    pub const DISCONNECT: Self = Self(1 << 11);
    pub const CLOSE: Self = Self(1 << 12);
    pub const DEREGISTER: Self = Self(1 << 13);
    pub const READ: Self = Self(1 << 14);
    pub const WRITE: Self = Self(1 << 15);
    pub const FLUSH: Self = Self(1 << 16);

    /// 不参与任何事件。
    pub const NONE: Self = Self(0);
    /// 全部入站事件。
    pub const INBOUND: Self = Self(0x1ff);
    /// 全部出站事件。
    pub const OUTBOUND: Self = Self(0xff << 9);
    /// 全部事件。
    pub const ALL: Self = Self(Self::INBOUND.0 | Self::OUTBOUND.0);

    /// 是否包含 `other` 的全部位。
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// 并集。
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// 去掉 `other` 中的位。
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// 原始位。
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventMask({:#07x})", self.0)
    }
}

/// 流水线处理器。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 把协议逻辑拆成可组合的小单元：解码器、编码器、业务处理器各自只关心自己的事件；
/// - 入站回调（`channel_*`、`user_event_triggered`、`exception_caught`）沿 head→tail 传播，
///   出站回调（`bind` … `flush`）沿 tail→head 传播。
///
/// ## 逻辑 (How)
/// - 所有回调都有默认实现：原样转发到下一个上下文，实现者只覆写关心的事件；
/// - 覆写后若仍希望事件继续传播，需要显式调用 `ctx.fire_*` 或对应的出站方法；
/// - [`event_mask`](Self::event_mask) 声明参与的事件，流水线据此跳过不相关的处理器。
///
/// ## 契约 (What)
/// - 回调在上下文绑定的执行器（默认为通道的事件循环）上串行调用；
/// - 入站回调返回 `Err` 或发生 panic 时，错误被转换为从下一个上下文开始的 `exception_caught`；
/// - 出站回调返回 `Err` 或发生 panic 时，对应 Promise 以该错误失败；没有 Promise 的 `read`/`flush` 转为 `exception_caught`；
/// - 同一个处理器实例可以被加入多个通道的流水线，状态需自行按通道隔离。
///
/// ## 风险 (Trade-offs)
/// - 回调不应阻塞：它们运行在事件循环线程上，阻塞会拖慢同一循环上的全部通道。
pub trait ChannelHandler: Send + Sync + 'static {
    /// 参与的事件集合，默认全部参与。
    fn event_mask(&self) -> EventMask {
        EventMask::ALL
    }

    /// 处理器已加入流水线（通道注册之后才会调用）。
    fn handler_added(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    /// 处理器已从流水线移除。
    fn handler_removed(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_registered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&self, ctx: &ChannelHandlerContext, message: PipelineMessage) -> Result<()> {
        ctx.fire_channel_read(message);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    fn user_event_triggered(&self, ctx: &ChannelHandlerContext, event: UserEvent) -> Result<()> {
        ctx.fire_user_event_triggered(event);
        Ok(())
    }

    fn channel_writability_changed(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    fn exception_caught(&self, ctx: &ChannelHandlerContext, cause: ChannelError) -> Result<()> {
        ctx.fire_exception_caught(cause);
        Ok(())
    }

    fn bind(
        &self,
        ctx: &ChannelHandlerContext,
        local: SocketAddress,
        promise: ChannelPromise,
    ) -> Result<()> {
        ctx.bind_with(local, promise);
        Ok(())
    }

    fn connect(
        &self,
        ctx: &ChannelHandlerContext,
        remote: SocketAddress,
        local: Option<SocketAddress>,
        promise: ChannelPromise,
    ) -> Result<()> {
        ctx.connect_with(remote, local, promise);
        Ok(())
    }

    fn disconnect(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        ctx.disconnect_with(promise);
        Ok(())
    }

    fn close(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        ctx.close_with(promise);
        Ok(())
    }

    fn deregister(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        ctx.deregister_with(promise);
        Ok(())
    }

    fn read(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.read();
        Ok(())
    }

    fn write(
        &self,
        ctx: &ChannelHandlerContext,
        message: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<()> {
        ctx.write_with(message, promise);
        Ok(())
    }

    fn flush(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_partition_inbound_and_outbound() {
        assert_eq!(EventMask::INBOUND.bits() & EventMask::OUTBOUND.bits(), 0);
        assert!(EventMask::INBOUND.contains(EventMask::EXCEPTION_CAUGHT));
        assert!(EventMask::OUTBOUND.contains(EventMask::BIND | EventMask::FLUSH));
        assert!(!EventMask::OUTBOUND.contains(EventMask::CHANNEL_READ));
        let read_only = EventMask::INBOUND.without(EventMask::CHANNEL_READ);
        assert!(!read_only.contains(EventMask::CHANNEL_READ));
        assert!(read_only.contains(EventMask::CHANNEL_ACTIVE));
        assert_eq!(EventMask::ALL, EventMask::INBOUND | EventMask::OUTBOUND);
    }
}
