use std::any::Any;
use std::sync::Arc;

use crate::address::SocketAddress;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::message::PipelineMessage;
use crate::outbound::ChannelOutboundBuffer;

use super::Channel;

/// `do_connect` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStatus {
    /// 连接已同步建立。
    Connected,
    /// 连接进行中，传输实现稍后调用 [`ChannelUnsafe::finish_connect`](super::ChannelUnsafe::finish_connect)。
    Pending,
}

/// 具体传输的钩子集合。
///
/// # 教案式说明
/// - **意图 (Why)**：通用的状态机（注册、连接超时、关闭幂等、出站缓冲失败处理）由
///   [`ChannelUnsafe`](super::ChannelUnsafe) 统一实现，传输实现只需提供与介质相关的最小操作。
/// - **契约 (What)**：
///   - 所有 `do_*` 方法只在通道所属事件循环线程上被调用；
///   - `channel` 参数是拥有本传输的通道句柄，传输实现不应长期持有它的强引用以免形成环；
///   - `do_write` 负责从出站缓冲中取出已冲刷条目并调用 `remove`/`remove_failed`。
/// - **风险 (Trade-offs)**：状态查询（`is_open` / `is_active`）可能在任意线程被调用，实现需保证线程安全。
pub trait Transport: Send + Sync + 'static {
    /// 供 [`Channel::transport_as`] 向下转型。
    fn as_any(&self) -> &dyn Any;

    /// 通道是否仍然打开。
    fn is_open(&self) -> bool;

    /// 通道是否已激活（可收发）。
    fn is_active(&self) -> bool;

    /// 本端地址。
    fn local_address(&self) -> Option<SocketAddress>;

    /// 对端地址。
    fn remote_address(&self) -> Option<SocketAddress>;

    /// 是否可以注册到给定事件循环。
    fn is_compatible(&self, _event_loop: &EventLoop) -> bool {
        true
    }

    /// 是否具备独立于关闭的断开语义；不具备时 `disconnect` 等价于 `close`。
    fn has_disconnect(&self) -> bool {
        false
    }

    /// 注册到事件循环后的钩子。
    fn do_register(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    /// 绑定本端地址。
    fn do_bind(&self, channel: &Channel, local: &SocketAddress) -> Result<()>;

    /// 发起连接。
    fn do_connect(
        &self,
        channel: &Channel,
        remote: &SocketAddress,
        local: Option<&SocketAddress>,
    ) -> Result<ConnectStatus>;

    /// 完成挂起的连接。
    fn do_finish_connect(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    /// 断开连接。
    fn do_disconnect(&self, channel: &Channel) -> Result<()>;

    /// 关闭底层资源。
    fn do_close(&self, channel: &Channel) -> Result<()>;

    /// 从事件循环注销前的钩子。
    fn do_deregister(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    /// 开始（或继续）读取。
    fn do_begin_read(&self, channel: &Channel) -> Result<()>;

    /// 写出出站缓冲中已冲刷的条目。
    fn do_write(&self, channel: &Channel, buffer: &Arc<ChannelOutboundBuffer>) -> Result<()>;

    /// 写入出站缓冲前过滤或转换消息。
    fn filter_outbound_message(&self, message: PipelineMessage) -> Result<PipelineMessage> {
        Ok(message)
    }
}
