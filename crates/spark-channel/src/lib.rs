#![doc = r#"
# spark-channel

## 模块使命（Why）
- **事件驱动内核**：提供 Channel / Pipeline / EventLoop 三元组，让协议逻辑以处理器链的形式组合在抽象双工通道之上，
  无需为每种传输重写套接字代码。
- **线程亲和**：每个 Channel 注册后永久绑定一个 [`EventLoop`]，处理器回调、底层操作与出站缓冲变更均在该线程上串行执行，
  从而在流水线与缓冲逻辑中省去细粒度锁。
- **背压**：[`ChannelOutboundBuffer`] 以高/低水位的滞回区间切换可写性，任意线程都可以无锁读取。

## 核心契约（What）
- [`Channel`]：公开 `bind`/`connect`/`disconnect`/`close`/`write`/`flush`/`read`，全部进入流水线并返回 [`ChannelFuture`]；
- [`ChannelUnsafe`]：执行注册、绑定、连接、关闭、读写等传输相关机制，仅在所属事件循环线程上调用；
- [`Transport`]：具体传输实现的钩子集合（本地通道、套接字适配器等）；
- [`ChannelPipeline`] / [`ChannelHandlerContext`] / [`ChannelHandler`]：入站事件 head→tail，出站事件 tail→head；
- [`EventLoop`] / [`EventLoopGroup`]：单线程任务执行器，FIFO 队列 + 截止时间有序的定时队列。

## 实现策略（How）
- 句柄类型（`Channel`、`EventLoop`、`ChannelPipeline`）均为 `Arc` 包装，可廉价克隆并跨线程传递；
- 处理器上下文以侵入式双向链表组织，`next` 为强引用、`prev` 为弱引用，回指通道只经由所属流水线的弱引用解析；
- 跨线程调用通过 [`EventLoop::in_event_loop`] 判定后由 [`EventLoop::execute`] 透明编组到所属线程。
"#]
#![deny(unsafe_code)]

pub mod address;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod future;
pub mod message;
pub mod outbound;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod test_support;

pub use address::{LocalAddress, SocketAddress};
pub use buffer::{BufferAllocator, HeapBufferAllocator};
pub use channel::{Channel, ChannelId, ChannelState, ChannelUnsafe, ConnectStatus, Transport, WeakChannel};
pub use config::{ChannelConfig, ChannelOptions, EventLoopConfig, WriteBufferWaterMark};
pub use error::{ChannelError, Result};
pub use event_loop::{EventLoop, EventLoopGroup, ScheduledHandle, TaskPanic};
pub use future::{ChannelFuture, ChannelPromise, Promise};
pub use message::{DefaultMessageSizeEstimator, MessageSizeEstimator, PipelineMessage, UserEvent};
pub use outbound::{ChannelOutboundBuffer, OutboundBufferOwner};
pub use pipeline::{
    ChannelHandler, ChannelHandlerContext, ChannelInitializer, ChannelPipeline, ChildAcceptor,
    EventMask,
};
