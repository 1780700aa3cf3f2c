//! 通道句柄。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - [`Channel`] 是应用代码面对的双工端点：公开操作全部进入流水线（出站方向 tail→head），最终由
//!   [`ChannelUnsafe`] 在所属事件循环线程上执行；
//! - 通道独占自己的流水线与出站缓冲，处理器上下文只经由流水线的弱引用回指通道，不形成引用环。
//!
//! ## 逻辑 (How)
//! - 状态机：Open → Registered → (Bind | Connect) → Active → Closed（终态）；
//!   状态由传输实现的 `is_open` / `is_active` / `local_address` 与注册标志推导，不单独存储；
//! - 配置以 `ArcSwap` 持有，任意线程可以无锁读取快照；
//! - 出站缓冲放在 `Option` 中，关闭时取走，此后的写入立即以“已关闭”失败。
//!
//! ## 契约 (What)
//! - `Channel` 克隆只增加引用计数；相等性按同一底层对象判断；
//! - 注册后通道永久绑定到一个事件循环；
//! - 关闭幂等，`close_future` 在首次关闭完成时成功。

mod transport;
mod unsafe_ops;

pub use transport::{ConnectStatus, Transport};
pub use unsafe_ops::ChannelUnsafe;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::address::SocketAddress;
use crate::buffer::BufferAllocator;
use crate::config::{ChannelConfig, WriteBufferWaterMark};
use crate::error::{ChannelError, Result};
use crate::event_loop::{EventLoop, ScheduledHandle};
use crate::future::{ChannelFuture, ChannelPromise};
use crate::message::PipelineMessage;
use crate::outbound::{ChannelOutboundBuffer, OutboundBufferOwner};
use crate::pipeline::ChannelPipeline;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的通道标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 数值形式。
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// 通道状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// 已创建，尚未注册。
    Open,
    /// 已注册到事件循环。
    Registered,
    /// 已绑定本端地址但尚未激活。
    Bound,
    /// 已激活，可收发。
    Active,
    /// 已关闭（终态）。
    Closed,
}

#[derive(Default)]
pub(crate) struct PendingConnect {
    pub(crate) promise: Option<ChannelPromise>,
    pub(crate) remote: Option<SocketAddress>,
    pub(crate) timeout: Option<ScheduledHandle>,
}

pub(crate) struct ChannelInner {
    id: ChannelId,
    parent: Option<Channel>,
    config: ArcSwap<ChannelConfig>,
    pipeline: ChannelPipeline,
    transport: Box<dyn Transport>,
    pub(crate) event_loop: OnceLock<EventLoop>,
    pub(crate) registered: AtomicBool,
    pub(crate) never_registered: AtomicBool,
    pub(crate) outbound: Mutex<Option<Arc<ChannelOutboundBuffer>>>,
    pub(crate) close_promise: ChannelPromise,
    pub(crate) close_initiated: AtomicBool,
    pub(crate) in_flush0: AtomicBool,
    pub(crate) connect: Mutex<PendingConnect>,
}

/// 通道句柄。
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// 不持有所有权的通道引用。
#[derive(Clone, Default)]
pub struct WeakChannel(Weak<ChannelInner>);

impl WeakChannel {
    /// 尝试升级为强引用。
    pub fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|inner| Channel { inner })
    }
}

impl fmt::Debug for WeakChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(channel) => write!(f, "WeakChannel({})", channel.id()),
            None => f.write_str("WeakChannel(dropped)"),
        }
    }
}

/// 出站缓冲回指通道的适配器，只持有弱引用。
struct ChannelBufferOwner {
    channel: WeakChannel,
}

impl OutboundBufferOwner for ChannelBufferOwner {
    fn water_mark(&self) -> WriteBufferWaterMark {
        self.channel
            .upgrade()
            .map(|channel| channel.config().water_mark())
            .unwrap_or_default()
    }

    fn is_open(&self) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|channel| channel.is_open())
    }

    fn fire_writability_changed(&self, invoke_later: bool) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        match channel.event_loop() {
            Some(event_loop) if invoke_later => {
                let target = channel.clone();
                if let Err(error) = event_loop.execute(move || {
                    target.pipeline().fire_channel_writability_changed();
                }) {
                    debug!(channel = %channel.id(), %error, "dropped a writability change as the event loop rejected it");
                }
            }
            _ => channel.pipeline().fire_channel_writability_changed(),
        }
    }

    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> Result<()> {
        let channel = self
            .channel
            .upgrade()
            .ok_or(ChannelError::closed("channel dropped"))?;
        let event_loop = channel.event_loop().ok_or(ChannelError::NotRegistered)?;
        event_loop.execute(task)
    }
}

impl Channel {
    /// 以传输实现、可选父通道与配置创建通道。
    pub fn new<T: Transport>(transport: T, parent: Option<Channel>, config: ChannelConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let owner: Arc<dyn OutboundBufferOwner> = Arc::new(ChannelBufferOwner {
                channel: WeakChannel(weak.clone()),
            });
            ChannelInner {
                id: ChannelId::next(),
                parent,
                config: ArcSwap::from_pointee(config),
                pipeline: ChannelPipeline::new(WeakChannel(weak.clone())),
                transport: Box::new(transport),
                event_loop: OnceLock::new(),
                registered: AtomicBool::new(false),
                never_registered: AtomicBool::new(true),
                outbound: Mutex::new(Some(ChannelOutboundBuffer::new(owner))),
                close_promise: ChannelPromise::new(),
                close_initiated: AtomicBool::new(false),
                in_flush0: AtomicBool::new(false),
                connect: Mutex::new(PendingConnect::default()),
            }
        });
        inner.close_promise.set_uncancellable();
        Self { inner }
    }

    /// 标识。
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// 父通道（服务端接受的子通道才有）。
    pub fn parent(&self) -> Option<&Channel> {
        self.inner.parent.as_ref()
    }

    /// 配置快照。
    pub fn config(&self) -> Arc<ChannelConfig> {
        self.inner.config.load_full()
    }

    /// 原子替换配置；自动读由关变开时立即请求一次读取。
    pub fn set_config(&self, config: ChannelConfig) {
        let enable_read = config.auto_read();
        let previous = self.inner.config.swap(Arc::new(config));
        if enable_read && !previous.auto_read() {
            self.read();
        }
    }

    /// 切换自动读。
    pub fn set_auto_read(&self, auto_read: bool) {
        let config = self.config().as_ref().clone().with_auto_read(auto_read);
        self.set_config(config);
    }

    /// 缓冲分配器。
    pub fn allocator(&self) -> Arc<dyn BufferAllocator> {
        Arc::clone(self.config().allocator())
    }

    /// 流水线。
    pub fn pipeline(&self) -> &ChannelPipeline {
        &self.inner.pipeline
    }

    /// 所属事件循环；注册前为 `None`。
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.inner.event_loop.get().cloned()
    }

    /// 传输实现。
    pub fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    /// 按具体类型取回传输实现。
    pub fn transport_as<T: Transport>(&self) -> Option<&T> {
        self.inner.transport.as_any().downcast_ref::<T>()
    }

    /// 是否已注册。
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    /// 是否打开。
    pub fn is_open(&self) -> bool {
        self.inner.transport.is_open()
    }

    /// 是否激活。
    pub fn is_active(&self) -> bool {
        self.inner.transport.is_active()
    }

    /// 本端地址。
    pub fn local_address(&self) -> Option<SocketAddress> {
        self.inner.transport.local_address()
    }

    /// 对端地址。
    pub fn remote_address(&self) -> Option<SocketAddress> {
        self.inner.transport.remote_address()
    }

    /// 推导当前状态。
    pub fn state(&self) -> ChannelState {
        if !self.is_open() {
            ChannelState::Closed
        } else if self.is_active() {
            ChannelState::Active
        } else if self.local_address().is_some() {
            ChannelState::Bound
        } else if self.is_registered() {
            ChannelState::Registered
        } else {
            ChannelState::Open
        }
    }

    /// 出站缓冲；关闭后为 `None`。
    pub fn outbound_buffer(&self) -> Option<Arc<ChannelOutboundBuffer>> {
        self.inner.outbound.lock().clone()
    }

    /// 是否可写；任意线程可调用。
    pub fn is_writable(&self) -> bool {
        self.outbound_buffer()
            .is_some_and(|buffer| buffer.is_writable())
    }

    /// 还能写入多少字节才会变为不可写。
    pub fn bytes_before_unwritable(&self) -> usize {
        self.outbound_buffer()
            .map_or(0, |buffer| buffer.bytes_before_unwritable())
    }

    /// 还需排出多少字节才会恢复可写。
    pub fn bytes_before_writable(&self) -> usize {
        self.outbound_buffer()
            .map_or(0, |buffer| buffer.bytes_before_writable())
    }

    /// 关闭完成 Future。
    pub fn close_future(&self) -> ChannelFuture<()> {
        self.inner.close_promise.future()
    }

    /// 创建与本通道事件循环绑定的 Promise。
    pub fn new_promise(&self) -> ChannelPromise {
        match self.event_loop() {
            Some(event_loop) => event_loop.new_promise(),
            None => ChannelPromise::new(),
        }
    }

    /// 绑定本端地址。
    pub fn bind(&self, local: impl Into<SocketAddress>) -> ChannelFuture<()> {
        self.pipeline().bind(local.into())
    }

    /// 连接对端。
    pub fn connect(&self, remote: impl Into<SocketAddress>) -> ChannelFuture<()> {
        self.pipeline().connect(remote.into(), None)
    }

    /// 以指定本端地址连接对端。
    pub fn connect_with_local(
        &self,
        remote: impl Into<SocketAddress>,
        local: impl Into<SocketAddress>,
    ) -> ChannelFuture<()> {
        self.pipeline().connect(remote.into(), Some(local.into()))
    }

    /// 断开连接；传输不具备断开语义时等价于关闭。
    pub fn disconnect(&self) -> ChannelFuture<()> {
        self.pipeline().disconnect()
    }

    /// 关闭通道。
    pub fn close(&self) -> ChannelFuture<()> {
        self.pipeline().close()
    }

    /// 从事件循环注销。
    pub fn deregister(&self) -> ChannelFuture<()> {
        self.pipeline().deregister()
    }

    /// 请求一次读取。
    pub fn read(&self) -> &Self {
        self.pipeline().read();
        self
    }

    /// 写入消息（进入出站缓冲，需 `flush` 才会发送）。
    pub fn write(&self, message: impl Into<PipelineMessage>) -> ChannelFuture<()> {
        self.pipeline().write(message.into())
    }

    /// 写入并冲刷。
    pub fn write_and_flush(&self, message: impl Into<PipelineMessage>) -> ChannelFuture<()> {
        self.pipeline().write_and_flush(message.into())
    }

    /// 冲刷出站缓冲。
    pub fn flush(&self) -> &Self {
        self.pipeline().flush();
        self
    }

    /// 传输相关的底层操作；只应在所属事件循环线程上调用。
    pub fn unsafe_ops(&self) -> ChannelUnsafe<'_> {
        ChannelUnsafe::new(self)
    }

    /// 降级为弱引用。
    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.inner))
    }

    pub(crate) fn inner(&self) -> &ChannelInner {
        &self.inner
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("local", &self.local_address())
            .field("remote", &self.remote_address())
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[id: {}", self.inner.id)?;
        if let Some(local) = self.local_address() {
            write!(f, ", L:{local}")?;
        }
        if let Some(remote) = self.remote_address() {
            write!(f, ", R:{remote}")?;
        }
        f.write_str("]")
    }
}
