#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use spark_channel::{
    Channel, ChannelConfig, ChannelError, ChannelHandler, ChannelHandlerContext,
    ChannelOutboundBuffer, ChannelPromise, ConnectStatus, EventLoop, EventLoopConfig,
    PipelineMessage, Result, SocketAddress, Transport,
};

/// `do_connect` 的行为。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectMode {
    Immediate,
    Pending,
    Refuse,
}

/// 可编排的内存传输：写出的消息收集到 `written`。
pub struct MockTransport {
    pub open: Arc<AtomicBool>,
    pub active: Arc<AtomicBool>,
    pub hold_writes: Arc<AtomicBool>,
    pub written: Arc<Mutex<Vec<PipelineMessage>>>,
    pub mode: ConnectMode,
}

impl MockTransport {
    pub fn new(mode: ConnectMode) -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
            active: Arc::new(AtomicBool::new(false)),
            hold_writes: Arc::new(AtomicBool::new(false)),
            written: Arc::new(Mutex::new(Vec::new())),
            mode,
        }
    }
}

impl Transport for MockTransport {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.is_open() && self.active.load(Ordering::SeqCst)
    }

    fn local_address(&self) -> Option<SocketAddress> {
        None
    }

    fn remote_address(&self) -> Option<SocketAddress> {
        None
    }

    fn do_bind(&self, _channel: &Channel, _local: &SocketAddress) -> Result<()> {
        Ok(())
    }

    fn do_connect(
        &self,
        _channel: &Channel,
        remote: &SocketAddress,
        _local: Option<&SocketAddress>,
    ) -> Result<ConnectStatus> {
        match self.mode {
            ConnectMode::Immediate => {
                self.active.store(true, Ordering::SeqCst);
                Ok(ConnectStatus::Connected)
            }
            ConnectMode::Pending => Ok(ConnectStatus::Pending),
            ConnectMode::Refuse => Err(ChannelError::ConnectionRefused {
                remote: remote.clone(),
            }),
        }
    }

    fn do_finish_connect(&self, _channel: &Channel) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn do_disconnect(&self, _channel: &Channel) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn do_close(&self, _channel: &Channel) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn do_begin_read(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    fn do_write(&self, _channel: &Channel, buffer: &Arc<ChannelOutboundBuffer>) -> Result<()> {
        if self.hold_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        while let Some(message) = buffer.take_current() {
            self.written.lock().push(message);
            buffer.remove();
        }
        Ok(())
    }
}

/// 记录事件名称的处理器，事件照常向后传播。
pub struct Recorder {
    pub name: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            log: Arc::clone(log),
        })
    }

    fn record(&self, event: &str) {
        self.log.lock().push(format!("{}:{event}", self.name));
    }
}

impl ChannelHandler for Recorder {
    fn handler_added(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("added");
        Ok(())
    }

    fn handler_removed(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("removed");
        Ok(())
    }

    fn channel_registered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("registered");
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("unregistered");
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("active");
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("inactive");
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&self, ctx: &ChannelHandlerContext, message: PipelineMessage) -> Result<()> {
        self.record("read");
        ctx.fire_channel_read(message);
        Ok(())
    }

    fn channel_writability_changed(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        let writable = ctx.channel().is_some_and(|channel| channel.is_writable());
        self.record(&format!("writable={writable}"));
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    fn exception_caught(&self, _ctx: &ChannelHandlerContext, cause: ChannelError) -> Result<()> {
        self.record(&format!("exception={}", cause.code()));
        Ok(())
    }

    fn write(
        &self,
        ctx: &ChannelHandlerContext,
        message: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<()> {
        self.record("write");
        ctx.write_with(message, promise);
        Ok(())
    }
}

pub fn event_loop(name: &str) -> EventLoop {
    EventLoop::new(EventLoopConfig::new(name)).expect("spawn event loop")
}

/// 让循环把当前已排队的任务（及其派生的少量后续任务）执行完。
pub fn settle(event_loop: &EventLoop) {
    for _ in 0..4 {
        event_loop
            .submit(|| ())
            .wait_timeout(Duration::from_secs(5))
            .expect("event loop barrier timed out")
            .expect("barrier task");
    }
}

pub fn shutdown(event_loop: &EventLoop) {
    let _ = event_loop
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(1))
        .wait_timeout(Duration::from_secs(5));
}

/// 创建并注册一个使用 [`MockTransport`] 的通道。
pub fn registered_channel(
    event_loop: &EventLoop,
    transport: MockTransport,
    config: ChannelConfig,
) -> Channel {
    let channel = Channel::new(transport, None, config);
    event_loop
        .register(&channel)
        .wait_timeout(Duration::from_secs(5))
        .expect("registration timed out")
        .expect("registration");
    channel
}

pub fn snapshot(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock().clone()
}
