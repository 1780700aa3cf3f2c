//! 单元测试共用的最小传输实现。

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::address::SocketAddress;
use crate::channel::{Channel, ConnectStatus, Transport};
use crate::error::Result;
use crate::message::PipelineMessage;
use crate::outbound::ChannelOutboundBuffer;

/// 不做任何 I/O 的传输：连接立即成功，写出的消息被收集到 `written`。
pub(crate) struct InertTransport {
    pub(crate) open: Arc<AtomicBool>,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) written: Arc<Mutex<Vec<PipelineMessage>>>,
}

impl Default for InertTransport {
    fn default() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
            active: Arc::new(AtomicBool::new(false)),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Transport for InertTransport {
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
        _remote: &SocketAddress,
        _local: Option<&SocketAddress>,
    ) -> Result<ConnectStatus> {
        self.active.store(true, Ordering::SeqCst);
        Ok(ConnectStatus::Connected)
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
        while let Some(message) = buffer.take_current() {
            self.written.lock().push(message);
            buffer.remove();
        }
        Ok(())
    }
}
