use std::any::Any;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use spark_channel::{
    Channel, ChannelConfig, ChannelError, ChannelOutboundBuffer, ConnectStatus, LocalAddress,
    PipelineMessage, Result, SocketAddress, Transport,
};
use tracing::debug;

use crate::channel::LocalChannel;
use crate::config::LocalConfig;
use crate::registry::LocalRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ServerState {
    Open,
    Bound,
    Closed,
}

struct ServerLink {
    state: ServerState,
    local: Option<LocalAddress>,
}

/// 进程内服务端通道：绑定本地地址，为每个连接者创建一个 [`LocalChannel`] 子通道。
///
/// 服务端流水线读到的消息是 [`PipelineMessage::Channel`]，通常交给
/// [`ChildAcceptor`](spark_channel::ChildAcceptor) 装配并注册到子循环组。
/// 只有读取等待中（`accept_in_progress`）才投递新子通道，自动读关闭时子通道会排队直到下一次 `read`。
pub struct LocalServerChannel {
    registry: LocalRegistry,
    config: LocalConfig,
    link: Mutex<ServerLink>,
    pending: Mutex<VecDeque<Channel>>,
    accept_in_progress: AtomicBool,
}

impl LocalServerChannel {
    /// 以默认配置创建未注册的服务端通道。
    pub fn open(registry: &LocalRegistry) -> Channel {
        Self::open_with(registry, LocalConfig::default(), ChannelConfig::default())
    }

    /// 以给定配置创建未注册的服务端通道；`config` 同样用于它创建的子通道。
    pub fn open_with(
        registry: &LocalRegistry,
        config: LocalConfig,
        channel_config: ChannelConfig,
    ) -> Channel {
        let transport = Self {
            registry: registry.clone(),
            config,
            link: Mutex::new(ServerLink {
                state: ServerState::Open,
                local: None,
            }),
            pending: Mutex::new(VecDeque::new()),
            accept_in_progress: AtomicBool::new(false),
        };
        Channel::new(transport, None, channel_config)
    }

    /// 尚未交给流水线的子通道数。
    pub fn pending_children(&self) -> usize {
        self.pending.lock().len()
    }

    fn state(&self) -> ServerState {
        self.link.lock().state
    }

    /// 为 `client` 创建子通道并在服务端循环上排队；返回子通道供客户端作为对端持有。
    pub(crate) fn serve(
        &self,
        server: &Channel,
        client: &Channel,
        client_address: Option<LocalAddress>,
    ) -> Result<Channel> {
        let local = self
            .link
            .lock()
            .local
            .clone()
            .ok_or_else(|| ChannelError::illegal_state("local server is not bound"))?;
        let event_loop = server.event_loop().ok_or(ChannelError::NotRegistered)?;
        let child = LocalChannel::accepted(
            self.registry.clone(),
            self.config.clone(),
            server,
            local,
            client,
            client_address,
        );
        if event_loop.in_event_loop() {
            Self::serve0(server, child.clone());
        } else {
            let target = server.clone();
            let queued = child.clone();
            event_loop.execute(move || Self::serve0(&target, queued))?;
        }
        Ok(child)
    }

    fn serve0(server: &Channel, child: Channel) {
        let Some(transport) = server.transport_as::<Self>() else {
            return;
        };
        if transport.state() == ServerState::Closed {
            child.unsafe_ops().close_forcibly();
            return;
        }
        transport.pending.lock().push_back(child);
        if transport.accept_in_progress.swap(false, Ordering::AcqRel) {
            transport.read_inbound(server);
        }
    }

    fn poll_pending(&self) -> Option<Channel> {
        self.pending.lock().pop_front()
    }

    fn read_inbound(&self, server: &Channel) {
        let max_messages = server.config().max_messages_per_read().max(1);
        let pipeline = server.pipeline();
        for _ in 0..max_messages {
            let Some(child) = self.poll_pending() else {
                break;
            };
            pipeline.fire_channel_read(PipelineMessage::Channel(child));
        }
        pipeline.fire_channel_read_complete();
    }
}

impl Transport for LocalServerChannel {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_open(&self) -> bool {
        self.state() != ServerState::Closed
    }

    fn is_active(&self) -> bool {
        self.state() == ServerState::Bound
    }

    fn local_address(&self) -> Option<SocketAddress> {
        self.link.lock().local.clone().map(SocketAddress::from)
    }

    fn remote_address(&self) -> Option<SocketAddress> {
        None
    }

    fn do_bind(&self, channel: &Channel, local: &SocketAddress) -> Result<()> {
        let requested = local
            .as_local()
            .ok_or_else(|| ChannelError::UnsupportedAddress {
                address: local.clone(),
            })?;
        if self.state() != ServerState::Open {
            return Err(ChannelError::illegal_state("local server is already bound"));
        }
        let address = self.registry.register(channel, requested)?;
        let mut link = self.link.lock();
        link.local = Some(address);
        link.state = ServerState::Bound;
        Ok(())
    }

    fn do_connect(
        &self,
        _channel: &Channel,
        _remote: &SocketAddress,
        _local: Option<&SocketAddress>,
    ) -> Result<ConnectStatus> {
        Err(ChannelError::UnsupportedOperation {
            context: "a local server channel cannot connect".to_owned(),
        })
    }

    fn do_disconnect(&self, _channel: &Channel) -> Result<()> {
        Err(ChannelError::UnsupportedOperation {
            context: "a local server channel cannot disconnect".to_owned(),
        })
    }

    fn do_close(&self, channel: &Channel) -> Result<()> {
        let (previous, local) = {
            let mut link = self.link.lock();
            (mem::replace(&mut link.state, ServerState::Closed), link.local.clone())
        };
        if previous == ServerState::Closed {
            return Ok(());
        }
        if let Some(local) = local {
            self.registry.unregister(&local);
        }
        self.accept_in_progress.store(false, Ordering::Release);
        let unaccepted = mem::take(&mut *self.pending.lock());
        if !unaccepted.is_empty() {
            debug!(server = %channel.id(), unaccepted = unaccepted.len(), "closing children that were never accepted");
        }
        for child in unaccepted {
            child.unsafe_ops().close_forcibly();
        }
        Ok(())
    }

    fn do_begin_read(&self, channel: &Channel) -> Result<()> {
        if self.accept_in_progress.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.pending.lock().is_empty() {
            self.accept_in_progress.store(true, Ordering::Release);
            return Ok(());
        }
        self.read_inbound(channel);
        Ok(())
    }

    fn do_write(&self, _channel: &Channel, buffer: &Arc<ChannelOutboundBuffer>) -> Result<()> {
        while buffer.has_current() {
            buffer.remove_failed(ChannelError::UnsupportedOperation {
                context: "a local server channel does not accept writes".to_owned(),
            });
        }
        Ok(())
    }

    fn filter_outbound_message(&self, _message: PipelineMessage) -> Result<PipelineMessage> {
        Err(ChannelError::UnsupportedOperation {
            context: "a local server channel does not accept writes".to_owned(),
        })
    }
}
