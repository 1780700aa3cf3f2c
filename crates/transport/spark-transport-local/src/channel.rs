use std::any::Any;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use spark_channel::{
    Channel, ChannelConfig, ChannelError, ChannelFuture, ChannelOutboundBuffer, ConnectStatus,
    EventLoop, LocalAddress, PipelineMessage, Result, SocketAddress, Transport,
};
use tracing::{debug, warn};

use crate::config::LocalConfig;
use crate::registry::LocalRegistry;
use crate::server::LocalServerChannel;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkState {
    Open,
    Bound,
    Connected,
    Closed,
}

struct Link {
    state: LinkState,
    peer: Option<Channel>,
    local: Option<LocalAddress>,
    remote: Option<LocalAddress>,
}

/// 进程内双工通道的传输实现。
///
/// # 教案式说明
/// - **意图 (Why)**：让两条流水线在同一进程内直接对接，行为上与真实连接一致：
///   先连接后写、写出的消息按序到达对端、关闭会传播到对端。
/// - **逻辑 (How)**：
///   - 客户端 `connect` 在 [`LocalRegistry`] 中查找 [`LocalServerChannel`]，由服务端创建子通道作为对端，
///     连接以 [`ConnectStatus::Pending`] 挂起，直到子通道完成注册后在客户端循环上完成；
///   - `do_write` 把已冲刷的消息直接推入对端的入站队列，随后通知对端读取；
///   - 对端处于读取等待（`read_in_progress`）时才真正投递，否则消息留在队列中等待下一次 `read`。
/// - **契约 (What)**：
///   - 消息在对端按写出顺序出现且恰好一次；
///   - 关闭一端时，对端先收到所有未读消息，再变为未激活；
///   - 对端之间互持强引用，任意一端关闭时断开自己一侧。
/// - **风险 (Trade-offs)**：同一循环上的双向回显会形成递归投递，嵌套超过
///   [`LocalConfig::max_reader_stack_depth`] 后退化为任务提交，延迟略有增加。
pub struct LocalChannel {
    registry: LocalRegistry,
    config: LocalConfig,
    link: Mutex<Link>,
    inbound: Mutex<VecDeque<PipelineMessage>>,
    read_in_progress: AtomicBool,
    write_in_progress: AtomicBool,
    finish_read: Mutex<Option<ChannelFuture<()>>>,
}

impl LocalChannel {
    /// 以默认配置创建未注册的客户端通道。
    pub fn open(registry: &LocalRegistry) -> Channel {
        Self::open_with(registry, LocalConfig::default(), ChannelConfig::default())
    }

    /// 以给定配置创建未注册的客户端通道。
    pub fn open_with(
        registry: &LocalRegistry,
        config: LocalConfig,
        channel_config: ChannelConfig,
    ) -> Channel {
        let transport = Self::new(
            registry.clone(),
            config,
            Link {
                state: LinkState::Open,
                peer: None,
                local: None,
                remote: None,
            },
        );
        Channel::new(transport, None, channel_config)
    }

    /// 服务端为 `client` 创建的子通道；本端地址即服务端地址。
    pub(crate) fn accepted(
        registry: LocalRegistry,
        config: LocalConfig,
        server: &Channel,
        local: LocalAddress,
        client: &Channel,
        client_address: Option<LocalAddress>,
    ) -> Channel {
        let transport = Self::new(
            registry,
            config,
            Link {
                state: LinkState::Open,
                peer: Some(client.clone()),
                local: Some(local),
                remote: client_address,
            },
        );
        Channel::new(transport, Some(server.clone()), ChannelConfig::default())
    }

    fn new(registry: LocalRegistry, config: LocalConfig, link: Link) -> Self {
        Self {
            registry,
            config,
            link: Mutex::new(link),
            inbound: Mutex::new(VecDeque::new()),
            read_in_progress: AtomicBool::new(false),
            write_in_progress: AtomicBool::new(false),
            finish_read: Mutex::new(None),
        }
    }

    /// 尚未交给流水线的入站消息数。
    pub fn unread(&self) -> usize {
        self.inbound.lock().len()
    }

    fn of(channel: &Channel) -> Option<&Self> {
        channel.transport_as::<Self>()
    }

    fn link_state(&self) -> LinkState {
        self.link.lock().state
    }

    fn local(&self) -> Option<LocalAddress> {
        self.link.lock().local.clone()
    }

    fn reader_depth_limit(&self, event_loop: &EventLoop) -> usize {
        self.config
            .max_reader_stack_depth
            .min(event_loop.max_reentrant_depth())
    }

    /// 对端子通道注册成功：本端进入已连接状态。
    fn peer_accepted(&self) {
        let mut link = self.link.lock();
        if link.state != LinkState::Closed {
            link.state = LinkState::Connected;
        }
    }

    fn poll_inbound(&self) -> Option<PipelineMessage> {
        self.inbound.lock().pop_front()
    }

    fn has_inbound(&self) -> bool {
        !self.inbound.lock().is_empty()
    }

    fn read_inbound(&self, channel: &Channel) {
        let max_messages = channel.config().max_messages_per_read().max(1);
        let pipeline = channel.pipeline();
        for _ in 0..max_messages {
            let Some(message) = self.poll_inbound() else {
                break;
            };
            pipeline.fire_channel_read(message);
        }
        pipeline.fire_channel_read_complete();
    }

    /// 不论读取意愿，把队列中的消息全部交给流水线；用于对端关闭前的最后投递。
    fn drain_inbound(&self, channel: &Channel) {
        self.read_in_progress.store(false, Ordering::Release);
        if !self.has_inbound() {
            return;
        }
        let pipeline = channel.pipeline();
        while let Some(message) = self.poll_inbound() {
            pipeline.fire_channel_read(message);
        }
        pipeline.fire_channel_read_complete();
    }

    fn release_inbound(&self) {
        self.read_in_progress.store(false, Ordering::Release);
        let dropped = mem::take(&mut *self.inbound.lock());
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "dropped unread local messages");
        }
    }

    /// 通知 `peer` 有新消息：同一循环且对端不在写出时内联执行，否则提交到对端循环。
    fn finish_peer_read(&self, channel: &Channel, peer: &Channel) {
        let Some(remote) = Self::of(peer) else {
            return;
        };
        let Some(peer_loop) = peer.event_loop() else {
            return;
        };
        let same_loop = channel
            .event_loop()
            .is_some_and(|own| own.same(&peer_loop));
        if same_loop && !remote.write_in_progress.load(Ordering::Acquire) {
            match peer_loop.enter_reentrant(remote.reader_depth_limit(&peer_loop)) {
                Some(_depth) => Self::finish_peer_read0(peer),
                None => Self::schedule_finish_peer_read(peer, &peer_loop),
            }
        } else {
            Self::schedule_finish_peer_read(peer, &peer_loop);
        }
    }

    fn schedule_finish_peer_read(peer: &Channel, peer_loop: &EventLoop) {
        let Some(remote) = Self::of(peer) else {
            return;
        };
        let target = peer.clone();
        let task = move || Self::finish_peer_read0(&target);
        if remote.write_in_progress.load(Ordering::Acquire) {
            let future = peer_loop.submit(task);
            if let Some(Err(error)) = future.outcome() {
                warn!(channel = %peer.id(), %error, "local peer read was not scheduled");
                remote.release_inbound();
                return;
            }
            *remote.finish_read.lock() = Some(future);
        } else if let Err(error) = peer_loop.execute(task) {
            warn!(channel = %peer.id(), %error, "local peer read was not scheduled");
            remote.release_inbound();
        }
    }

    fn finish_peer_read0(peer: &Channel) {
        let Some(remote) = Self::of(peer) else {
            return;
        };
        {
            let mut pending = remote.finish_read.lock();
            match pending.as_ref().map(ChannelFuture::is_done) {
                Some(false) => {
                    drop(pending);
                    if let Some(peer_loop) = peer.event_loop() {
                        Self::schedule_finish_peer_read(peer, &peer_loop);
                    }
                    return;
                }
                Some(true) => *pending = None,
                None => {}
            }
        }
        if remote.read_in_progress.load(Ordering::Acquire) && remote.has_inbound() {
            remote.read_in_progress.store(false, Ordering::Release);
            remote.read_inbound(peer);
        }
    }

    /// 在 `peer` 的循环上关闭它；它此前处于激活状态时先投递未读消息。
    fn close_peer(peer: Channel) {
        let was_active = peer.is_active();
        let Some(peer_loop) = peer.event_loop() else {
            peer.unsafe_ops().close_forcibly();
            return;
        };
        let target = peer.clone();
        if let Err(error) = peer_loop.execute(move || Self::try_close(&target, was_active)) {
            warn!(channel = %peer.id(), %error, "could not close the local peer");
            if let Some(remote) = Self::of(&peer) {
                remote.release_inbound();
            }
        }
    }

    fn try_close(peer: &Channel, was_active: bool) {
        let Some(remote) = Self::of(peer) else {
            return;
        };
        if was_active {
            remote.drain_inbound(peer);
        }
        if peer.is_open() {
            peer.unsafe_ops().close(peer.new_promise());
        } else {
            remote.release_inbound();
        }
    }
}

impl Transport for LocalChannel {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_open(&self) -> bool {
        self.link_state() != LinkState::Closed
    }

    fn is_active(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    fn local_address(&self) -> Option<SocketAddress> {
        self.local().map(SocketAddress::from)
    }

    fn remote_address(&self) -> Option<SocketAddress> {
        self.link.lock().remote.clone().map(SocketAddress::from)
    }

    fn do_register(&self, channel: &Channel) -> Result<()> {
        if channel.parent().is_none() {
            return Ok(());
        }
        let peer = {
            let mut link = self.link.lock();
            if link.state != LinkState::Open {
                return Ok(());
            }
            link.state = LinkState::Connected;
            link.peer.clone()
        };
        let Some(peer) = peer else {
            return Err(ChannelError::closed("local peer is gone"));
        };
        if !peer.is_open() {
            return Err(ChannelError::closed("local peer closed before it was accepted"));
        }
        if let Some(remote) = Self::of(&peer) {
            remote.peer_accepted();
        }
        let peer_loop = peer.event_loop().ok_or(ChannelError::NotRegistered)?;
        let target = peer.clone();
        peer_loop.execute(move || target.unsafe_ops().finish_connect())
    }

    fn do_bind(&self, channel: &Channel, local: &SocketAddress) -> Result<()> {
        let requested = local
            .as_local()
            .ok_or_else(|| ChannelError::UnsupportedAddress {
                address: local.clone(),
            })?;
        if self.link_state() != LinkState::Open {
            return Err(ChannelError::illegal_state("local channel is already bound"));
        }
        let address = self.registry.register(channel, requested)?;
        let mut link = self.link.lock();
        link.local = Some(address);
        link.state = LinkState::Bound;
        Ok(())
    }

    fn do_connect(
        &self,
        channel: &Channel,
        remote: &SocketAddress,
        local: Option<&SocketAddress>,
    ) -> Result<ConnectStatus> {
        let target = remote
            .as_local()
            .ok_or_else(|| ChannelError::UnsupportedAddress {
                address: remote.clone(),
            })?
            .clone();
        match self.link_state() {
            LinkState::Connected => return Err(ChannelError::AlreadyConnected),
            LinkState::Closed => return Err(ChannelError::closed("local channel is closed")),
            LinkState::Open | LinkState::Bound => {}
        }
        if let Some(local) = local {
            self.do_bind(channel, local)?;
        } else if self.link_state() != LinkState::Bound {
            self.do_bind(channel, &SocketAddress::from(LocalAddress::ANY))?;
        }

        let refused = || ChannelError::ConnectionRefused {
            remote: remote.clone(),
        };
        let server = self.registry.get(&target).ok_or_else(refused)?;
        let acceptor = server
            .transport_as::<LocalServerChannel>()
            .filter(|acceptor| acceptor.is_active())
            .ok_or_else(refused)?;
        let child = acceptor.serve(&server, channel, self.local())?;
        debug!(channel = %channel.id(), child = %child.id(), remote = %target, "local connection accepted");

        let mut link = self.link.lock();
        link.peer = Some(child);
        link.remote = Some(target);
        Ok(ConnectStatus::Pending)
    }

    fn do_disconnect(&self, channel: &Channel) -> Result<()> {
        self.do_close(channel)
    }

    fn do_close(&self, channel: &Channel) -> Result<()> {
        let (previous, peer, local) = {
            let mut link = self.link.lock();
            let previous = mem::replace(&mut link.state, LinkState::Closed);
            (previous, link.peer.take(), link.local.clone())
        };
        if previous != LinkState::Closed {
            if channel.parent().is_none()
                && let Some(local) = local
            {
                self.registry.unregister(&local);
            }
            if let Some(peer) = &peer
                && self.write_in_progress.load(Ordering::Acquire)
            {
                self.finish_peer_read(channel, peer);
            }
        }
        if let Some(peer) = peer {
            Self::close_peer(peer);
        }
        self.release_inbound();
        Ok(())
    }

    fn do_begin_read(&self, channel: &Channel) -> Result<()> {
        if self.read_in_progress.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.has_inbound() {
            self.read_in_progress.store(true, Ordering::Release);
            return Ok(());
        }
        let Some(event_loop) = channel.event_loop() else {
            return Ok(());
        };
        match event_loop.enter_reentrant(self.reader_depth_limit(&event_loop)) {
            Some(_depth) => self.read_inbound(channel),
            None => {
                let target = channel.clone();
                event_loop.execute(move || {
                    if let Some(transport) = Self::of(&target)
                        && transport.has_inbound()
                    {
                        transport.read_inbound(&target);
                    }
                })?;
            }
        }
        Ok(())
    }

    fn do_write(&self, channel: &Channel, buffer: &Arc<ChannelOutboundBuffer>) -> Result<()> {
        let peer = {
            let link = self.link.lock();
            match link.state {
                LinkState::Open | LinkState::Bound => return Err(ChannelError::NotYetConnected),
                LinkState::Closed => return Err(ChannelError::closed("local channel is closed")),
                LinkState::Connected => link.peer.clone(),
            }
        };
        let peer = peer.ok_or_else(|| ChannelError::closed("local peer is gone"))?;
        let remote = Self::of(&peer)
            .ok_or_else(|| ChannelError::illegal_state("local peer is not a local channel"))?;

        self.write_in_progress.store(true, Ordering::Release);
        while let Some(message) = buffer.take_current() {
            if remote.link_state() == LinkState::Connected {
                remote.inbound.lock().push_back(message);
                buffer.remove();
            } else {
                drop(message);
                buffer.remove_failed(ChannelError::closed("local peer is closed"));
            }
        }
        self.write_in_progress.store(false, Ordering::Release);
        self.finish_peer_read(channel, &peer);
        Ok(())
    }
}
