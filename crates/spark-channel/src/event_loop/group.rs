use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::channel::Channel;
use crate::config::EventLoopConfig;
use crate::error::Result;
use crate::future::{ChannelFuture, ChannelPromise};

use super::EventLoop;

/// 一组事件循环，按轮询方式分配通道。
///
/// # 教案式说明
/// - **意图 (Why)**：服务端通道接受的子通道可以分布到另一组循环上（子循环组），把接受与读写负载分开；
/// - **逻辑 (How)**：`next()` 以原子计数取模选择循环；关闭时向所有成员发出优雅关闭并聚合终止结果；
/// - **契约 (What)**：组内至少包含一个循环；成员线程名为 `{name}-{index}`。
#[derive(Clone, Debug)]
pub struct EventLoopGroup {
    loops: Arc<[EventLoop]>,
    next: Arc<AtomicUsize>,
}

impl EventLoopGroup {
    /// 启动 `threads` 个循环（至少一个）。
    pub fn new(threads: usize, config: EventLoopConfig) -> Result<Self> {
        let loops = (0..threads.max(1))
            .map(|index| {
                let mut member = config.clone();
                member.name = format!("{}-{index}", config.name);
                EventLoop::new(member)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            loops: loops.into(),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// 轮询选择下一个循环。
    pub fn next(&self) -> EventLoop {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }

    /// 把通道注册到下一个循环。
    pub fn register(&self, channel: &Channel) -> ChannelFuture<()> {
        self.next().register(channel)
    }

    /// 成员数量。
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// 组是否为空；构造保证至少一个成员，因此恒为 `false`。
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// 遍历成员。
    pub fn iter(&self) -> impl Iterator<Item = &EventLoop> {
        self.loops.iter()
    }

    /// 优雅关闭所有成员，返回全部终止后完成的 Future。
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> ChannelFuture<()> {
        let aggregate = ChannelPromise::new();
        let remaining = Arc::new(AtomicUsize::new(self.loops.len()));
        for event_loop in self.loops.iter() {
            let remaining = Arc::clone(&remaining);
            let aggregate = aggregate.clone();
            event_loop
                .shutdown_gracefully(quiet_period, timeout)
                .add_listener(move |_| {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        aggregate.try_success(());
                    }
                });
        }
        aggregate.future()
    }

    /// 是否所有成员都已终止。
    pub fn is_terminated(&self) -> bool {
        self.loops.iter().all(EventLoop::is_terminated)
    }
}
