use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use spark_channel::{Channel, ChannelError, LocalAddress, Result};
use tracing::debug;

/// 本地地址到服务端通道的绑定表。
///
/// # 教案式说明
/// - **意图 (Why)**：客户端按地址寻找服务端，需要一张进程内共享的表；
///   表作为显式句柄传给通道，而不是全局单例，测试之间因此互不干扰。
/// - **逻辑 (How)**：`DashMap` 分片加锁，绑定使用 `entry` 保证“检查并插入”是原子的；
///   请求 [`LocalAddress::ANY`] 时分配单调递增的临时地址。
/// - **契约 (What)**：同一地址同时只能有一个绑定者，重复绑定返回 `AddressInUse`；
///   通道关闭时由传输实现注销自己的地址。
#[derive(Clone, Default)]
pub struct LocalRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    bound: DashMap<LocalAddress, Channel>,
    next_ephemeral: AtomicU64,
}

impl LocalRegistry {
    /// 创建空的绑定表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 把 `channel` 绑定到 `requested`，返回实际绑定的地址。
    pub fn register(&self, channel: &Channel, requested: &LocalAddress) -> Result<LocalAddress> {
        let address = if requested.is_any() {
            let serial = self.inner.next_ephemeral.fetch_add(1, Ordering::Relaxed) + 1;
            LocalAddress::ephemeral(serial)
        } else {
            requested.clone()
        };
        match self.inner.bound.entry(address.clone()) {
            Entry::Occupied(_) => Err(ChannelError::AddressInUse {
                address: address.into(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(channel.clone());
                debug!(channel = %channel.id(), %address, "bound local address");
                Ok(address)
            }
        }
    }

    /// 查找绑定到 `address` 的通道。
    pub fn get(&self, address: &LocalAddress) -> Option<Channel> {
        self.inner
            .bound
            .get(address)
            .map(|entry| entry.value().clone())
    }

    /// 注销 `address`，返回原先绑定的通道。
    pub fn unregister(&self, address: &LocalAddress) -> Option<Channel> {
        let removed = self.inner.bound.remove(address).map(|(_, channel)| channel);
        if removed.is_some() {
            debug!(%address, "released local address");
        }
        removed
    }

    pub fn contains(&self, address: &LocalAddress) -> bool {
        self.inner.bound.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.inner.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bound.is_empty()
    }
}

impl fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRegistry")
            .field("bound", &self.len())
            .finish()
    }
}
