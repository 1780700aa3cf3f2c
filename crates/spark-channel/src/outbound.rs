//! 出站写缓冲。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - `write` 只把消息排队，`flush` 才把已排队的区段交给传输层；两步之间需要一个保存消息与 Promise 的队列；
//! - 待写字节数需要驱动背压：超过高水位时通道变为不可写，回落到低水位及以下时恢复可写。
//!
//! ## 逻辑 (How)
//! - 环形数组保存 `Entry`，三个游标满足 `flushed ≤ unflushed ≤ tail`（按容量取模）：
//!   `[flushed, unflushed)` 为已冲刷待发送区段，`[unflushed, tail)` 为尚未冲刷区段；
//! - 每个槽位用 `Option` 显式标记是否占用；数组满时容量翻倍，并按逻辑顺序跨越回绕点拷贝；
//! - 待写字节数与不可写位图是原子量，任意线程可无锁读取；其余状态由内部互斥锁保护，
//!   所有回调（Promise 监听器、可写性事件）都在锁外触发。
//!
//! ## 契约 (What)
//! - 条目严格按 FIFO 移除，每个 Promise 恰好完成一次（成功、失败或此前已取消）；
//! - `size()` = 已冲刷未移除条目数 =（unflushed − flushed）mod 容量，`len()` = 全部条目数 =（tail − flushed）mod 容量；
//! - 变更只应在所属事件循环线程上发生（单写者），读取可在任意线程进行。
//!
//! ## 风险 (Trade-offs)
//! - 关闭后数组收缩回初始容量，突发大批量写入后的内存会被归还，但下一轮突发需要重新扩容。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bytes::Buf;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::WriteBufferWaterMark;
use crate::error::{ChannelError, Result};
use crate::future::ChannelPromise;
use crate::message::PipelineMessage;

/// 默认初始容量。
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

const WATER_MARK_BIT: u32 = 1;

/// 出站缓冲的所属方：提供水位、通道开闭状态、可写性事件与延迟执行能力。
///
/// 缓冲只通过该接口回指通道，关闭时丢弃这一回指。
pub trait OutboundBufferOwner: Send + Sync + 'static {
    /// 当前水位配置。
    fn water_mark(&self) -> WriteBufferWaterMark;

    /// 所属通道是否仍然打开。
    fn is_open(&self) -> bool;

    /// 触发可写性变化事件；`invoke_later` 为真时应投递到事件循环稍后执行。
    fn fire_writability_changed(&self, invoke_later: bool);

    /// 把任务投递到所属事件循环。
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> Result<()>;
}

struct Entry {
    message: Option<PipelineMessage>,
    promise: ChannelPromise,
    pending_size: usize,
    cancelled: bool,
}

impl Entry {
    /// 作废条目并返回应释放的字节数。
    fn cancel(&mut self) -> usize {
        if self.cancelled {
            return 0;
        }
        self.cancelled = true;
        self.message = None;
        std::mem::take(&mut self.pending_size)
    }
}

struct Ring {
    slots: Vec<Option<Entry>>,
    flushed: usize,
    unflushed: usize,
    tail: usize,
    len: usize,
    flushed_len: usize,
    in_fail: bool,
    owner: Option<Arc<dyn OutboundBufferOwner>>,
}

impl Ring {
    fn with_capacity(capacity: usize, owner: Option<Arc<dyn OutboundBufferOwner>>) -> Self {
        Self {
            slots: empty_slots(capacity),
            flushed: 0,
            unflushed: 0,
            tail: 0,
            len: 0,
            flushed_len: 0,
            in_fail: false,
            owner,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, entry: Entry) {
        if self.len == self.capacity() {
            self.grow();
        }
        let tail = self.tail;
        self.slots[tail] = Some(entry);
        self.tail = (tail + 1) % self.capacity();
        self.len += 1;
    }

    fn grow(&mut self) {
        let capacity = self.capacity();
        let mut next = empty_slots(capacity * 2);
        for (offset, slot) in next.iter_mut().enumerate().take(self.len) {
            *slot = self.slots[(self.flushed + offset) % capacity].take();
        }
        self.slots = next;
        self.flushed = 0;
        self.unflushed = self.flushed_len;
        self.tail = self.len;
    }

    fn head_mut(&mut self) -> Option<&mut Entry> {
        if self.flushed_len == 0 {
            return None;
        }
        let flushed = self.flushed;
        self.slots[flushed].as_mut()
    }

    fn pop_head(&mut self) -> Option<Entry> {
        if self.flushed_len == 0 {
            return None;
        }
        let entry = self.slots[self.flushed].take();
        self.flushed = (self.flushed + 1) % self.capacity();
        self.flushed_len -= 1;
        self.len -= 1;
        entry
    }

    /// 丢弃队首已取消的条目；它们的 Promise 已以取消完成，字节也已在 `add_flush` 时释放。
    fn purge_cancelled_head(&mut self) {
        while self.head_mut().is_some_and(|entry| entry.cancelled) {
            self.pop_head();
        }
    }
}

fn empty_slots(capacity: usize) -> Vec<Option<Entry>> {
    std::iter::repeat_with(|| None).take(capacity).collect()
}

/// 通道出站缓冲。
pub struct ChannelOutboundBuffer {
    ring: Mutex<Ring>,
    initial_capacity: usize,
    total_pending: AtomicUsize,
    unwritable: AtomicU32,
}

impl ChannelOutboundBuffer {
    /// 以默认初始容量创建缓冲。
    pub fn new(owner: Arc<dyn OutboundBufferOwner>) -> Arc<Self> {
        Self::with_capacity(owner, DEFAULT_INITIAL_CAPACITY)
    }

    /// 以给定初始容量（至少为 1）创建缓冲。
    pub fn with_capacity(owner: Arc<dyn OutboundBufferOwner>, capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            ring: Mutex::new(Ring::with_capacity(capacity, Some(owner))),
            initial_capacity: capacity,
            total_pending: AtomicUsize::new(0),
            unwritable: AtomicU32::new(0),
        })
    }

    /// 在 `tail` 追加一条消息，并计入待写字节。
    pub fn add_message(&self, message: PipelineMessage, size: usize, promise: ChannelPromise) {
        let owner = {
            let mut ring = self.ring.lock();
            ring.push(Entry {
                message: Some(message),
                promise,
                pending_size: size,
                cancelled: false,
            });
            ring.owner.clone()
        };
        self.increment_pending(size, false, owner.as_ref());
    }

    /// 把 `unflushed` 推进到 `tail`，使新区段可被发送。
    ///
    /// 区段中 Promise 已被取消的条目在此作废并释放其字节；其余条目的 Promise 被标记为不可取消。
    pub fn add_flush(&self) {
        let (released, owner) = {
            let mut ring = self.ring.lock();
            let pending = ring.len - ring.flushed_len;
            if pending == 0 {
                return;
            }
            let capacity = ring.capacity();
            let start = ring.unflushed;
            let mut released = 0;
            for offset in 0..pending {
                if let Some(entry) = ring.slots[(start + offset) % capacity].as_mut()
                    && !entry.promise.set_uncancellable()
                {
                    released += entry.cancel();
                }
            }
            ring.flushed_len = ring.len;
            ring.unflushed = ring.tail;
            (released, ring.owner.clone())
        };
        self.decrement_pending(released, false, true, owner.as_ref());
    }

    /// 在锁内窥视 `flushed` 处的消息，不移除。
    ///
    /// 闭包在内部锁持有期间执行，不得回调本缓冲。
    pub fn current_with<R>(&self, inspect: impl FnOnce(&PipelineMessage) -> R) -> Option<R> {
        let mut ring = self.ring.lock();
        ring.purge_cancelled_head();
        ring.head_mut()
            .and_then(|entry| entry.message.as_ref())
            .map(inspect)
    }

    /// 是否存在可发送的当前条目。
    pub fn has_current(&self) -> bool {
        let mut ring = self.ring.lock();
        ring.purge_cancelled_head();
        ring.flushed_len > 0
    }

    /// 把 `flushed` 处的消息移出，条目本身保留，调用方随后应调用 [`Self::remove`] 完成它。
    ///
    /// 进程内传输借此把消息所有权直接转交给对端，而不是复制。
    pub fn take_current(&self) -> Option<PipelineMessage> {
        let mut ring = self.ring.lock();
        ring.purge_cancelled_head();
        ring.head_mut().and_then(|entry| entry.message.take())
    }

    /// 移除 `flushed` 处的条目并以成功完成其 Promise；返回是否仍有已冲刷条目。
    pub fn remove(&self) -> bool {
        self.remove_entry(None, true)
    }

    /// 移除 `flushed` 处的条目并以 `cause` 失败其 Promise；返回是否仍有已冲刷条目。
    pub fn remove_failed(&self, cause: ChannelError) -> bool {
        self.remove_entry(Some(cause), true)
    }

    fn remove_entry(&self, cause: Option<ChannelError>, notify_writability: bool) -> bool {
        let (entry, remaining, owner) = {
            let mut ring = self.ring.lock();
            let Some(entry) = ring.pop_head() else {
                return false;
            };
            (entry, ring.flushed_len > 0, ring.owner.clone())
        };
        let Entry {
            message,
            promise,
            pending_size,
            cancelled,
        } = entry;
        drop(message);
        if !cancelled {
            match cause {
                None => promise.try_success(()),
                Some(cause) => promise.try_failure(cause),
            };
            self.decrement_pending(pending_size, false, notify_writability, owner.as_ref());
        }
        remaining
    }

    /// 按已写出的字节数推进队首的字节消息：完全写出的条目被移除，部分写出的条目原地前移。
    pub fn remove_bytes(&self, mut written: usize) {
        loop {
            let consumed = {
                let mut ring = self.ring.lock();
                ring.purge_cancelled_head();
                match ring.head_mut().and_then(|entry| entry.message.as_mut()) {
                    Some(PipelineMessage::Bytes(bytes)) if bytes.len() <= written => {
                        Some(bytes.len())
                    }
                    Some(PipelineMessage::Bytes(bytes)) => {
                        bytes.advance(written);
                        None
                    }
                    _ => None,
                }
            };
            match consumed {
                Some(len) => {
                    written -= len;
                    self.remove();
                }
                None => break,
            }
        }
    }

    /// 以 `cause` 失败全部已冲刷条目；重入调用直接返回。
    pub fn fail_flushed(&self, cause: ChannelError, notify_writability: bool) {
        {
            let mut ring = self.ring.lock();
            if ring.in_fail {
                return;
            }
            ring.in_fail = true;
        }
        while self.remove_entry(Some(cause.clone()), notify_writability) {}
        self.ring.lock().in_fail = false;
    }

    /// 关闭缓冲。
    ///
    /// # 契约 (What)
    /// - **前置条件**：所属通道已关闭，且不存在已冲刷未处理的条目，否则返回 `IllegalState`；
    /// - 以 `cause` 失败全部未冲刷条目，不触发可写性事件；
    /// - 若正处于失败流程中（重入），本次关闭投递到事件循环稍后执行，而不是递归；
    /// - 完成后数组收缩回初始容量，并丢弃对所属通道的回指。
    pub fn close(self: &Arc<Self>, cause: ChannelError) -> Result<()> {
        let (owner, reentrant) = {
            let ring = self.ring.lock();
            (ring.owner.clone(), ring.in_fail)
        };
        if reentrant {
            if let Some(owner) = owner {
                let this = Arc::clone(self);
                owner.execute(Box::new(move || {
                    if let Err(error) = this.close(cause) {
                        warn!(%error, "deferred outbound buffer close failed");
                    }
                }))?;
            }
            return Ok(());
        }
        if owner.as_ref().is_some_and(|owner| owner.is_open()) {
            return Err(ChannelError::illegal_state(
                "close() must be invoked after the channel is closed",
            ));
        }
        let entries = {
            let mut ring = self.ring.lock();
            if ring.flushed_len != 0 {
                return Err(ChannelError::illegal_state(
                    "close() must be invoked after all flushed writes are handled",
                ));
            }
            ring.in_fail = true;
            let slots = std::mem::replace(&mut ring.slots, empty_slots(self.initial_capacity));
            ring.flushed = 0;
            ring.unflushed = 0;
            ring.tail = 0;
            ring.len = 0;
            slots
        };
        for entry in entries.into_iter().flatten() {
            if entry.cancelled {
                continue;
            }
            self.total_pending
                .fetch_sub(entry.pending_size, Ordering::AcqRel);
            entry.promise.try_failure(cause.clone());
        }
        let mut ring = self.ring.lock();
        ring.in_fail = false;
        ring.owner = None;
        Ok(())
    }

    fn increment_pending(
        &self,
        size: usize,
        invoke_later: bool,
        owner: Option<&Arc<dyn OutboundBufferOwner>>,
    ) {
        if size == 0 {
            return;
        }
        let total = self.total_pending.fetch_add(size, Ordering::AcqRel) + size;
        if let Some(owner) = owner
            && total > owner.water_mark().high()
        {
            let previous = self.unwritable.fetch_or(WATER_MARK_BIT, Ordering::AcqRel);
            if previous == 0 {
                owner.fire_writability_changed(invoke_later);
            }
        }
    }

    fn decrement_pending(
        &self,
        size: usize,
        invoke_later: bool,
        notify_writability: bool,
        owner: Option<&Arc<dyn OutboundBufferOwner>>,
    ) {
        if size == 0 {
            return;
        }
        let total = self.total_pending.fetch_sub(size, Ordering::AcqRel) - size;
        if notify_writability
            && let Some(owner) = owner
            && total <= owner.water_mark().low()
        {
            let previous = self.unwritable.fetch_and(!WATER_MARK_BIT, Ordering::AcqRel);
            if previous == WATER_MARK_BIT {
                owner.fire_writability_changed(invoke_later);
            }
        }
    }

    /// 是否可写：水位位与所有用户自定义位均未置位。
    pub fn is_writable(&self) -> bool {
        self.unwritable.load(Ordering::Acquire) == 0
    }

    /// 读取用户自定义可写位（`index` 取 1..=31）。
    pub fn user_defined_writability(&self, index: u32) -> Result<bool> {
        let mask = user_bit(index)?;
        Ok(self.unwritable.load(Ordering::Acquire) & mask == 0)
    }

    /// 设置用户自定义可写位（`index` 取 1..=31），整体可写性翻转时触发事件。
    pub fn set_user_defined_writability(&self, index: u32, writable: bool) -> Result<()> {
        let mask = user_bit(index)?;
        let owner = self.ring.lock().owner.clone();
        let flipped = if writable {
            let previous = self.unwritable.fetch_and(!mask, Ordering::AcqRel);
            previous != 0 && previous & !mask == 0
        } else {
            self.unwritable.fetch_or(mask, Ordering::AcqRel) == 0
        };
        if flipped && let Some(owner) = owner {
            owner.fire_writability_changed(false);
        }
        Ok(())
    }

    /// 在消息之外登记待写字节（例如处理器暂存、尚未写入缓冲的数据）；越过高水位时可写性事件投递到循环稍后触发。
    pub fn increment_pending_outbound_bytes(&self, size: usize) {
        let owner = self.ring.lock().owner.clone();
        self.increment_pending(size, true, owner.as_ref());
    }

    /// 撤销 [`ChannelOutboundBuffer::increment_pending_outbound_bytes`] 登记的字节。
    pub fn decrement_pending_outbound_bytes(&self, size: usize) {
        let owner = self.ring.lock().owner.clone();
        self.decrement_pending(size, true, true, owner.as_ref());
    }

    /// 当前待写字节数。
    pub fn total_pending_write_bytes(&self) -> usize {
        self.total_pending.load(Ordering::Acquire)
    }

    /// 还能写入多少字节才会变为不可写；当前不可写时为 0。
    pub fn bytes_before_unwritable(&self) -> usize {
        let Some(owner) = self.ring.lock().owner.clone() else {
            return 0;
        };
        if !self.is_writable() {
            return 0;
        }
        (owner.water_mark().high() + 1).saturating_sub(self.total_pending_write_bytes())
    }

    /// 还需排出多少字节才会恢复可写；当前可写时为 0。
    pub fn bytes_before_writable(&self) -> usize {
        let Some(owner) = self.ring.lock().owner.clone() else {
            return 0;
        };
        if self.is_writable() {
            return 0;
        }
        self.total_pending_write_bytes()
            .saturating_sub(owner.water_mark().low())
    }

    /// 已冲刷未移除的条目数。
    pub fn size(&self) -> usize {
        self.ring.lock().flushed_len
    }

    /// 全部条目数（已冲刷与未冲刷）。
    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    /// 是否没有已冲刷待发送的条目。
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 当前数组容量。
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }
}

fn user_bit(index: u32) -> Result<u32> {
    if !(1..=31).contains(&index) {
        return Err(ChannelError::illegal_argument(format!(
            "user defined writability index must be in 1..=31, got {index}"
        )));
    }
    Ok(1 << index)
}

impl fmt::Debug for ChannelOutboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("ChannelOutboundBuffer")
            .field("capacity", &ring.capacity())
            .field("flushed", &ring.flushed)
            .field("unflushed", &ring.unflushed)
            .field("tail", &ring.tail)
            .field("pending_bytes", &self.total_pending.load(Ordering::Acquire))
            .field("writable", &self.is_writable())
            .finish()
    }
}
