//! 缓冲分配接口。
//!
//! # 教案式说明
//! - **意图 (Why)**：编解码器需要在不关心池化策略的前提下申请可写缓冲；池化、slab 等布局由外部分配器实现。
//! - **契约 (What)**：`allocate(size)` 返回容量至少为 `size`、长度为 0 的 [`BytesMut`]；
//!   缓冲的引用计数由 `bytes` 的原子计数承担，最后一个句柄释放时内存归还分配器。
//! - **风险 (Trade-offs)**：默认实现直接走全局堆，适合测试与进程内传输；高吞吐场景应注入池化实现。

use bytes::BytesMut;

/// 缓冲分配器。
pub trait BufferAllocator: Send + Sync + 'static {
    /// 分配容量不小于 `size` 的空缓冲。
    fn allocate(&self, size: usize) -> BytesMut;
}

/// 基于全局堆的默认分配器。
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapBufferAllocator;

impl BufferAllocator for HeapBufferAllocator {
    fn allocate(&self, size: usize) -> BytesMut {
        BytesMut::with_capacity(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocator_returns_empty_buffer_with_capacity() {
        let buffer = HeapBufferAllocator.allocate(64);
        assert!(buffer.is_empty());
        assert!(buffer.capacity() >= 64);
    }
}
