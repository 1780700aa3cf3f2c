use bytes::{Bytes, BytesMut};

/// 把新读到的字节块并入累积缓冲的策略。
pub trait Cumulator: Send + Sync + 'static {
    /// 返回包含 `cumulation` 全部未读字节且其后紧跟 `incoming` 的缓冲。
    fn cumulate(&self, cumulation: BytesMut, incoming: Bytes) -> BytesMut;
}

/// 原地追加：剩余容量不足时由 `BytesMut` 扩容（优先回收已消费前缀占用的空间）。
///
/// 大多数场景的默认选择，连续小块读取时几乎不产生额外拷贝。
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeCumulator;

impl Cumulator for MergeCumulator {
    fn cumulate(&self, mut cumulation: BytesMut, incoming: Bytes) -> BytesMut {
        if cumulation.is_empty() {
            return BytesMut::from(incoming.as_ref());
        }
        cumulation.extend_from_slice(&incoming);
        cumulation
    }
}

/// 每次都分配恰好容纳两段数据的新缓冲并拷贝。
///
/// 旧缓冲立即释放，适合读取间隔长、希望累积缓冲不保留多余容量的连接。
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpandCumulator;

impl Cumulator for ExpandCumulator {
    fn cumulate(&self, cumulation: BytesMut, incoming: Bytes) -> BytesMut {
        let mut expanded = BytesMut::with_capacity(cumulation.len() + incoming.len());
        expanded.extend_from_slice(&cumulation);
        expanded.extend_from_slice(&incoming);
        expanded
    }
}
