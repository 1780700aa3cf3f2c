use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use proptest::prelude::*;
use spark_channel::{
    ChannelOutboundBuffer, ChannelPromise, OutboundBufferOwner, PipelineMessage, Result,
    WriteBufferWaterMark,
};

struct CountingOwner {
    water_mark: WriteBufferWaterMark,
    open: AtomicBool,
    flips: AtomicUsize,
}

impl OutboundBufferOwner for CountingOwner {
    fn water_mark(&self) -> WriteBufferWaterMark {
        self.water_mark
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn fire_writability_changed(&self, _invoke_later: bool) {
        self.flips.fetch_add(1, Ordering::SeqCst);
    }

    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> Result<()> {
        task();
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum Op {
    Add(usize),
    Flush,
    Remove,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..=100).prop_map(Op::Add),
        1 => Just(Op::Flush),
        3 => Just(Op::Remove),
    ]
}

/// 参考模型：逐条记录待写字节，按滞回规则推导可写性。
#[derive(Default)]
struct Model {
    sizes: VecDeque<usize>,
    flushed: usize,
    total: usize,
    writable: bool,
    flips: usize,
}

impl Model {
    fn new() -> Self {
        Self {
            writable: true,
            ..Self::default()
        }
    }

    fn add(&mut self, size: usize, water_mark: WriteBufferWaterMark) {
        self.sizes.push_back(size);
        self.total += size;
        if size > 0 && self.writable && self.total > water_mark.high() {
            self.writable = false;
            self.flips += 1;
        }
    }

    fn flush(&mut self) {
        self.flushed = self.sizes.len();
    }

    fn remove(&mut self, water_mark: WriteBufferWaterMark) -> bool {
        if self.flushed == 0 {
            return false;
        }
        let size = self.sizes.pop_front().unwrap_or_default();
        self.flushed -= 1;
        self.total -= size;
        if size > 0 && !self.writable && self.total <= water_mark.low() {
            self.writable = true;
            self.flips += 1;
        }
        true
    }
}

proptest! {
    #[test]
    fn writability_has_hysteresis_between_the_water_marks(
        low in 0usize..200,
        gap in 0usize..200,
        ops in prop::collection::vec(op(), 0..300),
    ) {
        let water_mark = WriteBufferWaterMark::new(low, low + gap).expect("low never exceeds high");
        let owner = Arc::new(CountingOwner {
            water_mark,
            open: AtomicBool::new(true),
            flips: AtomicUsize::new(0),
        });
        let buffer = ChannelOutboundBuffer::new(owner.clone());
        let mut model = Model::new();
        let mut promises = Vec::new();

        for op in ops {
            match op {
                Op::Add(size) => {
                    let promise = ChannelPromise::new();
                    promises.push(promise.future());
                    buffer.add_message(PipelineMessage::from(vec![0_u8; size]), size, promise);
                    model.add(size, water_mark);
                }
                Op::Flush => {
                    buffer.add_flush();
                    model.flush();
                }
                Op::Remove => {
                    let had_head = buffer.has_current();
                    buffer.remove();
                    prop_assert_eq!(model.remove(water_mark), had_head);
                }
            }
            prop_assert_eq!(buffer.is_writable(), model.writable);
            prop_assert_eq!(owner.flips.load(Ordering::SeqCst), model.flips);
            prop_assert_eq!(buffer.total_pending_write_bytes(), model.total);
            prop_assert_eq!(buffer.size(), model.flushed);
            prop_assert_eq!(buffer.len(), model.sizes.len());
        }

        let completed = promises.iter().filter(|future| future.is_success()).count();
        prop_assert_eq!(completed, promises.len() - model.sizes.len());
    }
}

#[test]
fn writability_flips_once_per_crossing() {
    let water_mark = WriteBufferWaterMark::new(4, 8).expect("valid water mark");
    let owner = Arc::new(CountingOwner {
        water_mark,
        open: AtomicBool::new(true),
        flips: AtomicUsize::new(0),
    });
    let buffer = ChannelOutboundBuffer::new(owner.clone());
    for _ in 0..3 {
        buffer.add_message(PipelineMessage::from(vec![0_u8; 3]), 3, ChannelPromise::new());
    }
    assert!(!buffer.is_writable(), "9 bytes exceed the high water mark");
    buffer.add_message(PipelineMessage::from(vec![0_u8; 3]), 3, ChannelPromise::new());
    assert_eq!(owner.flips.load(Ordering::SeqCst), 1);

    buffer.add_flush();
    buffer.remove();
    buffer.remove();
    assert!(!buffer.is_writable(), "6 bytes still above the low water mark");
    buffer.remove();
    assert!(buffer.is_writable(), "3 bytes are at or below the low water mark");
    assert_eq!(owner.flips.load(Ordering::SeqCst), 2);
    assert_eq!(buffer.bytes_before_unwritable(), 6);
}
