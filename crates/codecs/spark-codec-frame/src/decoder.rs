use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spark_channel::{
    ChannelError, ChannelHandler, ChannelHandlerContext, EventMask, PipelineMessage, Result,
};

use crate::cumulator::{Cumulator, MergeCumulator};

/// 默认每累积多少次读取压缩一次累积缓冲。
pub const DEFAULT_DISCARD_AFTER_READS: usize = 16;

/// 从累积字节中切分消息的解码器。
///
/// # 契约 (What)
/// - `decode` 在字节不足以组成一条消息时返回 `Ok(None)`，且可以消费部分字节（例如丢弃超长帧）；
/// - 返回 `Some` 时必须至少消费一个字节，否则视为解码器缺陷并以 `Decoder` 错误上报；
/// - 返回的错误若已是解码类错误（帧损坏、帧过长）则原样传播，其他错误被包装为 `Decoder`。
pub trait FrameDecoder: Send + 'static {
    /// 尝试切分一条消息。
    fn decode(&mut self, input: &mut BytesMut) -> Result<Option<PipelineMessage>>;

    /// 通道失活时最后一次解码；默认在仍有字节时再调用一次 [`Self::decode`]。
    fn decode_last(&mut self, input: &mut BytesMut) -> Result<Option<PipelineMessage>> {
        if input.is_empty() {
            Ok(None)
        } else {
            self.decode(input)
        }
    }
}

struct DecoderState<D> {
    decoder: D,
    cumulation: BytesMut,
    reads: usize,
    fired_channel_read: bool,
}

enum Step {
    Produced(PipelineMessage),
    NeedMore,
    Consumed,
}

/// 把入站字节块累积后交给 [`FrameDecoder`] 切分，并逐条向后传播解出的消息。
///
/// # 教案式说明
/// - **意图 (Why)**：传输层的每次读取只是任意长度的字节块，解码器需要跨读取保存尚未成帧的字节；
/// - **逻辑 (How)**：
///   1. 入站字节块经 [`Cumulator`] 并入累积缓冲，非字节消息原样透传；
///   2. 循环调用 [`FrameDecoder::decode`]，每解出一条消息就在释放内部锁之后向后传播，
///      处理器被移除、字节不再被消费或开启 `single_decode` 时停止；
///   3. 累积缓冲读空后重置读取计数；否则每 `discard_after_reads` 次读取压缩一次，归还已消费前缀占用的内存；
///   4. 通道失活时先正常解码，再调用 [`FrameDecoder::decode_last`]；处理器被移除时把剩余字节原样向后传播。
/// - **契约 (What)**：解码错误在已解出的消息传播之后返回，由流水线转为下一个处理器的 `exception_caught`。
/// - **风险 (Trade-offs)**：内部状态由互斥锁保护，但锁从不跨越事件传播，下游处理器可以安全地重入本处理器。
pub struct ByteToMessageDecoder<D> {
    state: Mutex<DecoderState<D>>,
    cumulator: Arc<dyn Cumulator>,
    discard_after_reads: usize,
    single_decode: bool,
}

impl<D: FrameDecoder> ByteToMessageDecoder<D> {
    /// 以 [`MergeCumulator`] 包装 `decoder`。
    pub fn new(decoder: D) -> Self {
        Self {
            state: Mutex::new(DecoderState {
                decoder,
                cumulation: BytesMut::new(),
                reads: 0,
                fired_channel_read: false,
            }),
            cumulator: Arc::new(MergeCumulator),
            discard_after_reads: DEFAULT_DISCARD_AFTER_READS,
            single_decode: false,
        }
    }

    /// 替换累积策略。
    pub fn with_cumulator(mut self, cumulator: Arc<dyn Cumulator>) -> Self {
        self.cumulator = cumulator;
        self
    }

    /// 设置压缩间隔（至少为 1）。
    pub fn with_discard_after_reads(mut self, reads: usize) -> Self {
        self.discard_after_reads = reads.max(1);
        self
    }

    /// 为真时每次读取最多解出一条消息，便于在协议升级时于帧边界处替换处理器。
    pub fn with_single_decode(mut self, single_decode: bool) -> Self {
        self.single_decode = single_decode;
        self
    }

    /// 累积缓冲中尚未解码的字节数。
    pub fn actual_readable_bytes(&self) -> usize {
        self.state.lock().cumulation.len()
    }

    fn decode_step(&self, last: bool) -> Result<Step> {
        let mut state = self.state.lock();
        let DecoderState {
            decoder,
            cumulation,
            fired_channel_read,
            ..
        } = &mut *state;
        let before = cumulation.len();
        let decoded = if last {
            decoder.decode_last(cumulation)
        } else {
            decoder.decode(cumulation)
        }
        .map_err(wrap_decoder_error)?;
        match decoded {
            Some(_) if cumulation.len() == before => Err(ChannelError::decoder_message(
                "decode() did not read anything but decoded a message",
            )),
            Some(message) => {
                *fired_channel_read = true;
                Ok(Step::Produced(message))
            }
            None if cumulation.len() == before => Ok(Step::NeedMore),
            None => Ok(Step::Consumed),
        }
    }

    fn call_decode(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        loop {
            if self.state.lock().cumulation.is_empty() {
                return Ok(());
            }
            match self.decode_step(false)? {
                Step::Produced(message) => {
                    ctx.fire_channel_read(message);
                    if self.single_decode {
                        return Ok(());
                    }
                }
                Step::NeedMore => return Ok(()),
                Step::Consumed => {}
            }
            if ctx.is_removed() {
                return Ok(());
            }
        }
    }

    fn after_read(&self) {
        let mut state = self.state.lock();
        if state.cumulation.is_empty() {
            state.reads = 0;
            state.cumulation = BytesMut::new();
            return;
        }
        state.reads += 1;
        if state.reads >= self.discard_after_reads {
            state.reads = 0;
            compact(&mut state.cumulation);
        }
    }

    fn take_leftover(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        state.reads = 0;
        let leftover = std::mem::take(&mut state.cumulation);
        (!leftover.is_empty()).then(|| leftover.freeze())
    }

    /// 输入关闭：正常解码后执行最后一次解码，并清空累积缓冲。
    fn input_closed(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        let decoded = self.call_decode(ctx);
        let last = match decoded {
            Ok(()) if !ctx.is_removed() => match self.decode_step(true) {
                Ok(Step::Produced(message)) => {
                    ctx.fire_channel_read(message);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(error) => Err(error),
            },
            other => other,
        };
        let fired = {
            let mut state = self.state.lock();
            state.cumulation = BytesMut::new();
            state.reads = 0;
            std::mem::take(&mut state.fired_channel_read)
        };
        if fired {
            ctx.fire_channel_read_complete();
        }
        last
    }
}

impl<D: FrameDecoder> ChannelHandler for ByteToMessageDecoder<D> {
    fn event_mask(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::CHANNEL_READ_COMPLETE | EventMask::CHANNEL_INACTIVE
    }

    fn handler_removed(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        if let Some(leftover) = self.take_leftover() {
            ctx.fire_channel_read(PipelineMessage::Bytes(leftover));
            ctx.fire_channel_read_complete();
        }
        Ok(())
    }

    fn channel_read(&self, ctx: &ChannelHandlerContext, message: PipelineMessage) -> Result<()> {
        let incoming = match message.into_bytes() {
            Ok(bytes) => bytes,
            Err(other) => {
                ctx.fire_channel_read(other);
                return Ok(());
            }
        };
        {
            let mut state = self.state.lock();
            let cumulation = std::mem::take(&mut state.cumulation);
            state.cumulation = self.cumulator.cumulate(cumulation, incoming);
        }
        let decoded = self.call_decode(ctx);
        self.after_read();
        decoded
    }

    fn channel_read_complete(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        let fired = {
            let mut state = self.state.lock();
            state.reads = 0;
            if !state.cumulation.is_empty() {
                compact(&mut state.cumulation);
            }
            std::mem::take(&mut state.fired_channel_read)
        };
        if !fired && ctx.channel().is_some_and(|channel| !channel.config().auto_read()) {
            ctx.read();
        }
        ctx.fire_channel_read_complete();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        let closed = self.input_closed(ctx);
        ctx.fire_channel_inactive();
        closed
    }
}

/// 把未读字节搬到一块恰好大小的新缓冲，释放已消费前缀与多余容量。
fn compact(cumulation: &mut BytesMut) {
    if cumulation.capacity() > cumulation.len() * 2 {
        *cumulation = BytesMut::from(&cumulation[..]);
    }
}

fn wrap_decoder_error(error: ChannelError) -> ChannelError {
    if error.is_decoder_error() {
        error
    } else {
        ChannelError::decoder("frame decoder failed", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 以单字节长度前缀切分的最小解码器。
    struct TinyFrames;

    impl FrameDecoder for TinyFrames {
        fn decode(&mut self, input: &mut BytesMut) -> Result<Option<PipelineMessage>> {
            let Some(&len) = input.first() else {
                return Ok(None);
            };
            if input.len() < 1 + len as usize {
                return Ok(None);
            }
            let mut frame = input.split_to(1 + len as usize);
            let _ = frame.split_to(1);
            Ok(Some(frame.freeze().into()))
        }
    }

    struct Lazy;

    impl FrameDecoder for Lazy {
        fn decode(&mut self, _input: &mut BytesMut) -> Result<Option<PipelineMessage>> {
            Ok(Some(PipelineMessage::from(&b"never consumed"[..])))
        }
    }

    #[test]
    fn decode_step_reports_progress() {
        let handler = ByteToMessageDecoder::new(TinyFrames);
        handler.state.lock().cumulation.extend_from_slice(&[2, b'h', b'i', 3, b'a']);
        assert!(matches!(handler.decode_step(false), Ok(Step::Produced(_))));
        assert!(matches!(handler.decode_step(false), Ok(Step::NeedMore)));
        assert_eq!(handler.actual_readable_bytes(), 2);
        assert!(handler.state.lock().fired_channel_read);
    }

    #[test]
    fn a_decoder_that_consumes_nothing_is_rejected() {
        let handler = ByteToMessageDecoder::new(Lazy);
        handler.state.lock().cumulation.extend_from_slice(b"abc");
        let error = handler.decode_step(false).err().expect("must fail");
        assert_eq!(error.code(), "spark.codec.decoder_failure");
    }

    #[test]
    fn compaction_only_copies_sparse_buffers() {
        let mut sparse = BytesMut::with_capacity(1024);
        sparse.extend_from_slice(b"tail");
        compact(&mut sparse);
        assert_eq!(&sparse[..], b"tail");
        assert!(sparse.capacity() < 1024);

        let mut dense = BytesMut::from(&b"full"[..]);
        let before = dense.capacity();
        compact(&mut dense);
        assert_eq!(dense.capacity(), before);
    }

    #[test]
    fn leftover_is_handed_back_once() {
        let handler = ByteToMessageDecoder::new(TinyFrames).with_discard_after_reads(0);
        assert_eq!(handler.discard_after_reads, 1);
        handler.state.lock().cumulation.extend_from_slice(&[9, 1, 2]);
        assert_eq!(handler.take_leftover().as_deref(), Some(&[9, 1, 2][..]));
        assert!(handler.take_leftover().is_none());
    }

    #[test]
    fn non_decoder_errors_are_wrapped() {
        let wrapped = wrap_decoder_error(ChannelError::illegal_state("boom"));
        assert_eq!(wrapped.code(), "spark.codec.decoder_failure");
        let kept = wrap_decoder_error(ChannelError::too_long_frame("big"));
        assert_eq!(kept.code(), "spark.codec.too_long_frame");
    }
}
