use bytes::BytesMut;
use spark_channel::{
    ChannelError, ChannelHandler, ChannelHandlerContext, ChannelPromise, EventMask,
    PipelineMessage, Result,
};

/// 把出站消息编码为字节的编码器。
pub trait MessageEncoder: Send + Sync + 'static {
    /// 是否处理该消息；不处理的消息原样向前传递。默认只处理字节消息。
    fn accepts(&self, message: &PipelineMessage) -> bool {
        message.as_bytes().is_some()
    }

    /// 预估编码后的字节数，用于一次性分配输出缓冲。
    fn encoded_len_hint(&self, message: &PipelineMessage) -> usize {
        message.as_bytes().map_or(0, |bytes| bytes.len())
    }

    /// 把 `message` 编码追加到 `out`。
    fn encode(&self, message: PipelineMessage, out: &mut BytesMut) -> Result<()>;
}

/// 出站编码处理器：对被接受的消息调用 [`MessageEncoder::encode`]，把结果作为单个字节消息继续写出。
///
/// 编码失败时写 Promise 以 `Encoder` 错误失败（已是编码错误的原样保留），消息不会继续传递。
/// 输出缓冲取自通道配置的分配器。
pub struct MessageToByteEncoder<E> {
    encoder: E,
}

impl<E: MessageEncoder> MessageToByteEncoder<E> {
    /// 包装编码器。
    pub fn new(encoder: E) -> Self {
        Self { encoder }
    }

    /// 被包装的编码器。
    pub fn encoder(&self) -> &E {
        &self.encoder
    }
}

impl<E: MessageEncoder> ChannelHandler for MessageToByteEncoder<E> {
    fn event_mask(&self) -> EventMask {
        EventMask::WRITE
    }

    fn write(
        &self,
        ctx: &ChannelHandlerContext,
        message: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<()> {
        if !self.encoder.accepts(&message) {
            ctx.write_with(message, promise);
            return Ok(());
        }
        let hint = self.encoder.encoded_len_hint(&message);
        let mut out = match ctx.channel() {
            Some(channel) => channel.allocator().allocate(hint),
            None => BytesMut::with_capacity(hint),
        };
        self.encoder
            .encode(message, &mut out)
            .map_err(|error| match error {
                ChannelError::Encoder { .. } => error,
                other => ChannelError::encoder("message encoder failed", other),
            })?;
        ctx.write_with(PipelineMessage::Bytes(out.freeze()), promise);
        Ok(())
    }
}
