use bytes::BytesMut;
use spark_channel::{ChannelError, PipelineMessage, Result};

use crate::config::PrependerConfig;
use crate::encoder::MessageEncoder;

/// 在载荷前写入长度字段的编码器，与 [`LengthFieldBasedFrameDecoder`](crate::LengthFieldBasedFrameDecoder) 配对使用。
///
/// # 教案式说明
/// - **逻辑 (How)**：长度 = 载荷字节数 + `length_adjustment`，配置为包含自身时再加上字段宽度；
///   校验长度非负且能放进字段宽度，随后依次写出长度字段与载荷。
/// - **契约 (What)**：只处理字节消息；长度越界时返回 `Encoder` 错误，写 Promise 随之失败。
#[derive(Clone, Debug)]
pub struct LengthFieldPrepender {
    config: PrependerConfig,
}

impl LengthFieldPrepender {
    /// 以字段宽度创建（小端、无调整、长度不含自身）。
    pub fn new(length_field_length: usize) -> Result<Self> {
        Self::with_config(PrependerConfig {
            length_field_length,
            ..PrependerConfig::default()
        })
    }

    /// 以完整配置创建。
    pub fn with_config(config: PrependerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// 当前配置。
    pub fn config(&self) -> &PrependerConfig {
        &self.config
    }

    fn frame_length(&self, payload_len: usize) -> Result<u64> {
        let width = self.config.length_field_length;
        let mut length = payload_len as i128 + i128::from(self.config.length_adjustment);
        if self.config.length_includes_length_field {
            length += width as i128;
        }
        if length < 0 {
            return Err(ChannelError::encoder_message(format!(
                "Adjusted frame length ({length}) is less than zero"
            )));
        }
        let (limit, kind) = match width {
            1 => (1_i128 << 8, "a byte"),
            2 => (1_i128 << 16, "a short integer"),
            3 => (1_i128 << 24, "a medium integer"),
            4 => (1_i128 << 32, "an integer"),
            _ => (1_i128 << 63, "a long integer"),
        };
        if length >= limit {
            return Err(ChannelError::encoder_message(format!(
                "length does not fit into {kind}: {length}"
            )));
        }
        Ok(length as u64)
    }
}

impl MessageEncoder for LengthFieldPrepender {
    fn encoded_len_hint(&self, message: &PipelineMessage) -> usize {
        self.config.length_field_length + message.as_bytes().map_or(0, |bytes| bytes.len())
    }

    fn encode(&self, message: PipelineMessage, out: &mut BytesMut) -> Result<()> {
        let payload = message
            .into_bytes()
            .map_err(|_| ChannelError::encoder_message("length prepender only encodes byte messages"))?;
        let length = self.frame_length(payload.len())?;
        self.config
            .byte_order
            .write(out, length, self.config.length_field_length);
        out.extend_from_slice(&payload);
        Ok(())
    }
}
