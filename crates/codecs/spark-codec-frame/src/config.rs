use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use spark_channel::{ChannelError, Result};

use crate::SUPPORTED_LENGTH_FIELD_WIDTHS;

/// 长度字段的字节序。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// 小端（默认）。
    #[default]
    LittleEndian,
    /// 大端（网络字节序）。
    BigEndian,
}

impl ByteOrder {
    /// 从 `src` 的开头读取 `width` 字节的无符号整数。
    pub(crate) fn read(self, mut src: &[u8], width: usize) -> u64 {
        match self {
            Self::LittleEndian => src.get_uint_le(width),
            Self::BigEndian => src.get_uint(width),
        }
    }

    /// 向 `dst` 追加 `width` 字节的无符号整数。
    pub(crate) fn write(self, dst: &mut impl BufMut, value: u64, width: usize) {
        match self {
            Self::LittleEndian => dst.put_uint_le(value, width),
            Self::BigEndian => dst.put_uint(value, width),
        }
    }
}

/// [`LengthFieldBasedFrameDecoder`](crate::LengthFieldBasedFrameDecoder) 的参数。
///
/// 默认值对应参考线格式：偏移 0、宽度 4、无调整、剥离长度字段、上限 1 MiB、小端。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LengthFieldConfig {
    /// 长度字段的字节序。
    pub byte_order: ByteOrder,
    /// 剥离 `initial_bytes_to_strip` 之后的帧长上限，超过即为超长帧。
    pub max_frame_length: usize,
    /// 长度字段相对帧起点的偏移。
    pub length_field_offset: usize,
    /// 长度字段宽度，取 1/2/3/4/8。
    pub length_field_length: usize,
    /// 加到长度字段值上的修正量。
    pub length_adjustment: i64,
    /// 输出帧前剥离的字节数。
    pub initial_bytes_to_strip: usize,
    /// 为真时读到超长的头部立即失败，否则丢弃完整个帧之后再失败。
    pub fail_fast: bool,
}

impl Default for LengthFieldConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::LittleEndian,
            max_frame_length: 1024 * 1024,
            length_field_offset: 0,
            length_field_length: 4,
            length_adjustment: 0,
            initial_bytes_to_strip: 4,
            fail_fast: true,
        }
    }
}

impl LengthFieldConfig {
    /// 长度字段末端相对帧起点的偏移。
    pub fn length_field_end_offset(&self) -> usize {
        self.length_field_offset + self.length_field_length
    }

    /// 校验参数组合。
    ///
    /// # 契约 (What)
    /// - `max_frame_length` 必须为正；
    /// - `length_field_length` 必须是 1、2、3、4 或 8；
    /// - `length_field_offset + length_field_length` 不得超过 `max_frame_length`。
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_length == 0 {
            return Err(ChannelError::illegal_argument(
                "maxFrameLength must be a positive integer: 0",
            ));
        }
        check_width(self.length_field_length)?;
        if self.length_field_offset > self.max_frame_length.saturating_sub(self.length_field_length)
        {
            return Err(ChannelError::illegal_argument(format!(
                "maxFrameLength ({}) must be equal to or greater than lengthFieldOffset ({}) + lengthFieldLength ({})",
                self.max_frame_length, self.length_field_offset, self.length_field_length
            )));
        }
        Ok(())
    }
}

/// [`LengthFieldPrepender`](crate::LengthFieldPrepender) 的参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrependerConfig {
    /// 长度字段的字节序。
    pub byte_order: ByteOrder,
    /// 长度字段宽度，取 1/2/3/4/8。
    pub length_field_length: usize,
    /// 加到载荷长度上的修正量。
    pub length_adjustment: i64,
    /// 写出的长度是否计入长度字段自身。
    pub length_includes_length_field: bool,
}

impl Default for PrependerConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::LittleEndian,
            length_field_length: 4,
            length_adjustment: 0,
            length_includes_length_field: false,
        }
    }
}

impl PrependerConfig {
    /// 校验长度字段宽度。
    pub fn validate(&self) -> Result<()> {
        check_width(self.length_field_length)
    }
}

fn check_width(width: usize) -> Result<()> {
    if SUPPORTED_LENGTH_FIELD_WIDTHS.contains(&width) {
        Ok(())
    } else {
        Err(ChannelError::illegal_argument(format!(
            "lengthFieldLength must be either 1, 2, 3, 4, or 8: {width}"
        )))
    }
}
