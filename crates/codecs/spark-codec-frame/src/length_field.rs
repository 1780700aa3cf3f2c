use bytes::{Buf, BytesMut};
use spark_channel::{ChannelError, PipelineMessage, Result};
use tracing::debug;

use crate::config::LengthFieldConfig;
use crate::decoder::FrameDecoder;

/// 按长度字段切分帧的解码器。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 覆盖绝大多数“头部带长度”的二进制协议：长度字段可以位于任意偏移，宽度与字节序可配置，
///   长度值可以包含或不包含头部，靠 `length_adjustment` 统一换算。
///
/// ## 逻辑 (How)
/// 1. 处于超长帧丢弃模式时先跳过尚需丢弃的字节，丢弃完成后（或 fail-fast 下首次检测时）报告超长；
/// 2. 缓冲不足头部长度时等待；
/// 3. 读取长度字段，64 位字段为负时报告帧损坏；
/// 4. 调整后帧长 = 原始值 + `length_adjustment` + 头部末端偏移，小于头部末端偏移时报告帧损坏；
/// 5. 剥离前导字节后的输出长度超过上限时跳过已缓冲的部分，剩余部分记入丢弃计数；
/// 6. 整帧未到齐时等待（已解析的帧长会被缓存，下次无需重新解析头部）；
/// 7. 剥离前导字节后切出帧并推进读游标。
///
/// ## 契约 (What)
/// - 输出的每一帧都是 `PipelineMessage::Bytes`，与累积缓冲共享底层内存，不发生拷贝；
/// - 错误发生时已消费的字节不会回退，解码器状态保持一致，下一次读取从下一帧继续。
///
/// ## 风险 (Trade-offs)
/// - 非 fail-fast 模式下超长帧要等到全部丢弃后才报告，期间对端可以继续发送大量无用字节。
#[derive(Debug)]
pub struct LengthFieldBasedFrameDecoder {
    config: LengthFieldConfig,
    length_field_end_offset: usize,
    discarding_too_long_frame: bool,
    too_long_frame_length: u64,
    bytes_to_discard: u64,
    pending_frame_length: Option<usize>,
}

impl LengthFieldBasedFrameDecoder {
    /// 以上限、长度字段偏移与宽度创建解码器，其余参数取默认值。
    ///
    /// 输出帧会剥离 `[0, length_field_offset + length_field_length)` 的头部，只保留载荷；
    /// 上限约束的是载荷长度，长度不超过 `max_frame_length` 的载荷都能解出。
    pub fn new(
        max_frame_length: usize,
        length_field_offset: usize,
        length_field_length: usize,
    ) -> Result<Self> {
        Self::with_config(LengthFieldConfig {
            max_frame_length,
            length_field_offset,
            length_field_length,
            initial_bytes_to_strip: length_field_offset + length_field_length,
            ..LengthFieldConfig::default()
        })
    }

    /// 以完整配置创建解码器。
    pub fn with_config(config: LengthFieldConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            length_field_end_offset: config.length_field_end_offset(),
            config,
            discarding_too_long_frame: false,
            too_long_frame_length: 0,
            bytes_to_discard: 0,
            pending_frame_length: None,
        })
    }

    /// 当前配置。
    pub fn config(&self) -> &LengthFieldConfig {
        &self.config
    }

    /// 是否处于超长帧丢弃模式。
    pub fn is_discarding(&self) -> bool {
        self.discarding_too_long_frame
    }

    fn discard_too_long_frame(&mut self, input: &mut BytesMut) -> Result<()> {
        let local = (input.len() as u64).min(self.bytes_to_discard);
        input.advance(local as usize);
        self.bytes_to_discard -= local;
        self.fail_if_necessary(false)
    }

    fn exceeded_frame_length(&mut self, input: &mut BytesMut, frame_length: u64) -> Result<()> {
        let buffered = input.len() as u64;
        self.too_long_frame_length = frame_length;
        if frame_length <= buffered {
            input.advance(frame_length as usize);
        } else {
            self.discarding_too_long_frame = true;
            self.bytes_to_discard = frame_length - buffered;
            input.clear();
        }
        debug!(
            frame_length,
            max_frame_length = self.config.max_frame_length,
            remaining = self.bytes_to_discard,
            "discarding a frame that exceeds the maximum length"
        );
        self.fail_if_necessary(true)
    }

    fn fail_if_necessary(&mut self, first_detection: bool) -> Result<()> {
        if self.bytes_to_discard == 0 {
            let too_long = std::mem::take(&mut self.too_long_frame_length);
            self.discarding_too_long_frame = false;
            if !self.config.fail_fast || first_detection {
                return Err(self.too_long(too_long, true));
            }
        } else if self.config.fail_fast && first_detection {
            return Err(self.too_long(self.too_long_frame_length, false));
        }
        Ok(())
    }

    fn too_long(&self, frame_length: u64, discarded: bool) -> ChannelError {
        let max = self.config.max_frame_length;
        if discarded {
            ChannelError::too_long_frame(format!(
                "Adjusted frame length exceeds {max}: {frame_length} - discarded"
            ))
        } else {
            ChannelError::too_long_frame(format!(
                "Adjusted frame length exceeds {max}: {frame_length} - discarding"
            ))
        }
    }

    /// 解析帧头；头部不完整时返回 `None`，超长帧进入丢弃流程后同样返回 `None`。
    fn read_frame_length(&mut self, input: &mut BytesMut) -> Result<Option<usize>> {
        if self.discarding_too_long_frame {
            self.discard_too_long_frame(input)?;
        }
        let end_offset = self.length_field_end_offset;
        if input.len() < end_offset {
            return Ok(None);
        }
        let width = self.config.length_field_length;
        let offset = self.config.length_field_offset;
        let raw = self.config.byte_order.read(&input[offset..end_offset], width);
        let unadjusted = if width == 8 {
            i128::from(raw as i64)
        } else {
            i128::from(raw)
        };
        if unadjusted < 0 {
            input.advance(end_offset);
            return Err(ChannelError::corrupted_frame(format!(
                "negative pre-adjustment length field: {unadjusted}"
            )));
        }
        let frame_length =
            unadjusted + i128::from(self.config.length_adjustment) + end_offset as i128;
        if frame_length < end_offset as i128 {
            input.advance(end_offset);
            return Err(ChannelError::corrupted_frame(format!(
                "Adjusted frame length ({frame_length}) is less than lengthFieldEndOffset: {end_offset}"
            )));
        }
        let emitted = frame_length - self.config.initial_bytes_to_strip as i128;
        if emitted > self.config.max_frame_length as i128 {
            let frame_length = u64::try_from(frame_length).unwrap_or(u64::MAX);
            self.exceeded_frame_length(input, frame_length)?;
            return Ok(None);
        }
        // 帧长不超过 max + strip，可以放进 usize。
        usize::try_from(frame_length)
            .map(Some)
            .map_err(|_| ChannelError::corrupted_frame(format!("frame length overflow: {frame_length}")))
    }
}

impl FrameDecoder for LengthFieldBasedFrameDecoder {
    fn decode(&mut self, input: &mut BytesMut) -> Result<Option<PipelineMessage>> {
        let frame_length = match self.pending_frame_length {
            Some(length) => length,
            None => match self.read_frame_length(input)? {
                Some(length) => {
                    self.pending_frame_length = Some(length);
                    length
                }
                None => return Ok(None),
            },
        };
        if input.len() < frame_length {
            return Ok(None);
        }
        self.pending_frame_length = None;
        let strip = self.config.initial_bytes_to_strip;
        if strip > frame_length {
            input.advance(frame_length);
            return Err(ChannelError::corrupted_frame(format!(
                "Adjusted frame length ({frame_length}) is less than initialBytesToStrip: {strip}"
            )));
        }
        let mut frame = input.split_to(frame_length);
        frame.advance(strip);
        Ok(Some(PipelineMessage::Bytes(frame.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteOrder;
    use tracing_test::traced_test;

    fn frame_bytes(message: Option<PipelineMessage>) -> Vec<u8> {
        message
            .and_then(|message| message.as_bytes().map(|bytes| bytes.to_vec()))
            .expect("a byte frame")
    }

    fn le_header(length: u32) -> BytesMut {
        BytesMut::from(&length.to_le_bytes()[..])
    }

    #[test]
    fn waits_for_header_and_body_then_strips_the_header() {
        let mut decoder = LengthFieldBasedFrameDecoder::new(64, 0, 4).expect("valid config");
        let mut input = BytesMut::from(&[5_u8, 0][..]);
        assert!(decoder.decode(&mut input).expect("partial header").is_none());
        input.extend_from_slice(&[0, 0, b'h', b'e']);
        assert!(decoder.decode(&mut input).expect("partial body").is_none());
        input.extend_from_slice(b"llo+");
        assert_eq!(frame_bytes(decoder.decode(&mut input).expect("frame")), b"hello");
        assert_eq!(&input[..], b"+");
    }

    #[test]
    fn fail_fast_reports_on_the_header_without_waiting_for_the_body() {
        let mut decoder = LengthFieldBasedFrameDecoder::new(20, 0, 4).expect("valid config");
        let mut input = le_header(1000);
        input.extend_from_slice(&[0xAA; 12]);
        let error = decoder.decode(&mut input).expect_err("too long");
        assert_eq!(error.code(), "spark.codec.too_long_frame");
        assert_eq!(
            error.to_string(),
            "too long frame: Adjusted frame length exceeds 20: 1004 - discarding"
        );
        assert!(input.is_empty());
        assert!(decoder.is_discarding());

        // 剩余 988 字节被静默丢弃，之后的帧照常解出。
        let mut rest = BytesMut::from(&[0xAA; 988][..]);
        rest.extend_from_slice(&le_header(2));
        rest.extend_from_slice(b"ok");
        assert_eq!(frame_bytes(decoder.decode(&mut rest).expect("next frame")), b"ok");
        assert!(!decoder.is_discarding());
    }

    #[test]
    #[traced_test]
    fn lazy_mode_reports_after_the_whole_frame_is_discarded() {
        let config = LengthFieldConfig {
            max_frame_length: 16,
            fail_fast: false,
            ..LengthFieldConfig::default()
        };
        let mut decoder = LengthFieldBasedFrameDecoder::with_config(config).expect("valid config");
        let mut input = le_header(30);
        input.extend_from_slice(&[0; 10]);
        assert!(decoder.decode(&mut input).expect("still discarding").is_none());
        assert!(logs_contain("discarding a frame that exceeds the maximum length"));
        let mut rest = BytesMut::from(&[0_u8; 20][..]);
        let error = decoder.decode(&mut rest).expect_err("discard complete");
        assert!(error.to_string().ends_with("exceeds 16: 34 - discarded"));
        assert!(rest.is_empty());
    }

    #[test]
    fn a_too_long_frame_that_is_fully_buffered_is_skipped_at_once() {
        let mut decoder = LengthFieldBasedFrameDecoder::new(8, 0, 4).expect("valid config");
        let mut input = le_header(9);
        input.extend_from_slice(b"abcdefghi");
        input.extend_from_slice(&le_header(1));
        input.extend_from_slice(b"z");
        let error = decoder.decode(&mut input).expect_err("too long");
        assert!(error.to_string().ends_with("- discarded"));
        assert!(!decoder.is_discarding());
        assert_eq!(frame_bytes(decoder.decode(&mut input).expect("next")), b"z");
    }

    #[test]
    fn payloads_up_to_the_maximum_decode_and_one_more_byte_does_not() {
        let max = 20_usize;
        for length in max - 4..=max {
            let mut decoder = LengthFieldBasedFrameDecoder::new(max, 0, 4).expect("valid config");
            let payload = vec![length as u8; length];
            let mut input = le_header(length as u32);
            input.extend_from_slice(&payload);
            assert_eq!(
                frame_bytes(decoder.decode(&mut input).expect("within the limit")),
                payload,
                "payload of {length} bytes"
            );
            assert!(input.is_empty());
        }

        let mut decoder = LengthFieldBasedFrameDecoder::new(max, 0, 4).expect("valid config");
        let mut input = le_header(max as u32 + 1);
        input.extend_from_slice(&[0; 21]);
        let error = decoder.decode(&mut input).expect_err("one byte over");
        assert_eq!(
            error.to_string(),
            "too long frame: Adjusted frame length exceeds 20: 25 - discarded"
        );
    }

    #[test]
    fn without_stripping_the_limit_covers_the_header() {
        let config = LengthFieldConfig {
            max_frame_length: 8,
            initial_bytes_to_strip: 0,
            ..LengthFieldConfig::default()
        };
        let mut decoder = LengthFieldBasedFrameDecoder::with_config(config).expect("valid config");
        let mut input = le_header(4);
        input.extend_from_slice(b"fits");
        assert_eq!(frame_bytes(decoder.decode(&mut input).expect("frame")).len(), 8);

        let mut input = le_header(5);
        input.extend_from_slice(b"spill");
        assert!(decoder.decode(&mut input).is_err());
    }

    #[test]
    fn header_fields_with_offset_adjustment_and_big_endian() {
        // [type:1][len:2 BE, counts the whole frame][payload]
        let config = LengthFieldConfig {
            byte_order: ByteOrder::BigEndian,
            max_frame_length: 256,
            length_field_offset: 1,
            length_field_length: 2,
            length_adjustment: -3,
            initial_bytes_to_strip: 0,
            fail_fast: true,
        };
        let mut decoder = LengthFieldBasedFrameDecoder::with_config(config).expect("valid config");
        let mut input = BytesMut::from(&[0x7F, 0x00, 0x05, b'h', b'i'][..]);
        assert_eq!(
            frame_bytes(decoder.decode(&mut input).expect("frame")),
            [0x7F, 0x00, 0x05, b'h', b'i']
        );
        assert!(input.is_empty());
    }

    #[test]
    fn corrupted_lengths_are_rejected_and_skipped() {
        let config = LengthFieldConfig {
            length_field_length: 8,
            initial_bytes_to_strip: 8,
            ..LengthFieldConfig::default()
        };
        let mut decoder = LengthFieldBasedFrameDecoder::with_config(config).expect("valid config");
        let mut input = BytesMut::from(&(-1_i64).to_le_bytes()[..]);
        let error = decoder.decode(&mut input).expect_err("negative");
        assert_eq!(error.code(), "spark.codec.corrupted_frame");
        assert!(input.is_empty());

        let shrinking = LengthFieldConfig {
            length_adjustment: -10,
            ..LengthFieldConfig::default()
        };
        let mut decoder = LengthFieldBasedFrameDecoder::with_config(shrinking).expect("valid config");
        let mut input = le_header(2);
        let error = decoder.decode(&mut input).expect_err("shorter than header");
        assert!(error.to_string().contains("is less than lengthFieldEndOffset: 4"));

        let over_strip = LengthFieldConfig {
            initial_bytes_to_strip: 6,
            ..LengthFieldConfig::default()
        };
        let mut decoder = LengthFieldBasedFrameDecoder::with_config(over_strip).expect("valid config");
        let mut input = le_header(1);
        input.extend_from_slice(b"x");
        let error = decoder.decode(&mut input).expect_err("strip too large");
        assert!(error.to_string().contains("is less than initialBytesToStrip: 6"));
        assert!(input.is_empty());
    }

    #[test]
    fn three_byte_length_fields_are_supported() {
        let mut decoder = LengthFieldBasedFrameDecoder::new(1 << 20, 0, 3).expect("valid config");
        let mut input = BytesMut::from(&[3_u8, 0, 0][..]);
        input.extend_from_slice(b"abc");
        assert_eq!(frame_bytes(decoder.decode(&mut input).expect("frame")), b"abc");
    }
}
