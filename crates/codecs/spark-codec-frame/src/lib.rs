#![warn(missing_docs)]
#![deny(unsafe_code)]

//! `spark-codec-frame` 提供基于长度字段的分帧编解码处理器。
//!
//! # 教案背景（Why）
//! - 字节流传输只保证顺序不保证边界，协议层需要先把字节流切分为完整的帧再交给业务处理器；
//! - 长度前缀是最常见的分帧方式：`[长度字段][载荷]`，长度字段的宽度、字节序与偏移因协议而异。
//!
//! # 使用概览（How）
//! - 入站方向安装 [`ByteToMessageDecoder`] 包装的 [`LengthFieldBasedFrameDecoder`]，
//!   读到的字节块会被累积并切分为完整帧，再逐帧向后传播；
//! - 出站方向安装 [`MessageToByteEncoder`] 包装的 [`LengthFieldPrepender`]，写出的载荷会被加上长度字段；
//! - 两端的参数都可以从 [`LengthFieldConfig`] / [`PrependerConfig`] 反序列化得到（例如 TOML 配置文件）。
//!
//! # 合约说明（What）
//! - 参考线格式为 `[4 字节长度][N 字节载荷]`，长度不含自身、无调整，默认小端；
//! - 帧损坏返回 `spark.codec.corrupted_frame`，超长返回 `spark.codec.too_long_frame`，
//!   其他解码/编码失败分别包装为 `spark.codec.decoder_failure` / `spark.codec.encoder_failure`。
//!
//! # 风险提示（Trade-offs）
//! - 累积缓冲在帧不完整时持续增长，上限由 `max_frame_length` 约束；超长帧进入丢弃模式而不是缓存全部字节。

mod config;
mod cumulator;
mod decoder;
mod encoder;
mod length_field;
mod prepender;

pub use config::{ByteOrder, LengthFieldConfig, PrependerConfig};
pub use cumulator::{Cumulator, ExpandCumulator, MergeCumulator};
pub use decoder::{ByteToMessageDecoder, DEFAULT_DISCARD_AFTER_READS, FrameDecoder};
pub use encoder::{MessageEncoder, MessageToByteEncoder};
pub use length_field::LengthFieldBasedFrameDecoder;
pub use prepender::LengthFieldPrepender;

/// 长度字段允许的字节宽度。
pub const SUPPORTED_LENGTH_FIELD_WIDTHS: [usize; 5] = [1, 2, 3, 4, 8];
