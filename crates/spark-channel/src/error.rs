//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义通道运行时对外暴露的全部错误语义：连接生命周期、流水线结构变更、事件循环调度与帧编解码；
//! - 每个变体携带稳定错误码（`spark.channel.*` / `spark.codec.*`），便于日志检索与告警聚合。
//!
//! ## 设计要求（What）
//! - 错误需要同时交给多个监听者（Promise 监听器、`exception_caught`），因此 [`ChannelError`] 必须可 `Clone`；
//!   携带任意底层原因时统一收敛为 `Arc<dyn Error + Send + Sync>`；
//! - 出站调用的失败写入对应 Promise；入站处理的失败转化为 `exception_caught` 事件，绝不抛回调度循环。

use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::address::SocketAddress;

/// 通道运行时统一的结果别名。
pub type Result<T, E = ChannelError> = std::result::Result<T, E>;

/// 可共享的底层错误原因。
pub type SharedCause = Arc<dyn StdError + Send + Sync + 'static>;

/// 通道运行时错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把连接、调度、流水线与编解码的失败收敛到同一枚举，调用方只需匹配一种类型即可完成降级决策。
/// - **契约 (What)**：
///   - 所有变体满足 `Send + Sync + 'static`，可跨线程传播并被多个监听者克隆；
///   - [`ChannelError::code`] 返回稳定错误码，文案可以演进但错误码保持不变；
///   - `Decoder` / `Encoder` 包装任意处理器或编解码器抛出的异常。
/// - **设计权衡 (Trade-offs)**：上下文使用 `String` 保存，牺牲少量堆分配换取可读性；
///   热路径上的常见错误（如关闭）只携带 `&'static str`。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// 通道已关闭，或写入时对端已经关闭。
    #[error("channel closed: {context}")]
    ConnectionClosed { context: &'static str },

    /// 连接在超时时间内没有完成。
    #[error("connection timed out after {timeout:?}: {remote}")]
    ConnectTimeout {
        remote: SocketAddress,
        timeout: Duration,
    },

    /// 通道已处于连接状态，拒绝再次连接。
    #[error("channel is already connected")]
    AlreadyConnected,

    /// 上一次连接尝试尚未完成。
    #[error("a connection attempt is already pending")]
    ConnectionPending,

    /// 目标地址没有可接受连接的服务端。
    #[error("connection refused: {remote}")]
    ConnectionRefused { remote: SocketAddress },

    /// 在连接建立之前尝试写出数据。
    #[error("channel is not yet connected")]
    NotYetConnected,

    /// 通道尚未注册到事件循环。
    #[error("channel is not registered to an event loop")]
    NotRegistered,

    /// 通道已经注册到事件循环。
    #[error("channel is already registered to an event loop")]
    AlreadyRegistered,

    /// 传输实现与事件循环不兼容，或试图迁移到另一个事件循环。
    #[error("incompatible event loop: {context}")]
    IncompatibleEventLoop { context: String },

    /// 地址已被其他通道占用。
    #[error("address already in use: {address}")]
    AddressInUse { address: SocketAddress },

    /// 传输实现不支持该地址类型。
    #[error("unsupported address type: {address}")]
    UnsupportedAddress { address: SocketAddress },

    /// 传输实现不支持该操作或消息类型。
    #[error("unsupported operation: {context}")]
    UnsupportedOperation { context: String },

    /// 事件循环正在关闭或已终止，拒绝新的外部任务。
    #[error("event loop `{event_loop}` rejected the task: shutting down")]
    Rejected { event_loop: String },

    /// 在 Promise 绑定的事件循环线程上同步等待，必然死锁。
    #[error("blocking wait on the event loop thread that completes this future")]
    BlockingOperation,

    /// Promise 被取消。
    #[error("operation cancelled")]
    Cancelled,

    /// 流水线中已存在同名处理器。
    #[error("duplicate handler name: {name}")]
    DuplicateHandler { name: String },

    /// 流水线中找不到指定处理器。
    #[error("no such handler: {name}")]
    NoSuchHandler { name: String },

    /// 处理器回调发生 panic，已在调用边界被捕获。
    #[error("handler `{handler}` panicked: {message}")]
    HandlerPanicked { handler: String, message: String },

    /// 通过 `submit` 提交的任务发生 panic。
    #[error("task panicked: {message}")]
    TaskPanicked { message: String },

    /// 调用顺序或状态不满足前置条件。
    #[error("illegal state: {context}")]
    IllegalState { context: String },

    /// 参数不合法（水位、长度字段宽度等）。
    #[error("illegal argument: {context}")]
    IllegalArgument { context: String },

    /// 帧结构损坏：负长度、调整后长度小于头部、剥离字节数超过帧长等。
    #[error("corrupted frame: {message}")]
    CorruptedFrame { message: String },

    /// 帧长度超过配置上限。
    #[error("too long frame: {message}")]
    TooLongFrame { message: String },

    /// 解码路径上的意外失败。
    #[error("decoder failure: {message}")]
    Decoder {
        message: String,
        #[source]
        source: Option<SharedCause>,
    },

    /// 编码路径上的意外失败。
    #[error("encoder failure: {message}")]
    Encoder {
        message: String,
        #[source]
        source: Option<SharedCause>,
    },
}

impl ChannelError {
    /// 构造“通道已关闭”错误。
    pub const fn closed(context: &'static str) -> Self {
        Self::ConnectionClosed { context }
    }

    /// 构造非法状态错误。
    pub fn illegal_state(context: impl Into<String>) -> Self {
        Self::IllegalState {
            context: context.into(),
        }
    }

    /// 构造非法参数错误。
    pub fn illegal_argument(context: impl Into<String>) -> Self {
        Self::IllegalArgument {
            context: context.into(),
        }
    }

    /// 构造帧损坏错误。
    pub fn corrupted_frame(message: impl Into<String>) -> Self {
        Self::CorruptedFrame {
            message: message.into(),
        }
    }

    /// 构造帧过长错误。
    pub fn too_long_frame(message: impl Into<String>) -> Self {
        Self::TooLongFrame {
            message: message.into(),
        }
    }

    /// 以任意底层错误构造解码错误。
    pub fn decoder<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Decoder {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// 构造不带底层原因的解码错误。
    pub fn decoder_message(message: impl Into<String>) -> Self {
        Self::Decoder {
            message: message.into(),
            source: None,
        }
    }

    /// 以任意底层错误构造编码错误。
    pub fn encoder<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Encoder {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// 构造不带底层原因的编码错误。
    pub fn encoder_message(message: impl Into<String>) -> Self {
        Self::Encoder {
            message: message.into(),
            source: None,
        }
    }

    /// 返回稳定错误码。
    ///
    /// # 契约 (What)
    /// - 错误码以 `spark.channel.`、`spark.event_loop.`、`spark.pipeline.` 或 `spark.codec.` 为前缀；
    /// - 同一变体的错误码在版本之间保持不变，可用于日志检索与告警规则。
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionClosed { .. } => "spark.channel.closed",
            Self::ConnectTimeout { .. } => "spark.channel.connect_timeout",
            Self::AlreadyConnected => "spark.channel.already_connected",
            Self::ConnectionPending => "spark.channel.connection_pending",
            Self::ConnectionRefused { .. } => "spark.channel.connection_refused",
            Self::NotYetConnected => "spark.channel.not_yet_connected",
            Self::NotRegistered => "spark.channel.not_registered",
            Self::AlreadyRegistered => "spark.channel.already_registered",
            Self::IncompatibleEventLoop { .. } => "spark.channel.incompatible_event_loop",
            Self::AddressInUse { .. } => "spark.channel.address_in_use",
            Self::UnsupportedAddress { .. } => "spark.channel.unsupported_address",
            Self::UnsupportedOperation { .. } => "spark.channel.unsupported_operation",
            Self::Rejected { .. } => "spark.event_loop.rejected",
            Self::BlockingOperation => "spark.event_loop.blocking_operation",
            Self::Cancelled => "spark.channel.cancelled",
            Self::DuplicateHandler { .. } => "spark.pipeline.duplicate_handler",
            Self::NoSuchHandler { .. } => "spark.pipeline.no_such_handler",
            Self::HandlerPanicked { .. } => "spark.pipeline.handler_panicked",
            Self::TaskPanicked { .. } => "spark.event_loop.task_panicked",
            Self::IllegalState { .. } => "spark.channel.illegal_state",
            Self::IllegalArgument { .. } => "spark.channel.illegal_argument",
            Self::CorruptedFrame { .. } => "spark.codec.corrupted_frame",
            Self::TooLongFrame { .. } => "spark.codec.too_long_frame",
            Self::Decoder { .. } => "spark.codec.decoder_failure",
            Self::Encoder { .. } => "spark.codec.encoder_failure",
        }
    }

    /// 是否属于解码类错误（帧损坏、帧过长与通用解码失败）。
    pub fn is_decoder_error(&self) -> bool {
        matches!(
            self,
            Self::CorruptedFrame { .. } | Self::TooLongFrame { .. } | Self::Decoder { .. }
        )
    }

    /// 是否为取消。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 是否表示通道已关闭。
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}

/// 把 `catch_unwind` 捕获的 panic 载荷还原成可读文本。
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_prefixed() {
        let errors = [
            ChannelError::closed("write"),
            ChannelError::AlreadyConnected,
            ChannelError::ConnectionPending,
            ChannelError::too_long_frame("x"),
            ChannelError::corrupted_frame("y"),
            ChannelError::decoder_message("z"),
            ChannelError::encoder_message("w"),
        ];
        for error in errors {
            assert!(error.code().starts_with("spark."), "{}", error.code());
        }
        assert_eq!(
            ChannelError::closed("close").code(),
            "spark.channel.closed"
        );
    }

    #[test]
    fn decoder_classification_covers_frame_errors() {
        assert!(ChannelError::too_long_frame("x").is_decoder_error());
        assert!(ChannelError::corrupted_frame("x").is_decoder_error());
        assert!(!ChannelError::encoder_message("x").is_decoder_error());
    }

    #[test]
    fn wrapped_source_is_exposed() {
        let io = std::io::Error::other("boom");
        let error = ChannelError::decoder("decode failed", io);
        let source = error.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("boom"));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
