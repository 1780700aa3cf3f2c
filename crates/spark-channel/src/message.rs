//! 流水线中流转的消息与用户事件。

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::channel::Channel;

/// 流水线消息。
///
/// # 教案式说明
/// - **意图 (Why)**：同一条流水线上既有字节流（解码前/编码后），也有解码后的业务对象，
///   服务端通道还会把新接受的子通道作为入站消息交给接收处理器。
/// - **契约 (What)**：
///   - `Bytes`：引用计数的不可变字节块，克隆与切片都是 O(1)；
///   - `Channel`：服务端接受的子通道；
///   - `User`：任意业务对象，由下游处理器按类型取回。
/// - **风险 (Trade-offs)**：`User` 变体需要运行时向下转型，类型错配只能在运行期发现。
pub enum PipelineMessage {
    /// 字节块。
    Bytes(Bytes),
    /// 服务端接受的子通道。
    Channel(Channel),
    /// 业务自定义对象。
    User(Box<dyn Any + Send>),
}

impl PipelineMessage {
    /// 以业务对象构造消息。
    pub fn user<T: Any + Send>(value: T) -> Self {
        Self::User(Box::new(value))
    }

    /// 若为字节块返回其引用。
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// 取出字节块；非字节消息原样返回。
    pub fn into_bytes(self) -> Result<Bytes, Self> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            other => Err(other),
        }
    }

    /// 取出子通道；其他消息原样返回。
    pub fn into_channel(self) -> Result<Channel, Self> {
        match self {
            Self::Channel(channel) => Ok(channel),
            other => Err(other),
        }
    }

    /// 按类型取回业务对象；类型不匹配时原样返回。
    pub fn downcast_user<T: Any + Send>(self) -> Result<Box<T>, Self> {
        match self {
            Self::User(value) => value.downcast::<T>().map_err(Self::User),
            other => Err(other),
        }
    }
}

impl From<Bytes> for PipelineMessage {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<&'static [u8]> for PipelineMessage {
    fn from(value: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(value))
    }
}

impl From<Vec<u8>> for PipelineMessage {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Channel(channel) => f.debug_tuple("Channel").field(&channel.id()).finish(),
            Self::User(_) => f.write_str("User(..)"),
        }
    }
}

/// 沿入站方向广播的用户事件。
pub type UserEvent = Arc<dyn Any + Send + Sync>;

/// 估算消息占用的出站字节数，驱动水位判断。
pub trait MessageSizeEstimator: Send + Sync + 'static {
    /// 返回消息的估算字节数。
    fn size(&self, message: &PipelineMessage) -> usize;
}

/// 默认估算器：字节块取可读长度，其他消息取固定值。
#[derive(Clone, Copy, Debug)]
pub struct DefaultMessageSizeEstimator {
    unknown_size: usize,
}

impl DefaultMessageSizeEstimator {
    /// 创建估算器，`unknown_size` 用于非字节消息。
    pub const fn new(unknown_size: usize) -> Self {
        Self { unknown_size }
    }
}

impl Default for DefaultMessageSizeEstimator {
    fn default() -> Self {
        Self::new(8)
    }
}

impl MessageSizeEstimator for DefaultMessageSizeEstimator {
    fn size(&self, message: &PipelineMessage) -> usize {
        match message {
            PipelineMessage::Bytes(bytes) => bytes.len(),
            _ => self.unknown_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimator_uses_readable_length_for_bytes() {
        let estimator = DefaultMessageSizeEstimator::default();
        assert_eq!(estimator.size(&PipelineMessage::from(&b"hello"[..])), 5);
        assert_eq!(estimator.size(&PipelineMessage::user(42_u32)), 8);
    }

    #[test]
    fn user_messages_downcast_by_type() {
        let message = PipelineMessage::user(String::from("payload"));
        let message = match message.downcast_user::<u32>() {
            Ok(_) => panic!("wrong type must not downcast"),
            Err(original) => original,
        };
        let value = message.downcast_user::<String>().map(|b| *b);
        assert_eq!(value.ok().as_deref(), Some("payload"));
    }
}
