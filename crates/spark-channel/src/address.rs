//! 通道地址模型。
//!
//! # 教案式说明
//! - **意图 (Why)**：`bind` / `connect` 需要一个与具体传输无关的地址类型；进程内传输使用字符串名称，
//!   套接字适配器使用 `std::net::SocketAddr`。
//! - **契约 (What)**：[`SocketAddress`] 可克隆、可比较、可哈希，`Display` 输出形如 `local:echo` 或 `127.0.0.1:80`。
//! - **风险 (Trade-offs)**：枚举是封闭的，新增地址族需要修改本模块；换来的是传输实现可以用 `match` 精确拒绝不支持的地址。

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;

/// 进程内传输的地址，以名称标识。
///
/// [`LocalAddress::ANY`] 表示“由注册表分配一个临时名称”。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalAddress {
    id: Cow<'static, str>,
}

impl LocalAddress {
    /// 通配地址：绑定时由注册表分配临时名称。
    pub const ANY: LocalAddress = LocalAddress {
        id: Cow::Borrowed("ANY"),
    };

    /// 以名称构造地址；名称会去除首尾空白并转为小写。
    pub fn new(id: impl AsRef<str>) -> Self {
        let id = id.as_ref().trim().to_ascii_lowercase();
        Self { id: Cow::Owned(id) }
    }

    /// 以静态名称构造地址，不做规范化。
    pub const fn from_static(id: &'static str) -> Self {
        Self {
            id: Cow::Borrowed(id),
        }
    }

    /// 临时地址，形如 `local:E1f`。
    ///
    /// 名称以大写 `E` 开头，而 [`LocalAddress::new`] 的结果总是小写，两者不会冲突。
    pub fn ephemeral(serial: u64) -> Self {
        Self {
            id: Cow::Owned(format!("E{serial:x}")),
        }
    }

    /// 返回地址名称。
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 是否为通配地址。
    pub fn is_any(&self) -> bool {
        self.id == "ANY"
    }
}

impl fmt::Display for LocalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}", self.id)
    }
}

/// 通道可使用的地址族。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SocketAddress {
    /// 进程内地址。
    Local(LocalAddress),
    /// IP 套接字地址，供套接字适配器使用。
    Inet(SocketAddr),
}

impl SocketAddress {
    /// 若为进程内地址则返回其引用。
    pub fn as_local(&self) -> Option<&LocalAddress> {
        match self {
            Self::Local(address) => Some(address),
            Self::Inet(_) => None,
        }
    }
}

impl From<LocalAddress> for SocketAddress {
    fn from(value: LocalAddress) -> Self {
        Self::Local(value)
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(value: SocketAddr) -> Self {
        Self::Inet(value)
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(address) => address.fmt(f),
            Self::Inet(address) => address.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addresses_are_normalised() {
        let address = LocalAddress::new("  Echo ");
        assert_eq!(address.id(), "echo");
        assert_eq!(address.to_string(), "local:echo");
        assert!(LocalAddress::ANY.is_any());
        assert!(!address.is_any());
        assert_eq!(LocalAddress::ephemeral(31).to_string(), "local:E1f");
        assert_ne!(LocalAddress::ephemeral(0xe), LocalAddress::new("Ee"));
    }

    #[test]
    fn socket_address_conversions() {
        let local: SocketAddress = LocalAddress::new("a").into();
        assert_eq!(local.as_local().map(LocalAddress::id), Some("a"));
        let inet: SocketAddress = "127.0.0.1:80".parse::<SocketAddr>().map(Into::into).unwrap();
        assert!(inet.as_local().is_none());
        assert_eq!(inet.to_string(), "127.0.0.1:80");
    }
}
