#![doc = r#"
# spark-transport-local

## 模块使命（Why）
- 在同一进程内把两个通道直接接成一对，不经过任何套接字；
- 用于测试流水线装配，也用于进程内组件之间以通道语义通信。

## 核心契约（What）
- [`LocalServerChannel`] 绑定到 [`LocalRegistry`] 中的一个 [`LocalAddress`](spark_channel::LocalAddress)，
  每个连接到该地址的 [`LocalChannel`] 都会得到一个子通道作为对端；
- 一端写出并冲刷的消息按顺序出现在另一端的入站队列中，恰好一次；
- 一端关闭时，对端先收到仍未读取的消息，随后关闭。

## 实现策略（How）
- 对端之间互持强引用，关闭时断开；
- 同一事件循环上的投递直接内联执行，递归深度受 [`LocalConfig::max_reader_stack_depth`] 限制，超出后编组为任务；
- 跨循环投递总是编组到对端所属循环。
"#]
#![deny(unsafe_code)]

mod channel;
mod config;
mod registry;
mod server;

pub use channel::LocalChannel;
pub use config::LocalConfig;
pub use registry::LocalRegistry;
pub use server::LocalServerChannel;
