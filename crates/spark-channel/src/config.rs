//! 通道与事件循环配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：水位、连接超时、自动读等参数既要能被代码构造，也要能从配置文件（TOML/JSON）加载；
//!   前者使用强类型 [`ChannelConfig`]，后者使用纯数据的 [`ChannelOptions`]。
//! - **逻辑 (How)**：`ChannelConfig::apply_options` 把可选字段逐项覆盖到现有配置并重新校验水位；
//!   通道内部以 `ArcSwap` 持有配置，任意线程都可以无锁读取快照。
//! - **契约 (What)**：`WriteBufferWaterMark` 保证 `low <= high`；`connect_timeout` 为零表示不设超时。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::buffer::{BufferAllocator, HeapBufferAllocator};
use crate::error::{ChannelError, Result};
use crate::event_loop::TaskPanic;
use crate::message::{DefaultMessageSizeEstimator, MessageSizeEstimator};

/// 默认低水位：32 KiB。
pub const DEFAULT_LOW_WATER_MARK: usize = 32 * 1024;
/// 默认高水位：64 KiB。
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// 出站缓冲的高/低水位。
///
/// 待写字节数超过 `high` 时通道变为不可写，回落到 `low` 及以下时恢复可写；
/// 两个阈值之间的区间构成滞回带，避免可写性在每个字节上来回抖动。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteBufferWaterMark {
    low: usize,
    high: usize,
}

impl WriteBufferWaterMark {
    /// 创建水位，要求 `low <= high`。
    pub fn new(low: usize, high: usize) -> Result<Self> {
        if low > high {
            return Err(ChannelError::illegal_argument(format!(
                "write buffer high water mark ({high}) must be >= low water mark ({low})"
            )));
        }
        Ok(Self { low, high })
    }

    /// 低水位。
    pub fn low(&self) -> usize {
        self.low
    }

    /// 高水位。
    pub fn high(&self) -> usize {
        self.high
    }
}

impl Default for WriteBufferWaterMark {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATER_MARK,
            high: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// 通道运行参数。
#[derive(Clone)]
pub struct ChannelConfig {
    water_mark: WriteBufferWaterMark,
    connect_timeout: Duration,
    auto_read: bool,
    max_messages_per_read: usize,
    allocator: Arc<dyn BufferAllocator>,
    estimator: Arc<dyn MessageSizeEstimator>,
}

impl ChannelConfig {
    /// 水位。
    pub fn water_mark(&self) -> WriteBufferWaterMark {
        self.water_mark
    }

    /// 设置水位。
    pub fn with_water_mark(mut self, water_mark: WriteBufferWaterMark) -> Self {
        self.water_mark = water_mark;
        self
    }

    /// 连接超时，零表示不设超时。
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// 设置连接超时。
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 是否在激活与读完成后自动请求下一次读取。
    pub fn auto_read(&self) -> bool {
        self.auto_read
    }

    /// 设置自动读。
    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    /// 单次读循环最多投递的消息数。
    pub fn max_messages_per_read(&self) -> usize {
        self.max_messages_per_read
    }

    /// 设置单次读循环的消息上限，至少为 1。
    pub fn with_max_messages_per_read(mut self, max: usize) -> Self {
        self.max_messages_per_read = max.max(1);
        self
    }

    /// 缓冲分配器。
    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.allocator
    }

    /// 替换缓冲分配器。
    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// 消息大小估算器。
    pub fn estimator(&self) -> &Arc<dyn MessageSizeEstimator> {
        &self.estimator
    }

    /// 替换消息大小估算器。
    pub fn with_estimator(mut self, estimator: Arc<dyn MessageSizeEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// 把纯数据选项覆盖到当前配置上。
    ///
    /// # 契约 (What)
    /// - 未出现的字段保持原值；
    /// - 水位在覆盖后整体校验，单独调整一侧导致 `low > high` 时返回 `IllegalArgument`。
    pub fn apply_options(&self, options: &ChannelOptions) -> Result<Self> {
        let mut next = self.clone();
        let low = options
            .write_buffer_low_water_mark
            .unwrap_or(self.water_mark.low);
        let high = options
            .write_buffer_high_water_mark
            .unwrap_or(self.water_mark.high);
        next.water_mark = WriteBufferWaterMark::new(low, high)?;
        if let Some(ms) = options.connect_timeout_ms {
            next.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(auto_read) = options.auto_read {
            next.auto_read = auto_read;
        }
        if let Some(max) = options.max_messages_per_read {
            next = next.with_max_messages_per_read(max);
        }
        Ok(next)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            water_mark: WriteBufferWaterMark::default(),
            connect_timeout: Duration::from_secs(30),
            auto_read: true,
            max_messages_per_read: 16,
            allocator: Arc::new(HeapBufferAllocator),
            estimator: Arc::new(DefaultMessageSizeEstimator::default()),
        }
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("water_mark", &self.water_mark)
            .field("connect_timeout", &self.connect_timeout)
            .field("auto_read", &self.auto_read)
            .field("max_messages_per_read", &self.max_messages_per_read)
            .finish_non_exhaustive()
    }
}

/// 可从配置文件加载的通道选项。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelOptions {
    pub write_buffer_low_water_mark: Option<usize>,
    pub write_buffer_high_water_mark: Option<usize>,
    pub connect_timeout_ms: Option<u64>,
    pub auto_read: Option<bool>,
    pub max_messages_per_read: Option<usize>,
}

/// 事件循环任务 panic 时的回调。
pub type TaskPanicHandler = Arc<dyn Fn(&TaskPanic) + Send + Sync>;

/// 事件循环参数。
#[derive(Clone)]
pub struct EventLoopConfig {
    pub(crate) name: String,
    pub(crate) quiet_period: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) max_reentrant_depth: usize,
    pub(crate) panic_handler: Option<TaskPanicHandler>,
}

impl EventLoopConfig {
    /// 以线程名构造默认配置。
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// 线程名。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 设置优雅关闭的默认静默期与超时。
    pub fn with_shutdown(mut self, quiet_period: Duration, timeout: Duration) -> Self {
        self.quiet_period = quiet_period;
        self.shutdown_timeout = timeout.max(quiet_period);
        self
    }

    /// 设置可重入深度上限（本地传输的读递归保护使用）。
    pub fn with_max_reentrant_depth(mut self, depth: usize) -> Self {
        self.max_reentrant_depth = depth;
        self
    }

    /// 可重入深度上限。
    pub fn max_reentrant_depth(&self) -> usize {
        self.max_reentrant_depth
    }

    /// 注入任务 panic 回调，替换默认的 `tracing::error!`。
    pub fn with_panic_handler(mut self, handler: TaskPanicHandler) -> Self {
        self.panic_handler = Some(handler);
        self
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            name: "spark-event-loop".to_owned(),
            quiet_period: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(15),
            max_reentrant_depth: 8,
            panic_handler: None,
        }
    }
}

impl fmt::Debug for EventLoopConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopConfig")
            .field("name", &self.name)
            .field("quiet_period", &self.quiet_period)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("max_reentrant_depth", &self.max_reentrant_depth)
            .field("panic_handler", &self.panic_handler.is_some())
            .finish()
    }
}
