use serde::Deserialize;

/// 本地传输的配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalConfig {
    /// 同一循环上内联投递的最大嵌套层数；超过后改为提交读取任务。
    ///
    /// 实际上限还受事件循环自身的 `max_reentrant_depth` 约束，取两者较小值。
    pub max_reader_stack_depth: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_reader_stack_depth: 8,
        }
    }
}
